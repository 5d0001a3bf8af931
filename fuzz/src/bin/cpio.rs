#[cfg(not(windows))]
mod fuzz {
    use std::sync::atomic::AtomicBool;

    use bootpatch::format::cpio;
    use honggfuzz::fuzz;

    pub fn main() {
        let cancel_signal = AtomicBool::new(false);

        loop {
            fuzz!(|data: &[u8]| {
                if let Ok(entries) = cpio::decode(data, &cancel_signal) {
                    let _ = cpio::encode(&entries, &cancel_signal);
                }
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}
