#[cfg(not(windows))]
mod fuzz {
    use bootpatch::format::footer;
    use honggfuzz::fuzz;

    pub fn main() {
        loop {
            fuzz!(|data: &[u8]| {
                if let Ok((image, trailer)) = footer::load_image(data) {
                    let _ = image.to_vec().map(|d| trailer.apply(d));
                }
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}
