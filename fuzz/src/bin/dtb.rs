#[cfg(not(windows))]
mod fuzz {
    use bootpatch::{format::dtb::Fdt, patch::fstab};
    use honggfuzz::fuzz;

    pub fn main() {
        loop {
            fuzz!(|data: &[u8]| {
                let _ = Fdt::parse(data).and_then(|fdt| fdt.properties());

                let mut data = data.to_vec();
                let _ = fstab::patch_dtb(&mut data, fstab::VERITY_FLAGS);
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}
