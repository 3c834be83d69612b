use std::env;

fn main() {
    let os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let arch = env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();

    if os == "macos" && arch == "x86_64" {
        println!("cargo:rustc-link-lib=framework=Hypervisor");
    }
}
