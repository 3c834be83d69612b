#[cfg(all(target_os = "macos", target_arch = "x86_64"))]
pub mod macos;
