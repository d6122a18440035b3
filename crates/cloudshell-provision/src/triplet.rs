use cloudshell_core::{Error, Result};

/// Map a host (platform, architecture) pair to the emulator build triplet.
///
/// Accepts both `macos`/`aarch64` and `darwin`/`arm64` spellings of the
/// supported hosts. Anything else is unsupported.
pub fn machine_triplet(os: &str, arch: &str) -> Result<&'static str> {
    let os_norm = match os {
        "linux" => "linux",
        "darwin" | "macos" => "darwin",
        _ => "",
    };
    let arch_norm = match arch {
        "arm64" | "aarch64" => "arm64",
        "x86_64" => "x86_64",
        _ => "",
    };

    match (os_norm, arch_norm) {
        ("linux", "arm64") => Ok("aarch64-linux-gnu"),
        ("linux", "x86_64") => Ok("x86_64-linux-gnu"),
        ("darwin", "arm64") => Ok("aarch64-apple-darwin"),
        ("darwin", "x86_64") => Ok("x86_64-apple-darwin"),
        _ => Err(Error::Detection {
            os: os.to_string(),
            arch: arch.to_string(),
        }),
    }
}

pub fn host_triplet() -> Result<&'static str> {
    machine_triplet(std::env::consts::OS, std::env::consts::ARCH)
}
