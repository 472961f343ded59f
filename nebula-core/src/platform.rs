//! Platform identifiers (`<os>-<arch>`, e.g. `linux-x64`)

/// Identifier of the platform this binary was built for
pub fn current_platform() -> String {
    platform_id(std::env::consts::OS, std::env::consts::ARCH)
}

/// Map Rust target names onto installer-style identifiers
pub fn platform_id(os: &str, arch: &str) -> String {
    let arch = match arch {
        "x86_64" => "x64",
        "aarch64" => "arm64",
        "arm" => "armv7",
        other => other,
    };
    format!("{os}-{arch}")
}
