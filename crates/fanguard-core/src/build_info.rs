//! Build-time metadata embedded by the build script.
//!
//! Reported in state snapshots and `fanguard --version`.

/// The git commit hash at build time (short form).
pub const GIT_HASH: &str = env!("FANGUARD_GIT_HASH");

/// The build profile (`debug` or `release`).
pub const BUILD_PROFILE: &str = env!("FANGUARD_BUILD_PROFILE");

/// The crate version from Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// [`version_string`] as a constant, for `--version` output.
pub const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("FANGUARD_GIT_HASH"),
    ", ",
    env!("FANGUARD_BUILD_PROFILE"),
    ")"
);

/// Return a formatted version string including git hash and profile.
///
/// Example: `"0.1.0 (abc1234, debug)"`
pub fn version_string() -> String {
    format!("{VERSION} ({GIT_HASH}, {BUILD_PROFILE})")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_string_contains_parts() {
        let v = version_string();
        assert!(v.starts_with(VERSION));
        assert!(v.contains(GIT_HASH));
        assert!(v.contains(BUILD_PROFILE));
    }

    #[test]
    fn test_long_version_matches_runtime_string() {
        assert_eq!(LONG_VERSION, version_string());
    }

    #[test]
    fn test_git_hash_is_single_token() {
        assert!(!GIT_HASH.is_empty());
        assert!(!GIT_HASH.contains(char::is_whitespace));
    }
}
