//! Build metadata embedded at compile time

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Short commit SHA
pub const GIT_SHA: &str = env!("VERGEN_GIT_SHA");

pub const GIT_BRANCH: &str = env!("VERGEN_GIT_BRANCH");

/// "true" when built from a tree with uncommitted changes
pub const GIT_DIRTY: &str = env!("VERGEN_GIT_DIRTY");

pub const RUSTC_VERSION: &str = env!("VERGEN_RUSTC_SEMVER");

pub const BUILD_TIMESTAMP: &str = env!("VERGEN_BUILD_TIMESTAMP");

pub const TARGET: &str = env!("VERGEN_CARGO_TARGET_TRIPLE");

/// `<version> (<sha>[ dirty])`
pub fn full_version() -> String {
    let dirty = if GIT_DIRTY == "true" { " dirty" } else { "" };
    format!("{VERSION} ({GIT_SHA}{dirty})")
}

/// Multi-line build report printed by `peerlink-agent version`.
pub fn build_info() -> String {
    format!(
        "peerlink-agent {}\n\
         commit: {} ({})\n\
         built:  {}\n\
         rustc:  {}\n\
         target: {}",
        full_version(),
        GIT_SHA,
        GIT_BRANCH,
        BUILD_TIMESTAMP,
        RUSTC_VERSION,
        TARGET
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_version_starts_with_crate_version() {
        assert!(full_version().starts_with(VERSION));
        assert!(build_info().contains(GIT_SHA));
    }
}
