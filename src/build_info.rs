//! Build-time metadata, captured by the `built` crate in `build.rs` and
//! logged once at heap construction.

mod raw {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

/// Crate version such as 0.3.0
pub const PKG_VERSION: &str = raw::PKG_VERSION;

/// Comma separated features enabled for this build
pub const FEATURES: &str = raw::FEATURES_STR;

lazy_static! {
    /// Git commit such as a96e8f991c91a81df51e7975849441f52fdbcdcc, with a
    /// -dirty suffix for builds from a modified tree, or unknown-git-version
    /// if vmgc was not built from a git repo.
    pub static ref GIT_VERSION: &'static str = &GIT_VERSION_STRING;

    // Owned string
    static ref GIT_VERSION_STRING: String = match (raw::GIT_COMMIT_HASH, raw::GIT_DIRTY) {
        (Some(hash), dirty) => format!(
            "{}{}",
            hash,
            if dirty == Some(true) { "-dirty" } else { "" }
        ),
        (None, _) => "unknown-git-version".to_string(),
    };
}
