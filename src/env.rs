use std::env;
use std::path::PathBuf;

use crate::util::safe_file_name;

/// Returns the root directory under which update stores are kept.
pub fn default_app_dir() -> PathBuf {
    let base = match env::consts::OS {
        "windows" => env::var_os("LOCALAPPDATA")
            .or_else(|| env::var_os("APPDATA"))
            .map(PathBuf::from),
        "macos" | "ios" => env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| home.join("Library").join("Application Support")),
        _ => env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| home.join(".local").join("share")),
    }
    .unwrap_or_else(|| PathBuf::from("."));

    base.join("updates-interface")
}

/// Store directory for one update source, e.g. the host of its manifest URL.
pub fn scoped_dir(scope: &str) -> PathBuf {
    default_app_dir().join(safe_file_name(scope))
}

/// Platform name sent to update servers when the configuration does not name one.
pub fn platform_key() -> &'static str {
    if cfg!(target_os = "ios") {
        "ios"
    } else if cfg!(target_os = "android") {
        "android"
    } else if cfg!(target_os = "windows") {
        "windows"
    } else if cfg!(target_os = "macos") {
        "macos"
    } else {
        "linux"
    }
}
