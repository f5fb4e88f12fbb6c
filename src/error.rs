use thiserror::Error;

/// The single failure signal delivered to callers of a fetch.
///
/// Callers that only need to know *that* a fetch failed can treat it through
/// its `Display` output; the variants exist so the reference provider can
/// say what went wrong.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpdatesError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("failed to fetch manifest: {0}")]
    ManifestFetch(String),
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),
    #[error("{failed} of {total} assets failed to download: {message}")]
    AssetDownload {
        failed: u64,
        total: u64,
        message: String,
    },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("fetch was reset before it completed")]
    Reset,
    #[error("another fetch is already in progress")]
    FetchInProgress,
    #[error("internal error: {0}")]
    Internal(String),
}
