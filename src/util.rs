use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use sha2::{Digest, Sha256};

/// Check whether an optional cancellation flag has been raised.
#[must_use]
pub fn cancel_requested(cancel: &Option<Arc<AtomicBool>>) -> bool {
    cancel
        .as_ref()
        .map(|flag| flag.load(Ordering::SeqCst))
        .unwrap_or(false)
}

/// Compute asset progress as a percentage.
#[must_use]
pub fn progress_percent(done: u64, total: u64) -> f32 {
    if total == 0 {
        return 0.0;
    }
    (done as f32 / total as f32) * 100.0
}

/// Lowercase hex SHA-256 of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Hash a file on disk, returning its lowercase hex SHA-256.
pub async fn sha256_file(path: &Path) -> Result<String, String> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| format!("unable to read {}: {e}", path.display()))?;
    Ok(sha256_hex(&bytes))
}

/// Reduce an arbitrary string to something usable as a single path component.
#[must_use]
pub fn safe_file_name(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('.');
    if trimmed.is_empty() {
        "_".to_owned()
    } else {
        trimmed.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn calculates_progress_percent() {
        assert_eq!(progress_percent(0, 10), 0.0);
        assert_eq!(progress_percent(5, 10), 50.0);
        assert_eq!(progress_percent(10, 10), 100.0);
        assert_eq!(progress_percent(5, 0), 0.0);
    }

    #[test]
    fn respects_optional_cancel_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        assert!(!cancel_requested(&Some(flag.clone())));
        flag.store(true, Ordering::SeqCst);
        assert!(cancel_requested(&Some(flag)));
        assert!(!cancel_requested(&None));
    }

    #[test]
    fn hashes_known_input() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn sanitizes_path_components() {
        assert_eq!(safe_file_name("updates.example.com"), "updates.example.com");
        assert_eq!(safe_file_name("../etc/passwd"), "_etc_passwd");
        assert_eq!(safe_file_name("a b:c"), "a_b_c");
        assert_eq!(safe_file_name(".."), "_");
    }
}
