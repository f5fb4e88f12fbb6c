use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::models::LaunchState;
use crate::util::sha256_file;

const LAUNCH_STATE_FILE: &str = "launch.json";
const ASSETS_DIR: &str = "assets";
const STAGING_DIR: &str = "staging";

/// On-disk layout of one update store:
///
/// ```text
/// <root>/launch.json      committed launch state
/// <root>/assets/<name>    downloaded assets
/// <root>/staging/<fetch>/  downloads of one fetch, not yet promoted
/// ```
#[derive(Clone, Debug)]
pub struct StorageManager {
    base_dir: PathBuf,
}

impl StorageManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn assets_dir(&self) -> PathBuf {
        self.base_dir.join(ASSETS_DIR)
    }

    pub fn asset_path(&self, file_name: &str) -> PathBuf {
        self.assets_dir().join(file_name)
    }

    /// Where fetch `fetch_id` downloads `file_name` before promoting it.
    pub fn staging_path(&self, fetch_id: u64, file_name: &str) -> PathBuf {
        self.base_dir
            .join(STAGING_DIR)
            .join(fetch_id.to_string())
            .join(file_name)
    }

    /// Move a staged download into the asset directory.
    pub fn promote(&self, staged: &Path, file_name: &str) -> Result<(), String> {
        let assets = self.assets_dir();
        fs::create_dir_all(&assets).map_err(|e| format!("unable to create assets dir: {e}"))?;
        fs::rename(staged, assets.join(file_name))
            .map_err(|e| format!("failed to move {file_name} into the store: {e}"))
    }

    /// Drop whatever fetch `fetch_id` left in staging.
    pub fn discard_staging(&self, fetch_id: u64) {
        let dir = self.base_dir.join(STAGING_DIR).join(fetch_id.to_string());
        if dir.exists()
            && let Err(err) = fs::remove_dir_all(&dir)
        {
            warn!("storage: unable to remove {}: {err}", dir.display());
        }
    }

    /// Remove stored assets whose names are not in `keep`.
    pub fn prune_assets(&self, keep: &HashSet<String>) -> Result<usize, String> {
        let entries = match fs::read_dir(self.assets_dir()) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(format!("unable to list assets: {err}")),
        };
        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|e| format!("unable to list assets: {e}"))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if keep.contains(&name) {
                continue;
            }
            fs::remove_file(entry.path()).map_err(|e| format!("unable to prune {name}: {e}"))?;
            removed += 1;
        }
        if removed > 0 {
            debug!("storage: pruned {removed} unreferenced assets");
        }
        Ok(removed)
    }

    /// Whether a stored asset can be reused as-is. Without an expected hash
    /// any existing file counts.
    pub async fn asset_matches(&self, file_name: &str, expected_sha256: Option<&str>) -> bool {
        let path = self.asset_path(file_name);
        if tokio::fs::metadata(&path).await.is_err() {
            return false;
        }
        match expected_sha256 {
            None => true,
            Some(expected) => match sha256_file(&path).await {
                Ok(actual) => actual.eq_ignore_ascii_case(expected),
                Err(err) => {
                    warn!("storage: unable to hash cached asset: {err}");
                    false
                }
            },
        }
    }

    /// Check a freshly downloaded file; a mismatching file is removed.
    pub async fn verify_file(&self, path: &Path, expected_sha256: &str) -> Result<(), String> {
        let actual = sha256_file(path).await?;
        if actual.eq_ignore_ascii_case(expected_sha256) {
            return Ok(());
        }
        let _ = tokio::fs::remove_file(path).await;
        Err(format!(
            "checksum mismatch for {}: expected {expected_sha256}, got {actual}",
            path.display()
        ))
    }

    pub fn read_launch_state(&self) -> Option<LaunchState> {
        let path = self.base_dir.join(LAUNCH_STATE_FILE);
        let bytes = fs::read(&path).ok()?;
        match serde_json::from_slice::<LaunchState>(&bytes) {
            Ok(state) if self.asset_path_for(&state).exists() => Some(state),
            Ok(state) => {
                warn!(
                    "storage: launch asset for update {} is missing; ignoring saved state",
                    state.manifest_id
                );
                None
            }
            Err(err) => {
                warn!("storage: unreadable {}: {err}", path.display());
                None
            }
        }
    }

    /// Persist launch state, replacing the previous file atomically.
    pub fn write_launch_state(&self, state: &LaunchState) -> Result<(), String> {
        fs::create_dir_all(&self.base_dir).map_err(|e| format!("unable to create store dir: {e}"))?;
        let path = self.base_dir.join(LAUNCH_STATE_FILE);
        let tmp = self.base_dir.join(format!("{LAUNCH_STATE_FILE}.tmp"));
        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| format!("unable to encode launch state: {e}"))?;
        fs::write(&tmp, json).map_err(|e| format!("unable to write launch state: {e}"))?;
        fs::rename(&tmp, &path).map_err(|e| format!("unable to persist launch state: {e}"))
    }

    pub fn asset_path_for(&self, state: &LaunchState) -> PathBuf {
        self.assets_dir().join(&state.launch_asset)
    }

    /// Remove the launch state, every stored asset and all staged downloads.
    pub fn clear(&self) -> Result<(), String> {
        let state_file = self.base_dir.join(LAUNCH_STATE_FILE);
        if state_file.exists() {
            fs::remove_file(&state_file)
                .map_err(|e| format!("failed to clear launch state: {e}"))?;
        }
        for dir in [self.assets_dir(), self.base_dir.join(STAGING_DIR)] {
            if dir.exists() {
                fs::remove_dir_all(&dir)
                    .map_err(|e| format!("failed to remove {}: {e}", dir.display()))?;
            }
        }
        debug!("storage: cleared {}", self.base_dir.display());
        Ok(())
    }
}
