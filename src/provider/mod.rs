use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use futures_util::stream;
use log::{debug, error, info, warn};
use reqwest::Url;

use crate::config::FetchSettings;
use crate::error::UpdatesError;
use crate::interface::{Bridge, FetchObserver, UpdatesExternalInterface};
use crate::models::{AssetProgress, Configuration, LaunchState, Manifest};
use crate::networking::{AssetRequest, ManifestRequest, NetworkClient, UpdateTransport};
use crate::storage::StorageManager;
use crate::util::cancel_requested;

pub mod plan;

use plan::{PlannedAsset, UpdatePlan};

const RETRY_BACKOFF: Duration = Duration::from_millis(250);

#[derive(Debug)]
struct ActiveFetch {
    id: u64,
    cancel: Arc<AtomicBool>,
}

#[derive(Debug, Default)]
struct ProviderState {
    launch: Option<LaunchState>,
    active: Option<ActiveFetch>,
    next_fetch_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AssetOutcome {
    Cached,
    Downloaded,
}

/// Releases the in-flight slot when a fetch ends, however it ends.
struct FetchGuard<'a> {
    state: &'a Mutex<ProviderState>,
    id: u64,
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.active.as_ref().is_some_and(|active| active.id == self.id) {
            state.active = None;
        }
    }
}

/// Update provider that fetches manifests over HTTP and keeps assets in a
/// local store.
///
/// One fetch runs at a time; a second concurrent `fetch_update` fails with
/// [`UpdatesError::FetchInProgress`]. `reset` cancels the running fetch,
/// which then fails with [`UpdatesError::Reset`].
///
/// Downloads land in a per-fetch staging directory and only move into the
/// asset directory while the fetch is still live.
pub struct UpdatesProvider {
    storage: StorageManager,
    transport: Arc<dyn UpdateTransport>,
    bridge: RwLock<Option<Weak<Bridge>>>,
    state: Mutex<ProviderState>,
    /// Held across writes into the store. Taken before `state`, never after.
    store: Mutex<()>,
}

impl UpdatesProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_transport(root, Arc::new(NetworkClient::new()))
    }

    /// Restores the last committed update found under `root`.
    pub fn with_transport(root: impl Into<PathBuf>, transport: Arc<dyn UpdateTransport>) -> Self {
        let storage = StorageManager::new(root);
        let launch = storage.read_launch_state();
        if let Some(launch) = &launch {
            info!("provider: restored update {}", launch.manifest_id);
        }
        Self {
            storage,
            transport,
            bridge: RwLock::new(None),
            state: Mutex::new(ProviderState {
                launch,
                ..Default::default()
            }),
            store: Mutex::new(()),
        }
    }

    pub fn storage(&self) -> &StorageManager {
        &self.storage
    }

    /// Manifest of the committed update, if any.
    pub fn current_manifest(&self) -> Option<Manifest> {
        self.lock_state()
            .launch
            .as_ref()
            .map(|launch| launch.manifest.clone())
    }

    fn lock_state(&self) -> MutexGuard<'_, ProviderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_store(&self) -> MutexGuard<'_, ()> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin_fetch(&self) -> Result<(FetchGuard<'_>, Arc<AtomicBool>), UpdatesError> {
        // Waits out a reset that is still clearing the store.
        let _store = self.lock_store();
        let mut state = self.lock_state();
        if state.active.is_some() {
            warn!("fetch: rejected, another fetch is in flight");
            return Err(UpdatesError::FetchInProgress);
        }
        state.next_fetch_id += 1;
        let id = state.next_fetch_id;
        let cancel = Arc::new(AtomicBool::new(false));
        state.active = Some(ActiveFetch {
            id,
            cancel: cancel.clone(),
        });
        debug!("fetch: started #{id}");
        Ok((
            FetchGuard {
                state: &self.state,
                id,
            },
            cancel,
        ))
    }

    fn ensure_not_reset(cancel: &Arc<AtomicBool>) -> Result<(), UpdatesError> {
        if cancel.load(Ordering::SeqCst) {
            debug!("fetch: cancel flag observed set");
            return Err(UpdatesError::Reset);
        }
        Ok(())
    }

    /// Move a verified download into the store unless the fetch was reset.
    fn promote(
        &self,
        staged: &Path,
        file_name: &str,
        cancel: &Arc<AtomicBool>,
    ) -> Result<(), String> {
        let _store = self.lock_store();
        if cancel.load(Ordering::SeqCst) {
            let _ = std::fs::remove_file(staged);
            return Err("download cancelled".into());
        }
        self.storage.promote(staged, file_name)
    }

    async fn obtain_asset(
        &self,
        fetch_id: u64,
        asset: &PlannedAsset,
        settings: &FetchSettings,
        cancel: &Arc<AtomicBool>,
    ) -> Result<AssetOutcome, String> {
        if self
            .storage
            .asset_matches(&asset.file_name, asset.hash.as_deref())
            .await
        {
            debug!("fetch: asset {} already stored", asset.key);
            return Ok(AssetOutcome::Cached);
        }

        let request = AssetRequest {
            url: asset.url.clone(),
            headers: settings.asset_headers(),
            timeout: settings.timeout,
        };
        let staged = self.storage.staging_path(fetch_id, &asset.file_name);
        let flag = Some(cancel.clone());
        let mut last_error = String::new();
        for attempt in 0..=settings.asset_retries {
            if cancel_requested(&flag) {
                return Err("download cancelled".into());
            }
            if attempt > 0 {
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
            }
            let result = match self
                .transport
                .download_asset(&request, &staged, flag.clone())
                .await
            {
                Ok(bytes) => match &asset.hash {
                    Some(hash) => self.storage.verify_file(&staged, hash).await.map(|()| bytes),
                    None => Ok(bytes),
                },
                Err(err) => Err(err),
            };
            let result = result.and_then(|bytes| {
                self.promote(&staged, &asset.file_name, cancel).map(|()| bytes)
            });
            match result {
                Ok(bytes) => {
                    debug!("fetch: asset {} stored ({bytes} bytes)", asset.key);
                    return Ok(AssetOutcome::Downloaded);
                }
                Err(err) => {
                    warn!(
                        "fetch: asset {} attempt {} of {} failed: {err}",
                        asset.key,
                        attempt + 1,
                        settings.asset_retries.saturating_add(1)
                    );
                    last_error = err;
                }
            }
        }
        Err(last_error)
    }

    async fn download_plan(
        &self,
        fetch_id: u64,
        plan: &UpdatePlan,
        settings: &FetchSettings,
        cancel: &Arc<AtomicBool>,
        observer: &mut dyn FetchObserver,
    ) -> Result<(), UpdatesError> {
        let total = plan.total();
        let mut progress = AssetProgress::new(0, 0, total);
        observer.on_progress(progress);

        let mut first_error: Option<String> = None;
        let mut cached = 0u64;
        let mut downloads = stream::iter(plan.all_assets().cloned())
            .map(|asset| async move {
                let result = self.obtain_asset(fetch_id, &asset, settings, cancel).await;
                (asset, result)
            })
            .buffer_unordered(settings.max_concurrent_downloads);

        while let Some((asset, result)) = downloads.next().await {
            match result {
                Ok(outcome) => {
                    progress.successful += 1;
                    if outcome == AssetOutcome::Cached {
                        cached += 1;
                    }
                }
                Err(err) => {
                    progress.failed += 1;
                    first_error.get_or_insert_with(|| format!("{}: {err}", asset.key));
                }
            }
            observer.on_progress(progress);
        }
        drop(downloads);

        Self::ensure_not_reset(cancel)?;
        info!(
            "fetch: assets done ({} ok, {} cached, {} failed, {} total)",
            progress.successful, cached, progress.failed, progress.total
        );
        match first_error {
            Some(message) => Err(UpdatesError::AssetDownload {
                failed: progress.failed,
                total,
                message,
            }),
            None => Ok(()),
        }
    }

    /// Make `plan` the launchable update unless the fetch was reset meanwhile.
    fn commit(
        &self,
        fetch_id: u64,
        plan: &UpdatePlan,
        manifest: &Manifest,
    ) -> Result<(), UpdatesError> {
        let _store = self.lock_store();
        let mut state = self.lock_state();
        let still_active = state
            .active
            .as_ref()
            .is_some_and(|active| active.id == fetch_id && !active.cancel.load(Ordering::SeqCst));
        if !still_active {
            return Err(UpdatesError::Reset);
        }
        let launch = LaunchState {
            manifest_id: plan.manifest_id.clone(),
            launch_asset: PathBuf::from(&plan.launch_asset.file_name),
            manifest: manifest.clone(),
            fetched_at: Utc::now().to_rfc3339(),
        };
        self.storage
            .write_launch_state(&launch)
            .map_err(UpdatesError::Storage)?;
        state.launch = Some(launch);

        let keep: HashSet<String> = plan.all_assets().map(|a| a.file_name.clone()).collect();
        if let Err(err) = self.storage.prune_assets(&keep) {
            warn!("fetch: unable to prune superseded assets: {err}");
        }
        Ok(())
    }

    async fn run_fetch(
        &self,
        fetch_id: u64,
        cancel: &Arc<AtomicBool>,
        settings: &FetchSettings,
        observer: &mut dyn FetchObserver,
    ) -> Result<Option<Manifest>, UpdatesError> {
        info!("fetch: requesting manifest from {}", settings.update_url);
        let request = ManifestRequest {
            url: settings.update_url.clone(),
            headers: settings.manifest_headers(),
            timeout: settings.timeout,
        };
        let body = self
            .transport
            .fetch_manifest(&request)
            .await
            .map_err(UpdatesError::ManifestFetch)?;
        Self::ensure_not_reset(cancel)?;

        let manifest = Manifest::from_value(body)
            .ok_or_else(|| UpdatesError::InvalidManifest("manifest is not a JSON object".into()))?;
        let plan = UpdatePlan::from_manifest(
            &manifest,
            &settings.update_url,
            settings.runtime_version.as_deref(),
        )
        .map_err(UpdatesError::InvalidManifest)?;

        if !observer.on_manifest(&manifest).await {
            info!("fetch: manifest {} vetoed by caller", plan.manifest_id);
            return Ok(None);
        }
        Self::ensure_not_reset(cancel)?;
        info!(
            "fetch: manifest {} accepted, {} assets to check",
            plan.manifest_id,
            plan.total()
        );

        self.download_plan(fetch_id, &plan, settings, cancel, observer).await?;
        self.commit(fetch_id, &plan, &manifest)?;
        info!("fetch: update {} ready to launch", plan.manifest_id);
        Ok(Some(manifest))
    }
}

#[async_trait]
impl UpdatesExternalInterface for UpdatesProvider {
    fn bridge(&self) -> Option<Arc<Bridge>> {
        self.bridge
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn set_bridge(&self, bridge: Weak<Bridge>) {
        *self.bridge.write().unwrap_or_else(PoisonError::into_inner) = Some(bridge);
    }

    fn launch_asset_url(&self) -> Option<Url> {
        let state = self.lock_state();
        let launch = state.launch.as_ref()?;
        Url::from_file_path(self.storage.asset_path_for(launch)).ok()
    }

    fn reset(&self) {
        let _store = self.lock_store();
        {
            let mut state = self.lock_state();
            if let Some(active) = state.active.take() {
                active.cancel.store(true, Ordering::SeqCst);
                warn!("reset: cancelled in-flight fetch #{}", active.id);
            }
            state.launch = None;
        }
        if let Err(err) = self.storage.clear() {
            error!("reset: failed to clear store: {err}");
        }
        info!("reset: provider state discarded");
    }

    async fn fetch_update(
        &self,
        configuration: &Configuration,
        observer: &mut dyn FetchObserver,
    ) -> Result<Option<Manifest>, UpdatesError> {
        let settings = FetchSettings::from_configuration(configuration)?;
        let (guard, cancel) = self.begin_fetch()?;
        let result = self.run_fetch(guard.id, &cancel, &settings, observer).await;
        if let Err(err) = &result {
            error!("fetch: failed: {err}");
        }
        self.storage.discard_staging(guard.id);
        drop(guard);
        result
    }
}
