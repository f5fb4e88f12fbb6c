//! In-memory doubles shared by the unit tests.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use reqwest::Url;
use serde_json::{Value, json};
use tokio::sync::Notify;

use crate::error::UpdatesError;
use crate::interface::{Bridge, FetchObserver, UpdatesExternalInterface};
use crate::models::{AssetProgress, Configuration, Manifest};
use crate::networking::{AssetRequest, ManifestRequest, UpdateTransport};
use crate::util::cancel_requested;

pub fn configuration(update_url: &str) -> Configuration {
    match json!({ "updateUrl": update_url }) {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}

/// Parks a request until the test lets it through.
#[derive(Default)]
pub struct Hold {
    pub entered: Notify,
    pub release: Notify,
}

pub struct FakeTransport {
    manifest: Mutex<Result<Value, String>>,
    assets: Mutex<HashMap<String, Vec<u8>>>,
    failing: Mutex<HashSet<String>>,
    attempts: Mutex<HashMap<String, usize>>,
    downloads: AtomicUsize,
    hold: Mutex<Option<Arc<Hold>>>,
    asset_holds: Mutex<HashMap<String, Arc<Hold>>>,
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self {
            manifest: Mutex::new(Err("no manifest configured".into())),
            assets: Mutex::default(),
            failing: Mutex::default(),
            attempts: Mutex::default(),
            downloads: AtomicUsize::new(0),
            hold: Mutex::new(None),
            asset_holds: Mutex::default(),
        }
    }
}

impl FakeTransport {
    pub fn set_manifest(&self, manifest: Value) {
        *self.manifest.lock().expect("manifest lock") = Ok(manifest);
    }

    pub fn fail_manifest(&self, error: &str) {
        *self.manifest.lock().expect("manifest lock") = Err(error.to_owned());
    }

    pub fn add_asset(&self, url: &str, bytes: &[u8]) {
        self.assets
            .lock()
            .expect("assets lock")
            .insert(url.to_owned(), bytes.to_vec());
    }

    pub fn fail_url(&self, url: &str) {
        self.failing.lock().expect("failing lock").insert(url.to_owned());
    }

    pub fn hold_manifest(&self) -> Arc<Hold> {
        let hold = Arc::new(Hold::default());
        *self.hold.lock().expect("hold lock") = Some(hold.clone());
        hold
    }

    pub fn release_manifest(&self) {
        *self.hold.lock().expect("hold lock") = None;
    }

    /// Parks the next download of `url` after its cancel check, so the bytes
    /// still land once released.
    pub fn hold_asset(&self, url: &str) -> Arc<Hold> {
        let hold = Arc::new(Hold::default());
        self.asset_holds
            .lock()
            .expect("hold lock")
            .insert(url.to_owned(), hold.clone());
        hold
    }

    /// Successful downloads so far.
    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn download_attempts(&self, url: &str) -> usize {
        self.attempts
            .lock()
            .expect("attempts lock")
            .get(url)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl UpdateTransport for FakeTransport {
    async fn fetch_manifest(&self, _request: &ManifestRequest) -> Result<Value, String> {
        let hold = self.hold.lock().expect("hold lock").clone();
        if let Some(hold) = hold {
            hold.entered.notify_one();
            hold.release.notified().await;
        }
        self.manifest.lock().expect("manifest lock").clone()
    }

    async fn download_asset(
        &self,
        request: &AssetRequest,
        dest: &Path,
        cancel: Option<Arc<AtomicBool>>,
    ) -> Result<u64, String> {
        let url = request.url.to_string();
        *self
            .attempts
            .lock()
            .expect("attempts lock")
            .entry(url.clone())
            .or_default() += 1;
        if cancel_requested(&cancel) {
            return Err("download cancelled".into());
        }
        let hold = self.asset_holds.lock().expect("hold lock").remove(&url);
        if let Some(hold) = hold {
            hold.entered.notify_one();
            hold.release.notified().await;
        }
        if self.failing.lock().expect("failing lock").contains(&url) {
            return Err(format!("HTTP 404 for {url}"));
        }
        let bytes = self
            .assets
            .lock()
            .expect("assets lock")
            .get(&url)
            .cloned()
            .ok_or_else(|| format!("no asset at {url}"))?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| e.to_string())?;
        }
        tokio::fs::write(dest, &bytes)
            .await
            .map_err(|e| e.to_string())?;
        self.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(bytes.len() as u64)
    }
}

/// Observer that records what it saw and answers the gate with a fixed verdict.
pub struct RecordingObserver {
    accept: bool,
    pub manifests: Vec<Manifest>,
    pub progress: Vec<AssetProgress>,
}

impl RecordingObserver {
    pub fn accepting() -> Self {
        Self {
            accept: true,
            manifests: Vec::new(),
            progress: Vec::new(),
        }
    }

    pub fn rejecting() -> Self {
        Self {
            accept: false,
            ..Self::accepting()
        }
    }
}

#[async_trait]
impl FetchObserver for RecordingObserver {
    async fn on_manifest(&mut self, manifest: &Manifest) -> bool {
        self.manifests.push(manifest.clone());
        self.accept
    }

    fn on_progress(&mut self, progress: AssetProgress) {
        self.progress.push(progress);
    }
}

/// Provider whose fetch panics.
pub struct PanickingProvider;

/// Provider that consults the gate, then fails whatever the answer was.
pub struct FailsAfterGate;

#[async_trait]
impl UpdatesExternalInterface for PanickingProvider {
    fn bridge(&self) -> Option<Arc<Bridge>> {
        None
    }

    fn set_bridge(&self, _bridge: Weak<Bridge>) {}

    fn launch_asset_url(&self) -> Option<Url> {
        None
    }

    fn reset(&self) {}

    async fn fetch_update(
        &self,
        _configuration: &Configuration,
        _observer: &mut dyn FetchObserver,
    ) -> Result<Option<Manifest>, UpdatesError> {
        panic!("provider bug")
    }
}

#[async_trait]
impl UpdatesExternalInterface for FailsAfterGate {
    fn bridge(&self) -> Option<Arc<Bridge>> {
        None
    }

    fn set_bridge(&self, _bridge: Weak<Bridge>) {}

    fn launch_asset_url(&self) -> Option<Url> {
        None
    }

    fn reset(&self) {}

    async fn fetch_update(
        &self,
        _configuration: &Configuration,
        observer: &mut dyn FetchObserver,
    ) -> Result<Option<Manifest>, UpdatesError> {
        let manifest = Manifest::from_value(json!({"id": "gated"})).expect("object manifest");
        observer.on_manifest(&manifest).await;
        observer.on_progress(AssetProgress::new(0, 0, 1));
        Err(UpdatesError::Storage("disk full".into()))
    }
}
