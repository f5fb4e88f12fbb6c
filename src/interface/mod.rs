//! The capability set an update provider exposes to its host.
//!
//! Hosts depend on [`UpdatesExternalInterface`] instead of a concrete
//! controller. The trait is the async rendition of the contract; the
//! [`callbacks`](crate::callbacks) and [`events`](crate::events) modules
//! adapt it to callback and channel styles.

use std::any::Any;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use reqwest::Url;

use crate::error::UpdatesError;
use crate::models::{AssetProgress, Configuration, Manifest};

/// Host bridge/runtime object a provider may be associated with.
pub type Bridge = dyn Any + Send + Sync;

/// Receives the intermediate steps of one fetch.
#[async_trait]
pub trait FetchObserver: Send {
    /// Called once, after the manifest is retrieved and before any asset is
    /// downloaded. Returning `false` vetoes the update: the fetch resolves
    /// to `Ok(None)` and nothing else is reported.
    async fn on_manifest(&mut self, manifest: &Manifest) -> bool;

    /// Called zero or more times while assets download.
    fn on_progress(&mut self, progress: AssetProgress);
}

#[async_trait]
pub trait UpdatesExternalInterface: Send + Sync {
    /// The associated host bridge, if it is still alive.
    fn bridge(&self) -> Option<Arc<Bridge>>;

    /// Associate a host bridge without extending its lifetime.
    fn set_bridge(&self, bridge: Weak<Bridge>);

    /// Location of the asset the application boots from, if any.
    fn launch_asset_url(&self) -> Option<Url>;

    /// Discard in-progress and cached fetch state.
    fn reset(&self);

    /// Fetch an update.
    ///
    /// Resolves to `Ok(Some(manifest))` once the update is fully stored,
    /// `Ok(None)` when the observer vetoed the manifest, or `Err` on failure.
    async fn fetch_update(
        &self,
        configuration: &Configuration,
        observer: &mut dyn FetchObserver,
    ) -> Result<Option<Manifest>, UpdatesError>;
}

/// Observer that accepts every manifest and ignores progress.
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptAll;

#[async_trait]
impl FetchObserver for AcceptAll {
    async fn on_manifest(&mut self, _manifest: &Manifest) -> bool {
        true
    }

    fn on_progress(&mut self, _progress: AssetProgress) {}
}
