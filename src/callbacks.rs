//! Callback-style entry point for hosts that cannot await.
//!
//! [`fetch_update`] starts the fetch on the tokio runtime and reports
//! through four callbacks. Exactly one of `success` or `error` is invoked
//! per call, after every `progress` invocation.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use log::{debug, error};
use tokio::task::JoinHandle;

use crate::error::UpdatesError;
use crate::interface::{FetchObserver, UpdatesExternalInterface};
use crate::models::{AssetProgress, Configuration, Manifest};

/// Called once the manifest is known. Returning `false` aborts the fetch and
/// the success callback receives `None`.
pub type ManifestBlock = Box<dyn FnMut(&Manifest) -> bool + Send>;
pub type ProgressBlock = Box<dyn FnMut(u64, u64, u64) + Send>;
pub type SuccessBlock = Box<dyn FnOnce(Option<Manifest>) + Send>;
pub type ErrorBlock = Box<dyn FnOnce(UpdatesError) + Send>;

struct CallbackObserver {
    on_manifest: ManifestBlock,
    progress: ProgressBlock,
    vetoed: bool,
}

#[async_trait]
impl FetchObserver for CallbackObserver {
    async fn on_manifest(&mut self, manifest: &Manifest) -> bool {
        let proceed = (self.on_manifest)(manifest);
        self.vetoed = !proceed;
        proceed
    }

    fn on_progress(&mut self, progress: AssetProgress) {
        if self.vetoed {
            debug!("callbacks: dropping progress reported after a veto");
            return;
        }
        (self.progress)(progress.successful, progress.failed, progress.total);
    }
}

/// Start a fetch and report through callbacks.
///
/// Returns as soon as the fetch is spawned; the handle resolves after the
/// terminal callback has run.
///
/// # Panics
/// Must be called from within a tokio runtime.
pub fn fetch_update<P>(
    provider: Arc<P>,
    configuration: Configuration,
    on_manifest: impl FnMut(&Manifest) -> bool + Send + 'static,
    progress: impl FnMut(u64, u64, u64) + Send + 'static,
    success: impl FnOnce(Option<Manifest>) + Send + 'static,
    error: impl FnOnce(UpdatesError) + Send + 'static,
) -> JoinHandle<()>
where
    P: UpdatesExternalInterface + ?Sized + 'static,
{
    let mut observer = CallbackObserver {
        on_manifest: Box::new(on_manifest),
        progress: Box::new(progress),
        vetoed: false,
    };
    let success: SuccessBlock = Box::new(success);
    let error: ErrorBlock = Box::new(error);

    tokio::spawn(async move {
        let outcome = AssertUnwindSafe(provider.fetch_update(&configuration, &mut observer))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(UpdatesError::Internal("update provider panicked".into())));
        // A veto ends in `success(None)` whatever the provider did afterwards.
        let outcome = if observer.vetoed { Ok(None) } else { outcome };
        match outcome {
            Ok(manifest) => success(manifest),
            Err(err) => {
                error!("callbacks: fetch failed: {err}");
                error(err)
            }
        }
    })
}
