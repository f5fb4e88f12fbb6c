//! Channel-style entry point: a fetch as a stream of [`FetchEvent`]s with an
//! explicit decision point between manifest discovery and asset download.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use log::{debug, error};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::UpdatesError;
use crate::interface::{FetchObserver, UpdatesExternalInterface};
use crate::models::{AssetProgress, Configuration, Manifest};

#[derive(Debug)]
pub enum FetchEvent {
    /// The fetch is parked until `decision` is answered.
    ManifestReceived {
        manifest: Manifest,
        decision: ManifestDecision,
    },
    Progress(AssetProgress),
    /// Terminal: the update is stored, or `None` when the manifest was rejected.
    Finished(Option<Manifest>),
    /// Terminal.
    Failed(UpdatesError),
}

impl FetchEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FetchEvent::Finished(_) | FetchEvent::Failed(_))
    }
}

/// Answer to a [`FetchEvent::ManifestReceived`]. Dropping it rejects.
#[derive(Debug)]
pub struct ManifestDecision(oneshot::Sender<bool>);

impl ManifestDecision {
    pub fn accept(self) {
        let _ = self.0.send(true);
    }

    pub fn reject(self) {
        let _ = self.0.send(false);
    }

    pub fn decide(self, proceed: bool) {
        let _ = self.0.send(proceed);
    }
}

struct ChannelObserver {
    events: mpsc::UnboundedSender<FetchEvent>,
    vetoed: bool,
}

#[async_trait]
impl FetchObserver for ChannelObserver {
    async fn on_manifest(&mut self, manifest: &Manifest) -> bool {
        let (tx, rx) = oneshot::channel();
        let event = FetchEvent::ManifestReceived {
            manifest: manifest.clone(),
            decision: ManifestDecision(tx),
        };
        let proceed = match self.events.send(event) {
            Ok(()) => rx.await.unwrap_or(false),
            Err(_) => {
                debug!("events: session dropped before manifest decision");
                false
            }
        };
        self.vetoed = !proceed;
        proceed
    }

    fn on_progress(&mut self, progress: AssetProgress) {
        if !self.vetoed {
            let _ = self.events.send(FetchEvent::Progress(progress));
        }
    }
}

/// A running fetch. The last event is always `Finished` or `Failed`.
pub struct FetchSession {
    events: mpsc::UnboundedReceiver<FetchEvent>,
    task: JoinHandle<()>,
}

impl FetchSession {
    /// Next event, or `None` once the terminal event has been taken.
    pub async fn next(&mut self) -> Option<FetchEvent> {
        self.events.recv().await
    }

    /// Drive the session to completion, deciding manifests with `gate`.
    pub async fn finish_with<F>(mut self, mut gate: F) -> Result<Option<Manifest>, UpdatesError>
    where
        F: FnMut(&Manifest) -> bool,
    {
        while let Some(event) = self.next().await {
            match event {
                FetchEvent::ManifestReceived { manifest, decision } => {
                    decision.decide(gate(&manifest));
                }
                FetchEvent::Progress(_) => {}
                FetchEvent::Finished(manifest) => return Ok(manifest),
                FetchEvent::Failed(err) => return Err(err),
            }
        }
        Err(UpdatesError::Internal("fetch ended without a result".into()))
    }

    /// Stop listening. An undecided manifest counts as rejected.
    pub fn abort(self) {
        self.task.abort();
    }
}

/// Start a fetch whose steps arrive as [`FetchEvent`]s.
///
/// # Panics
/// Must be called from within a tokio runtime.
pub fn fetch_events<P>(provider: Arc<P>, configuration: Configuration) -> FetchSession
where
    P: UpdatesExternalInterface + ?Sized + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        let mut observer = ChannelObserver {
            events: tx.clone(),
            vetoed: false,
        };
        let outcome = AssertUnwindSafe(provider.fetch_update(&configuration, &mut observer))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(UpdatesError::Internal("update provider panicked".into())));
        let terminal = match outcome {
            _ if observer.vetoed => FetchEvent::Finished(None),
            Ok(manifest) => FetchEvent::Finished(manifest),
            Err(err) => {
                error!("events: fetch failed: {err}");
                FetchEvent::Failed(err)
            }
        };
        let _ = tx.send(terminal);
    });
    FetchSession { events: rx, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::UpdatesProvider;
    use crate::testing::{FailsAfterGate, FakeTransport, PanickingProvider, configuration};
    use serde_json::json;

    const UPDATE_URL: &str = "https://u.example.com/manifest";

    fn provider(dir: &tempfile::TempDir) -> (Arc<UpdatesProvider>, Arc<FakeTransport>) {
        let transport = Arc::new(FakeTransport::default());
        transport.set_manifest(json!({
            "id": "m-2",
            "launchAsset": {"url": "/bundle.js"}
        }));
        transport.add_asset("https://u.example.com/bundle.js", b"code");
        let provider = Arc::new(UpdatesProvider::with_transport(dir.path(), transport.clone()));
        (provider, transport)
    }

    #[tokio::test]
    async fn events_arrive_in_contract_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (provider, _) = provider(&dir);
        let mut session = fetch_events(provider.clone(), configuration(UPDATE_URL));

        let mut progress = Vec::new();
        let mut terminal = None;
        while let Some(event) = session.next().await {
            assert!(terminal.is_none(), "event after terminal: {event:?}");
            match event {
                FetchEvent::ManifestReceived { manifest, decision } => {
                    assert!(progress.is_empty());
                    assert_eq!(manifest.id(), Some("m-2"));
                    decision.accept();
                }
                FetchEvent::Progress(p) => progress.push(p),
                other => terminal = Some(other),
            }
        }

        assert_eq!(
            progress,
            vec![AssetProgress::new(0, 0, 1), AssetProgress::new(1, 0, 1)]
        );
        match terminal {
            Some(FetchEvent::Finished(Some(manifest))) => assert_eq!(manifest.id(), Some("m-2")),
            other => panic!("unexpected terminal event {other:?}"),
        }
        assert!(provider.launch_asset_url().is_some());
    }

    #[tokio::test]
    async fn rejected_manifest_finishes_with_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (provider, transport) = provider(&dir);

        let outcome = fetch_events(provider, configuration(UPDATE_URL))
            .finish_with(|_| false)
            .await;

        assert_eq!(outcome, Ok(None));
        assert_eq!(transport.download_count(), 0);
    }

    #[tokio::test]
    async fn dropped_decision_counts_as_rejection() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (provider, transport) = provider(&dir);
        let mut session = fetch_events(provider, configuration(UPDATE_URL));

        match session.next().await {
            Some(FetchEvent::ManifestReceived { decision, .. }) => drop(decision),
            other => panic!("expected manifest, got {other:?}"),
        }
        match session.next().await {
            Some(FetchEvent::Finished(None)) => {}
            other => panic!("expected vetoed finish, got {other:?}"),
        }
        assert!(session.next().await.is_none());
        assert_eq!(transport.download_count(), 0);
    }

    #[tokio::test]
    async fn failures_are_terminal_events() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (provider, transport) = provider(&dir);
        transport.fail_url("https://u.example.com/bundle.js");
        let mut config = configuration(UPDATE_URL);
        config.insert("assetRetries".into(), json!(0));

        let outcome = fetch_events(provider, config).finish_with(|_| true).await;

        assert!(matches!(
            outcome,
            Err(UpdatesError::AssetDownload { failed: 1, total: 1, .. })
        ));
    }

    #[tokio::test]
    async fn panicking_provider_ends_with_failed_event() {
        let mut session = fetch_events(Arc::new(PanickingProvider), configuration(UPDATE_URL));

        match session.next().await {
            Some(FetchEvent::Failed(UpdatesError::Internal(_))) => {}
            other => panic!("expected internal failure, got {other:?}"),
        }
        assert!(session.next().await.is_none());
    }

    #[tokio::test]
    async fn error_after_rejection_still_finishes_with_none() {
        let outcome = fetch_events(Arc::new(FailsAfterGate), configuration(UPDATE_URL))
            .finish_with(|_| false)
            .await;
        assert_eq!(outcome, Ok(None));

        let outcome = fetch_events(Arc::new(FailsAfterGate), configuration(UPDATE_URL))
            .finish_with(|_| true)
            .await;
        assert!(matches!(outcome, Err(UpdatesError::Storage(_))));
    }
}
