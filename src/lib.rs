//! Update-fetching provider contract and a reference implementation.
//!
//! [`UpdatesExternalInterface`] is the capability set a host depends on;
//! [`UpdatesProvider`] implements it against an HTTP update server and a
//! local asset store.

pub mod callbacks;
pub mod config;
pub mod env;
pub mod error;
pub mod events;
pub mod interface;
pub mod models;
pub mod networking;
pub mod provider;
pub mod storage;
pub mod util;

#[cfg(test)]
pub(crate) mod testing;

pub use config::FetchSettings;
pub use error::UpdatesError;
pub use events::{FetchEvent, FetchSession, ManifestDecision, fetch_events};
pub use interface::{AcceptAll, Bridge, FetchObserver, UpdatesExternalInterface};
pub use models::{AssetProgress, Configuration, Manifest};
pub use provider::UpdatesProvider;
