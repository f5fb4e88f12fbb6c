use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::util::progress_percent;

/// Caller-supplied fetch settings. Opaque at the interface boundary.
pub type Configuration = Map<String, Value>;

/// Metadata describing a fetched update.
///
/// The interface treats it as an opaque string-keyed mapping; only the
/// reference provider looks inside (see `provider::plan`).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest(Map<String, Value>);

impl Manifest {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Accepts only JSON objects.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self(fields)),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn id(&self) -> Option<&str> {
        self.get("id").and_then(Value::as_str)
    }

    pub fn runtime_version(&self) -> Option<&str> {
        self.get("runtimeVersion").and_then(Value::as_str)
    }

    pub fn created_at(&self) -> Option<&str> {
        self.get("createdAt").and_then(Value::as_str)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for Manifest {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

/// Asset counters reported while an update downloads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AssetProgress {
    pub successful: u64,
    pub failed: u64,
    pub total: u64,
}

impl AssetProgress {
    pub fn new(successful: u64, failed: u64, total: u64) -> Self {
        Self {
            successful,
            failed,
            total,
        }
    }

    pub fn finished(&self) -> u64 {
        self.successful + self.failed
    }

    /// `successful + failed <= total`. Reported, never enforced.
    pub fn is_consistent(&self) -> bool {
        self.finished() <= self.total
    }

    pub fn is_complete(&self) -> bool {
        self.finished() == self.total
    }

    pub fn percent(&self) -> f32 {
        progress_percent(self.finished(), self.total)
    }
}

/// What the reference provider remembers about the last committed update.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchState {
    pub manifest_id: String,
    /// File name of the launch asset inside the store's asset directory.
    pub launch_asset: PathBuf,
    pub manifest: Manifest,
    pub fetched_at: String,
}
