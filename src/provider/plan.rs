use std::collections::HashSet;

use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;

use crate::models::Manifest;
use crate::util::{safe_file_name, sha256_hex};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAsset {
    url: String,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    hash: Option<String>,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    file_extension: Option<String>,
}

/// One asset of a manifest, resolved and named for the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannedAsset {
    pub key: String,
    pub url: Url,
    /// Lowercase hex SHA-256, when the manifest declares one.
    pub hash: Option<String>,
    pub content_type: Option<String>,
    pub file_name: String,
}

/// What has to be on disk for a manifest to be launchable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdatePlan {
    pub manifest_id: String,
    pub launch_asset: PlannedAsset,
    pub assets: Vec<PlannedAsset>,
}

impl UpdatePlan {
    /// Relative asset URLs resolve against `base`, the manifest URL.
    pub fn from_manifest(
        manifest: &Manifest,
        base: &Url,
        expected_runtime: Option<&str>,
    ) -> Result<Self, String> {
        let manifest_id = manifest
            .id()
            .filter(|id| !id.trim().is_empty())
            .ok_or("manifest has no `id`")?
            .to_owned();

        if let (Some(expected), Some(actual)) = (expected_runtime, manifest.runtime_version())
            && expected != actual
        {
            return Err(format!(
                "manifest targets runtime {actual}, this app runs {expected}"
            ));
        }

        let launch_raw = manifest
            .get("launchAsset")
            .ok_or("manifest has no `launchAsset`")?;
        let launch_asset = plan_asset(launch_raw, base).map_err(|e| format!("launchAsset: {e}"))?;

        let mut seen: HashSet<String> = HashSet::new();
        seen.insert(launch_asset.file_name.clone());
        let mut assets = Vec::new();
        match manifest.get("assets") {
            None | Some(Value::Null) => {}
            Some(Value::Array(entries)) => {
                for (index, entry) in entries.iter().enumerate() {
                    let asset = plan_asset(entry, base)
                        .map_err(|e| format!("assets[{index}]: {e}"))?;
                    if seen.insert(asset.file_name.clone()) {
                        assets.push(asset);
                    }
                }
            }
            Some(_) => return Err("`assets` must be an array".into()),
        }

        Ok(Self {
            manifest_id,
            launch_asset,
            assets,
        })
    }

    /// Launch asset first, then the rest in manifest order.
    pub fn all_assets(&self) -> impl Iterator<Item = &PlannedAsset> {
        std::iter::once(&self.launch_asset).chain(self.assets.iter())
    }

    pub fn total(&self) -> u64 {
        1 + self.assets.len() as u64
    }
}

fn plan_asset(value: &Value, base: &Url) -> Result<PlannedAsset, String> {
    let raw = RawAsset::deserialize(value).map_err(|e| format!("malformed asset: {e}"))?;
    let url = base
        .join(&raw.url)
        .map_err(|e| format!("bad asset url {}: {e}", raw.url))?;

    let hash = match raw.hash {
        Some(hash) => {
            let hash = hash.trim().to_ascii_lowercase();
            if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(format!("hash `{hash}` is not a hex SHA-256"));
            }
            Some(hash)
        }
        None => None,
    };

    let url_digest = sha256_hex(url.as_str().as_bytes());
    let named_key = raw.key.filter(|k| !k.trim().is_empty());
    let extension = raw
        .file_extension
        .as_deref()
        .map(|ext| ext.trim().trim_start_matches('.'))
        .filter(|ext| !ext.is_empty())
        .map(|ext| format!(".{}", safe_file_name(ext)))
        .unwrap_or_default();
    // Without a content hash the name must change whenever the source URL does.
    let stem = match (&hash, &named_key) {
        (Some(hash), _) => hash.clone(),
        (None, Some(key)) => format!("{}-{}", safe_file_name(key), &url_digest[..16]),
        (None, None) => url_digest.clone(),
    };
    let key = named_key.unwrap_or(url_digest);

    Ok(PlannedAsset {
        key,
        url,
        hash,
        content_type: raw.content_type,
        file_name: format!("{stem}{extension}"),
    })
}
