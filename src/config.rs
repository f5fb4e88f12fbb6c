use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::Url;
use serde_json::Value;

use crate::env;
use crate::error::UpdatesError;
use crate::models::Configuration;

pub const UPDATE_URL_KEY: &str = "updateUrl";
pub const REQUEST_HEADERS_KEY: &str = "requestHeaders";
pub const RUNTIME_VERSION_KEY: &str = "runtimeVersion";
pub const PLATFORM_KEY: &str = "platform";
pub const TIMEOUT_SECS_KEY: &str = "timeoutSecs";
pub const MAX_CONCURRENT_DOWNLOADS_KEY: &str = "maxConcurrentDownloads";
pub const ASSET_RETRIES_KEY: &str = "assetRetries";

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CONCURRENT_DOWNLOADS: usize = 4;
const DEFAULT_ASSET_RETRIES: u32 = 2;

/// Typed view of a [`Configuration`] as understood by the reference provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchSettings {
    pub update_url: Url,
    pub request_headers: BTreeMap<String, String>,
    pub runtime_version: Option<String>,
    pub platform: String,
    pub timeout: Duration,
    pub max_concurrent_downloads: usize,
    pub asset_retries: u32,
}

impl FetchSettings {
    pub fn from_configuration(config: &Configuration) -> Result<Self, UpdatesError> {
        let raw_url = optional_str(config, UPDATE_URL_KEY)?
            .ok_or_else(|| invalid(format!("`{UPDATE_URL_KEY}` is required")))?;
        let update_url = Url::parse(raw_url)
            .map_err(|e| invalid(format!("`{UPDATE_URL_KEY}` is not a valid URL: {e}")))?;
        if !matches!(update_url.scheme(), "http" | "https") {
            return Err(invalid(format!(
                "`{UPDATE_URL_KEY}` must use http or https, got {}",
                update_url.scheme()
            )));
        }

        let request_headers = match config.get(REQUEST_HEADERS_KEY) {
            None | Some(Value::Null) => BTreeMap::new(),
            Some(Value::Object(entries)) => entries
                .iter()
                .map(|(name, value)| match value {
                    Value::String(value) => Ok((name.clone(), value.clone())),
                    other => Err(invalid(format!(
                        "header `{name}` must be a string, got {other}"
                    ))),
                })
                .collect::<Result<_, _>>()?,
            Some(other) => {
                return Err(invalid(format!(
                    "`{REQUEST_HEADERS_KEY}` must be an object, got {other}"
                )));
            }
        };

        let runtime_version = optional_str(config, RUNTIME_VERSION_KEY)?
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_owned);
        let platform = optional_str(config, PLATFORM_KEY)?
            .map(str::to_owned)
            .unwrap_or_else(|| env::platform_key().to_owned());

        let timeout_secs = optional_u64(config, TIMEOUT_SECS_KEY)?.unwrap_or(DEFAULT_TIMEOUT_SECS);
        if timeout_secs == 0 {
            return Err(invalid(format!("`{TIMEOUT_SECS_KEY}` must be positive")));
        }
        let max_concurrent_downloads = match optional_u64(config, MAX_CONCURRENT_DOWNLOADS_KEY)? {
            Some(0) => {
                return Err(invalid(format!(
                    "`{MAX_CONCURRENT_DOWNLOADS_KEY}` must be at least 1"
                )));
            }
            Some(n) => usize::try_from(n).unwrap_or(usize::MAX),
            None => DEFAULT_CONCURRENT_DOWNLOADS,
        };
        let asset_retries = optional_u64(config, ASSET_RETRIES_KEY)?
            .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
            .unwrap_or(DEFAULT_ASSET_RETRIES);

        Ok(Self {
            update_url,
            request_headers,
            runtime_version,
            platform,
            timeout: Duration::from_secs(timeout_secs),
            max_concurrent_downloads,
            asset_retries,
        })
    }

    /// Headers sent with the manifest request: configured ones plus the
    /// runtime/platform identification the update server selects on.
    pub fn manifest_headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![
            ("accept".to_owned(), "application/json".to_owned()),
            ("expo-platform".to_owned(), self.platform.clone()),
        ];
        if let Some(runtime) = &self.runtime_version {
            headers.push(("expo-runtime-version".to_owned(), runtime.clone()));
        }
        headers.extend(
            self.request_headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        headers
    }

    pub fn asset_headers(&self) -> Vec<(String, String)> {
        self.request_headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

fn invalid(message: String) -> UpdatesError {
    UpdatesError::InvalidConfiguration(message)
}

fn optional_str<'a>(config: &'a Configuration, key: &str) -> Result<Option<&'a str>, UpdatesError> {
    match config.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(other) => Err(invalid(format!("`{key}` must be a string, got {other}"))),
    }
}

fn optional_u64(config: &Configuration, key: &str) -> Result<Option<u64>, UpdatesError> {
    match config.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .map(Some)
            .ok_or_else(|| invalid(format!("`{key}` must be a non-negative integer, got {value}"))),
    }
}
