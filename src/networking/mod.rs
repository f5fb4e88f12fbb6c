use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, warn};
use reqwest::{Client, RequestBuilder, Url};
use serde_json::Value;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

use crate::util::cancel_requested;

const CANCELLED: &str = "download cancelled";

#[derive(Clone, Debug)]
pub struct ManifestRequest {
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct AssetRequest {
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
}

/// How the reference provider talks to an update server.
#[async_trait]
pub trait UpdateTransport: Send + Sync {
    /// Fetch and decode the manifest document.
    async fn fetch_manifest(&self, request: &ManifestRequest) -> Result<Value, String>;

    /// Download one asset to `dest`, returning the number of bytes written.
    /// `dest` must only appear once the download is complete.
    async fn download_asset(
        &self,
        request: &AssetRequest,
        dest: &Path,
        cancel: Option<Arc<AtomicBool>>,
    ) -> Result<u64, String>;
}

#[derive(Clone)]
pub struct NetworkClient {
    client: Client,
}

impl NetworkClient {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|err| {
                warn!("network client: falling back to default HTTP client configuration ({err})");
                Client::new()
            });
        Self { client }
    }
}

impl Default for NetworkClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UpdateTransport for NetworkClient {
    async fn fetch_manifest(&self, request: &ManifestRequest) -> Result<Value, String> {
        debug!("network: GET manifest {}", request.url);
        let builder = self.client.get(request.url.clone()).timeout(request.timeout);
        let resp = with_headers(builder, &request.headers)
            .send()
            .await
            .map_err(|e| format!("manifest request failed: {e}"))?
            .error_for_status()
            .map_err(|e| format!("manifest status error: {e}"))?;
        let text = resp
            .text()
            .await
            .map_err(|e| format!("manifest body error: {e}"))?;
        serde_json::from_str(&text).map_err(|e| format!("manifest parse error: {e}"))
    }

    async fn download_asset(
        &self,
        request: &AssetRequest,
        dest: &Path,
        cancel: Option<Arc<AtomicBool>>,
    ) -> Result<u64, String> {
        if cancel_requested(&cancel) {
            return Err(CANCELLED.into());
        }
        debug!("network: GET asset {} -> {}", request.url, dest.display());
        let builder = self.client.get(request.url.clone()).timeout(request.timeout);
        let response = with_headers(builder, &request.headers)
            .send()
            .await
            .map_err(|e| format!("download request failed: {e}"))?
            .error_for_status()
            .map_err(|e| format!("download status error: {e}"))?;

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("failed to create asset dir: {e}"))?;
        }
        let partial = partial_path(dest);
        let mut file = File::create(&partial)
            .await
            .map_err(|e| format!("failed to create file: {e}"))?;

        let total = response.content_length();
        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;
        let streamed: Result<(), String> = async {
            while let Some(chunk) = stream.next().await {
                if cancel_requested(&cancel) {
                    return Err(CANCELLED.to_owned());
                }
                let chunk = chunk.map_err(|e| format!("stream error: {e}"))?;
                file.write_all(&chunk)
                    .await
                    .map_err(|e| format!("write error: {e}"))?;
                downloaded += chunk.len() as u64;
            }
            file.flush().await.map_err(|e| format!("flush error: {e}"))
        }
        .await;

        let complete = streamed.and_then(|()| match total {
            Some(total) if downloaded < total => Err(format!(
                "download incomplete: received {downloaded} of {total} bytes"
            )),
            // A cancelled download never lands at `dest`, even when the last chunk is in.
            _ if cancel_requested(&cancel) => Err(CANCELLED.to_owned()),
            _ => Ok(()),
        });
        if let Err(err) = complete {
            drop(file);
            let _ = fs::remove_file(&partial).await;
            return Err(err);
        }

        drop(file);
        fs::rename(&partial, dest)
            .await
            .map_err(|e| format!("failed to move asset into place: {e}"))?;
        Ok(downloaded)
    }
}

fn with_headers(mut builder: RequestBuilder, headers: &[(String, String)]) -> RequestBuilder {
    for (name, value) in headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
}

/// Sibling path used while an asset is still streaming in.
fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}
