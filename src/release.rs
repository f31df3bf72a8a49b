//! Release metadata and asset downloads from GitHub releases.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::{PatchError, PatchResult};

/// Repository publishing the modded archives.
pub const RELEASE_REPO: &str = "sidekick-mods/sidekick-asar";

const API_BASE_URL: &str = "https://api.github.com";

/// Connection timeout: time to establish TCP connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Read timeout: maximum time to wait for data between chunks
const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// GitHub release asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseAsset {
    /// Filename of the asset.
    pub name: String,
    /// Direct download URL.
    #[serde(rename = "browser_download_url")]
    pub download_url: String,
    /// File size in bytes.
    pub size: u64,
}

/// GitHub release information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseInfo {
    /// Release title; GitHub allows it to be null.
    #[serde(default)]
    pub name: Option<String>,
    pub tag_name: String,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    pub assets: Vec<ReleaseAsset>,
}

impl ReleaseInfo {
    /// Title, falling back to the tag.
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.tag_name)
    }
}

/// A response body being streamed.
pub struct DownloadStream {
    /// `Content-Length` if the server sent one.
    pub content_length: Option<u64>,
    pub chunks: BoxStream<'static, PatchResult<Bytes>>,
}

/// Where releases come from.
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    async fn latest_release(&self, token: Option<&str>) -> PatchResult<ReleaseInfo>;

    async fn download(&self, url: &str, token: Option<&str>) -> PatchResult<DownloadStream>;
}

/// GitHub releases API client.
pub struct GithubReleases {
    client: Client,
    repo: String,
    api_base: String,
}

impl GithubReleases {
    pub fn new(repo: impl Into<String>) -> PatchResult<Self> {
        let client = Client::builder()
            .user_agent(concat!("asarmod/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .build()
            .map_err(|e| PatchError::Download {
                url: API_BASE_URL.to_string(),
                reason: format!("failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            repo: repo.into(),
            api_base: API_BASE_URL.to_string(),
        })
    }

    /// Point at a different API host (GitHub Enterprise, test servers).
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    fn latest_url(&self) -> String {
        format!("{}/repos/{}/releases/latest", self.api_base, self.repo)
    }

    fn get(&self, url: &str, token: Option<&str>) -> reqwest::RequestBuilder {
        let request = self.client.get(url);
        match token.filter(|t| !t.is_empty()) {
            Some(token) => request.header(AUTHORIZATION, format!("Bearer {}", token)),
            None => request,
        }
    }
}

/// Map a non-success response to a typed error.
pub fn classify_status(status: StatusCode, headers: &HeaderMap, what: &str) -> PatchError {
    let remaining_zero = headers
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim() == "0")
        .unwrap_or(false);

    if status == StatusCode::TOO_MANY_REQUESTS || (status == StatusCode::FORBIDDEN && remaining_zero) {
        let reset = headers
            .get("x-ratelimit-reset")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
            .and_then(|secs| DateTime::from_timestamp(secs, 0));
        return PatchError::RateLimited { reset };
    }

    if status == StatusCode::NOT_FOUND {
        return PatchError::NotFound {
            what: what.to_string(),
        };
    }

    PatchError::Download {
        url: what.to_string(),
        reason: format!("HTTP {}", status.as_u16()),
    }
}

fn transport_err(url: &str, e: reqwest::Error) -> PatchError {
    PatchError::Download {
        url: url.to_string(),
        reason: e.to_string(),
    }
}

#[async_trait]
impl ReleaseSource for GithubReleases {
    async fn latest_release(&self, token: Option<&str>) -> PatchResult<ReleaseInfo> {
        let url = self.latest_url();
        debug!("Fetching {}", url);

        let response = self
            .get(&url, token)
            .header(ACCEPT, "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| transport_err(&url, e))?;

        if !response.status().is_success() {
            return Err(classify_status(
                response.status(),
                response.headers(),
                &format!("latest release of {}", self.repo),
            ));
        }

        response
            .json::<ReleaseInfo>()
            .await
            .map_err(|e| transport_err(&url, e))
    }

    async fn download(&self, url: &str, token: Option<&str>) -> PatchResult<DownloadStream> {
        let response = self
            .get(url, token)
            .header(ACCEPT, "application/octet-stream")
            .send()
            .await
            .map_err(|e| transport_err(url, e))?;

        if !response.status().is_success() {
            return Err(classify_status(response.status(), response.headers(), url));
        }

        let content_length = response.content_length();
        let owned_url = url.to_string();
        let chunks = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| transport_err(&owned_url, e)))
            .boxed();

        Ok(DownloadStream {
            content_length,
            chunks,
        })
    }
}
