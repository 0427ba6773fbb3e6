//! YouTube Data API v3 playlist source

use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

use super::{ItemPage, ItemSource};
use crate::config::{RetryConfig, SourceConfig};
use crate::error::{Error, Result, SourceError};
use crate::retry::retry_with_backoff;
use crate::types::WorkItem;

/// Lists the videos of a playlist through the `playlistItems` endpoint
///
/// Each entry becomes a watch URL (`<watch_url_base>?v=<video id>`).
pub struct YouTubePlaylistSource {
    http_client: reqwest::Client,
    api_key: String,
    endpoint: Url,
    watch_url_base: Url,
    page_size: u32,
    retry: RetryConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItemsResponse {
    #[serde(default)]
    items: Vec<PlaylistItem>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlaylistItem {
    #[serde(default)]
    snippet: Option<Snippet>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snippet {
    #[serde(default)]
    resource_id: Option<ResourceId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceId {
    #[serde(default)]
    video_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    message: String,
}

impl YouTubePlaylistSource {
    /// Create a source from configuration
    ///
    /// # Errors
    /// Returns a configuration error if no API key is set or a URL is invalid,
    /// and a network error if the HTTP client cannot be built.
    pub fn new(config: &SourceConfig, retry: RetryConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| Error::config("source.api_key", "an API key is required"))?;

        let endpoint = Url::parse(&format!(
            "{}/playlistItems",
            config.api_base_url.trim_end_matches('/')
        ))
        .map_err(|e| Error::config("source.api_base_url", e.to_string()))?;

        let watch_url_base = Url::parse(&config.watch_url_base)
            .map_err(|e| Error::config("source.watch_url_base", e.to_string()))?;

        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("playlist-dl/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http_client,
            api_key,
            endpoint,
            watch_url_base,
            page_size: config.page_size,
            retry,
        })
    }

    fn page_url(&self, collection_id: &str, page_token: Option<&str>) -> Url {
        let mut url = self.endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("part", "snippet")
                .append_pair("playlistId", collection_id)
                .append_pair("maxResults", &self.page_size.to_string())
                .append_pair("key", &self.api_key);
            if let Some(token) = page_token {
                query.append_pair("pageToken", token);
            }
        }
        url
    }

    fn watch_url(&self, video_id: &str) -> WorkItem {
        let mut url = self.watch_url_base.clone();
        url.query_pairs_mut().append_pair("v", video_id);
        WorkItem::new(url.to_string())
    }

    async fn request_page(
        &self,
        collection_id: &str,
        page_token: Option<&str>,
    ) -> std::result::Result<PlaylistItemsResponse, SourceError> {
        let response = self
            .http_client
            .get(self.page_url(collection_id, page_token))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<PlaylistItemsResponse>()
                .await
                .map_err(|e| SourceError::Malformed(e.to_string()));
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiErrorBody>(&body)
            .map(|b| b.error.message)
            .unwrap_or(body);

        Err(match status.as_u16() {
            404 => SourceError::NotFound { message },
            code @ (429 | 500..=599) => SourceError::Unavailable {
                status: code,
                message,
            },
            code => SourceError::Rejected {
                status: code,
                message,
            },
        })
    }
}

#[async_trait]
impl ItemSource for YouTubePlaylistSource {
    async fn list_page(
        &self,
        collection_id: &str,
        page_token: Option<&str>,
    ) -> std::result::Result<ItemPage, SourceError> {
        let what = format!("{collection_id} page {}", page_token.unwrap_or("1"));
        let response = retry_with_backoff(&self.retry, &what, || {
            self.request_page(collection_id, page_token)
        })
        .await?;

        let mut items = Vec::with_capacity(response.items.len());
        for entry in response.items {
            match entry
                .snippet
                .and_then(|s| s.resource_id)
                .and_then(|r| r.video_id)
            {
                Some(video_id) if !video_id.is_empty() => items.push(self.watch_url(&video_id)),
                _ => tracing::warn!(collection_id, "skipping playlist entry without a video id"),
            }
        }

        Ok(ItemPage {
            items,
            next_page_token: response.next_page_token,
        })
    }

    fn name(&self) -> &'static str {
        "youtube"
    }
}
