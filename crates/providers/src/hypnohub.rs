use crate::{parse_page, Filter, ProviderError, RawRecord, RemoteIndex};
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

#[derive(Clone, Debug)]
pub struct HypnohubConfig {
    pub base_url: String,
    pub user_agent: String,
    pub timeout: Duration,
    /// Hard cap the server applies to `limit`.
    pub max_page_size: u32,
}

impl Default for HypnohubConfig {
    fn default() -> Self {
        Self {
            base_url: "https://hypnohub.net".to_string(),
            user_agent: concat!("post-finder/", env!("CARGO_PKG_VERSION")).to_string(),
            timeout: Duration::from_secs(30),
            max_page_size: 1000,
        }
    }
}

/// JSON client for a Moebooru-style `/post/index.json` endpoint.
#[derive(Clone)]
pub struct HypnohubClient {
    client: Client,
    cfg: HypnohubConfig,
}

impl HypnohubClient {
    pub fn new(cfg: HypnohubConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(cfg.timeout)
            .gzip(true)
            .build()
            .map_err(|e| ProviderError::Transient(e.to_string()))?;
        Ok(Self { client, cfg })
    }

    fn index_url(&self) -> String {
        format!("{}/post/index.json", self.cfg.base_url.trim_end_matches('/'))
    }
}

#[async_trait::async_trait]
impl RemoteIndex for HypnohubClient {
    async fn fetch(
        &self,
        filter: &Filter,
        page: u32,
        limit: u32,
    ) -> Result<Vec<RawRecord>, ProviderError> {
        let tags = filter.to_query();
        let limit = limit.min(self.cfg.max_page_size);
        debug!(%tags, page, limit, "fetching remote page");

        let page = page.to_string();
        let limit = limit.to_string();
        let resp = self
            .client
            .get(self.index_url())
            .query(&[
                ("tags", tags.as_str()),
                ("page", page.as_str()),
                ("limit", limit.as_str()),
            ])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.bytes().await.unwrap_or(Bytes::from_static(b""));
            let body = String::from_utf8_lossy(&body).into_owned();
            if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                return Err(ProviderError::Transient(format!("status {status}: {body}")));
            }
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = resp.bytes().await?;
        parse_page(&body)
    }

    fn max_page_size(&self) -> Option<u32> {
        Some(self.cfg.max_page_size)
    }
}
