//! HTTP client for the cooperative measurement origin.
//!
//! The origin contract is exactly three endpoints: `GET /ping`, `GET
//! /download`, `POST /upload`. The origin's own implementation is out of
//! scope for this crate; this module only knows how to talk to it.

use crate::model::RunConfig;
use anyhow::{Context, Result};
use reqwest::Url;
use std::time::Duration;

#[derive(Clone)]
pub struct OriginClient {
    pub base_url: Url,
    pub meas_id: String,
    pub http: reqwest::Client,
}

impl OriginClient {
    pub fn new(cfg: &RunConfig) -> Result<Self> {
        let base_url = Url::parse(&cfg.base_url).context("invalid base_url")?;

        let http = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .tcp_keepalive(Duration::from_secs(15))
            .build()
            .context("failed to build http client")?;

        Ok(Self {
            base_url,
            meas_id: cfg.meas_id.clone(),
            http,
        })
    }

    pub fn ping_url(&self) -> Url {
        self.base_url.join("/ping").expect("join /ping")
    }

    pub fn download_url(&self) -> Url {
        self.base_url.join("/download").expect("join /download")
    }

    pub fn upload_url(&self) -> Url {
        self.base_url.join("/upload").expect("join /upload")
    }

    /// Issue one cache-defeating `GET /ping` and return the observed
    /// round-trip time in milliseconds. Callers apply their own timeout.
    pub async fn ping(&self, stream_tag: &str, timeout: Duration) -> Result<f64> {
        let mut url = self.ping_url();
        url.query_pairs_mut()
            .append_pair("measId", &self.meas_id)
            .append_pair("cb", &nonce());

        let start = std::time::Instant::now();
        self.http
            .get(url)
            .header("Cache-Control", "no-store")
            .header("X-Stream-ID", stream_tag)
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?;
        Ok(start.elapsed().as_secs_f64() * 1000.0)
    }
}

/// A short cache-defeating query value. Not cryptographically meaningful --
/// it only needs to differ from request to request.
fn nonce() -> String {
    use rand::RngCore;
    let mut b = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut b);
    u64::from_le_bytes(b).to_string()
}
