//! Thin reqwest wrapper for calling peer ActingWeb endpoints.
//!
//! Builder-chain style follows the teacher's HTTP verifiers
//! (`.post().header().json().send().await`) rather than a generated client.

use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::TimeoutBudget;
use crate::error::{ActingWebError, Result};

#[derive(Clone)]
pub struct PeerClient {
    http: reqwest::Client,
}

impl PeerClient {
    pub fn new(timeout: TimeoutBudget) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(timeout.connect())
            .timeout(timeout.total())
            .build()
            .expect("reqwest client builds with static config");
        PeerClient { http }
    }

    /// For tests that need to point at a `wiremock` server with its own
    /// client settings.
    pub fn from_client(http: reqwest::Client) -> Self {
        PeerClient { http }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str, bearer: &str) -> Result<T> {
        self.call_json(Method::GET, url, bearer, None::<&()>).await
    }

    pub async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        url: &str,
        bearer: &str,
        body: &B,
    ) -> Result<T> {
        self.call_json(Method::POST, url, bearer, Some(body)).await
    }

    pub async fn put_json<B: Serialize>(&self, url: &str, bearer: &str, body: &B) -> Result<()> {
        let resp = self
            .http
            .request(Method::PUT, url)
            .bearer_auth(bearer)
            .json(body)
            .send()
            .await
            .map_err(to_peer_error)?;
        ok_or_error(resp).await.map(|_| ())
    }

    pub async fn delete(&self, url: &str, bearer: &str) -> Result<()> {
        let resp = self
            .http
            .request(Method::DELETE, url)
            .bearer_auth(bearer)
            .send()
            .await
            .map_err(to_peer_error)?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(()),
            status if status.is_success() => Ok(()),
            status => Err(error_for_status(status, resp).await),
        }
    }

    async fn call_json<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        bearer: &str,
        body: Option<&B>,
    ) -> Result<T> {
        let mut req = self.http.request(method, url).bearer_auth(bearer);
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await.map_err(to_peer_error)?;
        let resp = ok_or_error(resp).await?;
        resp.json::<T>().await.map_err(|e| {
            ActingWebError::peer_communication(None, format!("invalid response body: {e}"))
        })
    }
}

async fn ok_or_error(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else {
        Err(error_for_status(status, resp).await)
    }
}

async fn error_for_status(status: StatusCode, resp: reqwest::Response) -> ActingWebError {
    let message = resp
        .text()
        .await
        .unwrap_or_else(|_| status.canonical_reason().unwrap_or("unknown").to_string());
    ActingWebError::peer_communication(Some(status.as_u16()), message)
}

fn to_peer_error(err: reqwest::Error) -> ActingWebError {
    ActingWebError::peer_communication(err.status().map(|s| s.as_u16()), err.to_string())
}

/// `delay_ms * 2^attempt`, used for both meta-fetch and optimistic-lock
/// retry backoff (spec §B.1, §4.4.2).
pub fn exponential_backoff(base_ms: u64, attempt: u32) -> Duration {
    Duration::from_millis(base_ms.saturating_mul(1u64 << attempt.min(16)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(exponential_backoff(500, 0), Duration::from_millis(500));
        assert_eq!(exponential_backoff(500, 1), Duration::from_millis(1000));
        assert_eq!(exponential_backoff(500, 2), Duration::from_millis(2000));
    }
}
