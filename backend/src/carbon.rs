//! Grid-carbon signal client (WattTime MOER percentile).
//!
//! Basic-auth login yields a bearer token cached for the process lifetime.
//! A 401 on the signal query drops the token and re-authenticates exactly
//! once; any further failure degrades to "no signal" so scheduling
//! proceeds on the TOU calendar alone. All calls carry a 10 s timeout.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::Config;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
enum CarbonError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected response shape")]
    BadResponse,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct SignalIndexResponse {
    data: Vec<SignalPoint>,
}

#[derive(Debug, Deserialize)]
struct SignalPoint {
    value: f64,
}

pub struct CarbonClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    region: String,
    token: RwLock<Option<String>>,
}

impl CarbonClient {
    pub fn new(cfg: &Config) -> Self {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: cfg.watttime_base_url.clone(),
            username: cfg.watttime_username.clone(),
            password: cfg.watttime_password.clone(),
            region: cfg.watttime_region.clone(),
            token: RwLock::new(None),
        }
    }

    /// Current MOER percentile (0–100) for the configured region, or `None`
    /// when the signal is unavailable for any reason.
    pub async fn moer_percent(&self) -> Option<u8> {
        if self.username.is_empty() || self.password.is_empty() {
            return None;
        }

        let token = match self.cached_or_login().await {
            Ok(token) => token,
            Err(e) => {
                warn!("Carbon signal: login failed: {e}");
                return None;
            }
        };

        match self.query(&token).await {
            Ok(percent) => Some(percent),
            Err(CarbonError::Unauthorized) => {
                // token expired: one silent re-auth, one retry
                info!("Carbon signal: token expired, re-authenticating");
                *self.token.write().await = None;
                let token = match self.cached_or_login().await {
                    Ok(token) => token,
                    Err(e) => {
                        warn!("Carbon signal: re-login failed: {e}");
                        return None;
                    }
                };
                match self.query(&token).await {
                    Ok(percent) => Some(percent),
                    Err(e) => {
                        warn!("Carbon signal: query failed after re-auth: {e}");
                        None
                    }
                }
            }
            Err(e) => {
                warn!("Carbon signal: query failed: {e}");
                None
            }
        }
    }

    async fn cached_or_login(&self) -> Result<String, CarbonError> {
        if let Some(token) = self.token.read().await.clone() {
            return Ok(token);
        }
        let resp = self
            .http
            .get(format!("{}/login", self.base_url))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(CarbonError::Unauthorized);
        }
        let login: LoginResponse = resp.error_for_status()?.json().await?;
        *self.token.write().await = Some(login.token.clone());
        info!("Carbon signal: login OK");
        Ok(login.token)
    }

    async fn query(&self, token: &str) -> Result<u8, CarbonError> {
        let url = format!(
            "{}/v3/signal-index?region={}&signal_type=co2_moer",
            self.base_url, self.region
        );
        let resp = self.http.get(url).bearer_auth(token).send().await?;
        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(CarbonError::Unauthorized);
        }
        let body: SignalIndexResponse = resp.error_for_status()?.json().await?;
        let value = body.data.first().ok_or(CarbonError::BadResponse)?.value;
        Ok(value.clamp(0.0, 100.0) as u8)
    }
}
