//! Authenticated HTTP client for the Loop REST API.
//!
//! Every request goes through [`LoopHttpClient::send`], which applies the
//! two transport-level recovery rules:
//!
//! - `429 Too Many Requests` is retried after a fixed delay, up to
//!   [`HttpConfig::rate_limit_attempts`] attempts in total.
//! - `401 Unauthorized` triggers one re-authentication followed by a
//!   single retry (only when credentials are configured).
//!
//! Any other status is handed back to the caller untouched.

use std::path::PathBuf;
use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::TransferError;

/// Connection settings for the Loop REST API.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Base URL without the `/api` suffix, e.g. `https://learning-loop.ai`.
    pub base_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Extra PEM root certificate to trust.
    pub ssl_cert_path: Option<PathBuf>,
    pub request_timeout: Duration,
    pub rate_limit_delay: Duration,
    pub rate_limit_attempts: u32,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: "https://learning-loop.ai".into(),
            username: None,
            password: None,
            ssl_cert_path: None,
            request_timeout: Duration::from_secs(60),
            rate_limit_delay: Duration::from_secs(5),
            rate_limit_attempts: 10,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// HTTP client bound to one Loop deployment.
pub struct LoopHttpClient {
    client: reqwest::Client,
    config: HttpConfig,
    token: RwLock<Option<String>>,
}

impl LoopHttpClient {
    pub fn new(config: HttpConfig) -> Result<Self, TransferError> {
        let mut builder = reqwest::Client::builder().timeout(config.request_timeout);

        if let Some(path) = &config.ssl_cert_path {
            let pem = std::fs::read(path).map_err(|e| TransferError::io(path, e))?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }

        Ok(Self {
            client: builder.build()?,
            config,
            token: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    /// Absolute URL of an API path, e.g. `/zauber/projects/demo/data`.
    pub fn url(&self, path: &str) -> String {
        format!("{}/api{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn has_credentials(&self) -> bool {
        self.config.username.is_some() && self.config.password.is_some()
    }

    /// Exchange the configured credentials for a bearer token.
    pub async fn login(&self) -> Result<(), TransferError> {
        let (Some(username), Some(password)) = (&self.config.username, &self.config.password)
        else {
            return Err(TransferError::Auth("no credentials configured".into()));
        };

        let response = self
            .client
            .post(self.url("/token"))
            .form(&[("username", username), ("password", password)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(TransferError::Auth(format!(
                "login rejected with HTTP {}",
                response.status().as_u16()
            )));
        }

        let token: TokenResponse = response.json().await?;
        *self.token.write().await = Some(token.access_token);
        tracing::info!(base_url = %self.config.base_url, "Authenticated against the Loop");
        Ok(())
    }

    /// Current bearer token, if logged in.
    pub async fn token(&self) -> Option<String> {
        self.token.read().await.clone()
    }

    /// Send a request built by `build`, applying the 429/401 rules.
    ///
    /// `build` is invoked once per attempt so bodies (including multipart
    /// forms) are rebuilt for each retry.
    pub async fn send<F>(&self, build: F) -> Result<reqwest::Response, TransferError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let mut attempt = 0u32;
        let mut reauthenticated = false;

        loop {
            attempt += 1;
            let mut request = build(&self.client);
            if let Some(token) = self.token().await {
                request = request.bearer_auth(token);
            }

            let response = request.send().await?;
            match response.status() {
                StatusCode::TOO_MANY_REQUESTS if attempt < self.config.rate_limit_attempts => {
                    tracing::warn!(
                        url = %response.url(),
                        attempt,
                        delay_ms = self.config.rate_limit_delay.as_millis() as u64,
                        "Rate limited by the Loop, retrying",
                    );
                    tokio::time::sleep(self.config.rate_limit_delay).await;
                }
                StatusCode::UNAUTHORIZED if !reauthenticated && self.has_credentials() => {
                    tracing::info!(url = %response.url(), "Unauthorized, re-authenticating");
                    reauthenticated = true;
                    self.login().await?;
                }
                _ => return Ok(response),
            }
        }
    }

    pub async fn get(&self, path: &str) -> Result<reqwest::Response, TransferError> {
        let url = self.url(path);
        self.send(|c| c.get(&url)).await
    }

    pub async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, TransferError> {
        let url = self.url(path);
        self.send(|c| c.post(&url).json(body)).await
    }
}

/// Ensure the response has a success status code, otherwise turn it into
/// [`TransferError::Status`].
pub async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, TransferError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<unreadable body>".to_string());
    Err(TransferError::Status {
        status: status.as_u16(),
        url,
        body,
    })
}
