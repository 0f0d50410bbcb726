use peerview_ws_proto::{LoginRequest, LoginResponse};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha512};

/// Hex encoded SHA-512 of `input`. Credentials only leave the client in this form.
pub fn digest(input: &str) -> String {
    format!("{:x}", Sha512::digest(input.as_bytes()))
}

#[derive(Clone, Debug)]
pub struct LoginClient {
    inner: reqwest::Client,
    base_url: Url,
}

impl LoginClient {
    const LOGIN: [&'static str; 2] = ["api", "login"];

    pub fn new(base_url: Url) -> Result<Self, RequestError> {
        if base_url.cannot_be_a_base() {
            return Err(RequestError::Fatal(anyhow::anyhow!(
                "base url needs to be usable as base"
            )));
        }
        Ok(LoginClient {
            inner: reqwest::Client::new(),
            base_url,
        })
    }

    /// `Ok(false)` if the hub refused the credentials.
    #[tracing::instrument(skip(self, password))]
    pub async fn login(&self, username: &str, password: &str) -> Result<bool, RequestError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| RequestError::Fatal(anyhow::anyhow!("base url is not a base")))?
            .pop_if_empty()
            .extend(Self::LOGIN);
        let request = LoginRequest {
            username: digest(username),
            password: digest(password),
        };
        let response = self
            .inner
            .post(url)
            .json(&request)
            .send()
            .await
            .map_err(|e| RequestError::Retriable(e.into()))?;
        if response.status() == StatusCode::UNAUTHORIZED {
            tracing::info!("credentials rejected");
            return Ok(false);
        }
        let LoginResponse { success } = Self::handle_response(response).await?;
        Ok(success)
    }

    async fn handle_response<V: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<V, RequestError> {
        let status = response.status();
        let body = response.bytes().await.map_err(|e| {
            tracing::warn!("failed to read response body: {}", e);
            RequestError::Retriable(anyhow::Error::from(e))
        })?;
        if status.is_success() {
            return serde_json::from_slice(&body).map_err(|e| {
                let body = std::str::from_utf8(&body).unwrap_or("NOT_VALID_UTF8");
                tracing::warn!("failed to parse response '{}': {}", body, e);
                RequestError::Fatal(anyhow::anyhow!("failed to parse response body"))
            });
        }
        let body = std::str::from_utf8(&body).unwrap_or("NOT_VALID_UTF8");

        if status.is_client_error() {
            Err(RequestError::Fatal(anyhow::anyhow!(
                "client error response: {}",
                body
            )))
        } else {
            Err(RequestError::Retriable(anyhow::anyhow!(
                "server error response: {}",
                body
            )))
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum RequestError {
    #[error("retriable error making request: {0}")]
    Retriable(anyhow::Error),
    #[error("fatal error making request: {0}")]
    Fatal(anyhow::Error),
}
