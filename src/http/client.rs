use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

use crate::error::{ErrorCode, ReflagError, Result};

const USER_AGENT: &str = concat!("reflag-rust/", env!("CARGO_PKG_VERSION"));

/// Thin JSON transport over the Reflag front API.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    base_url: String,
    publishable_key: String,
}

impl HttpClient {
    pub fn new(publishable_key: impl Into<String>, base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder().build().map_err(|e| {
            ReflagError::with_source(ErrorCode::NetworkError, "Failed to create HTTP client", e)
        })?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            publishable_key: publishable_key.into(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Join `path` onto the base URL, tolerating slashes on either side.
    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// GET `path` with the given query pairs. The caller supplies the
    /// publishable key as part of `query`.
    pub async fn get(
        &self,
        path: &str,
        query: &[(String, String)],
        timeout: Duration,
    ) -> Result<Value> {
        let response = self
            .client
            .get(self.url(path))
            .query(query)
            .header("User-Agent", USER_AGENT)
            .timeout(timeout)
            .send()
            .await
            .map_err(convert_error)?;

        handle_response(response).await
    }

    /// POST a JSON body. The response body is ignored.
    pub async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<()> {
        let response = self
            .client
            .post(self.url(path))
            .query(&[("publishableKey", self.publishable_key.as_str())])
            .header("User-Agent", USER_AGENT)
            .json(body)
            .send()
            .await
            .map_err(convert_error)?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(status_to_error(status, &body))
        }
    }
}

async fn handle_response(response: reqwest::Response) -> Result<Value> {
    let status = response.status();

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(status_to_error(status, &body));
    }

    let body = response.text().await.map_err(|e| {
        ReflagError::with_source(ErrorCode::HttpInvalidResponse, "Failed to read response", e)
    })?;

    serde_json::from_str(&body).map_err(|e| {
        ReflagError::with_source(
            ErrorCode::HttpInvalidResponse,
            format!("Failed to parse response: {}", e),
            e,
        )
    })
}

fn status_to_error(status: StatusCode, body: &str) -> ReflagError {
    let (code, category) = match status {
        StatusCode::BAD_REQUEST => (ErrorCode::HttpBadRequest, "Client Error"),
        StatusCode::UNAUTHORIZED => (ErrorCode::HttpUnauthorized, "Authentication Error"),
        StatusCode::FORBIDDEN => (ErrorCode::HttpForbidden, "Authorization Error"),
        StatusCode::NOT_FOUND => (ErrorCode::HttpNotFound, "Not Found"),
        StatusCode::TOO_MANY_REQUESTS => (ErrorCode::HttpRateLimited, "Rate Limited"),
        s if s.is_server_error() => (ErrorCode::HttpServerError, "Server Error"),
        s if s.is_client_error() => (ErrorCode::HttpBadRequest, "Client Error"),
        _ => (ErrorCode::HttpServerError, "Server Error"),
    };

    ReflagError::network_error(code, format!("{}: {} - {}", category, status.as_u16(), body))
}

fn convert_error(error: reqwest::Error) -> ReflagError {
    if error.is_timeout() {
        ReflagError::with_source(ErrorCode::HttpTimeout, "Request timed out", error)
    } else if error.is_connect() {
        ReflagError::with_source(ErrorCode::HttpNetworkError, "Connection failed", error)
    } else if error.is_builder() {
        ReflagError::with_source(ErrorCode::InvalidArgument, "Invalid request", error)
    } else {
        ReflagError::with_source(ErrorCode::NetworkError, error.to_string(), error)
    }
}
