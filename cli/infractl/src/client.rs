//! HTTP client for API communication.

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Deserialize};

use crate::error::CliError;

/// API client for the lifecycle manager.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Build a URL for an endpoint.
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, CliError> {
        let response = self.client.get(self.url(path)).send().await?;
        self.handle_response(response).await
    }

    /// POST a raw body (descriptions are sent as YAML or JSON text).
    pub async fn post<T: DeserializeOwned>(&self, path: &str, body: String) -> Result<T, CliError> {
        let response = self.client.post(self.url(path)).body(body).send().await?;
        self.handle_response(response).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, CliError> {
        let response = self.client.delete(self.url(path)).send().await?;
        self.handle_response(response).await
    }

    /// Handle a successful or error response.
    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, CliError> {
        let status = response.status();

        if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| CliError::Other(anyhow::anyhow!("Failed to parse response: {}", e)))
        } else {
            self.handle_error(response).await
        }
    }

    /// Handle an error response.
    async fn handle_error<T>(&self, response: reqwest::Response) -> Result<T, CliError> {
        let status = response.status().as_u16();

        let problem: ProblemResponse = response.json().await.unwrap_or_else(|_| ProblemResponse {
            code: "unknown".to_string(),
            detail: "Unknown error".to_string(),
        });

        Err(CliError::api(status, problem.code, problem.detail))
    }
}

/// Problem document returned by the API on errors.
#[derive(Debug, Deserialize)]
struct ProblemResponse {
    code: String,
    detail: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_building() {
        let client = ApiClient::new("http://127.0.0.1:5000/").unwrap();
        assert_eq!(
            client.url("/infrastructures/"),
            "http://127.0.0.1:5000/infrastructures/"
        );
    }
}
