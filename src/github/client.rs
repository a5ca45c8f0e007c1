//! Thin HTTP layer shared by the board and repository clients.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

const GITHUB_API_URL: &str = "https://api.github.com";
const USER_AGENT: &str = concat!("storybot/", env!("CARGO_PKG_VERSION"));

/// Bound on every board/host query; a hung call must not stall a poll tick
/// or a pipeline stage indefinitely.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Authenticated GitHub client for one repository.
pub struct GitHubClient {
    http: reqwest::Client,
    token: String,
    /// `owner/repo` slug.
    repo: String,
    api_url: String,
}

impl GitHubClient {
    pub fn new(token: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            token: token.into(),
            repo: repo.into(),
            api_url: GITHUB_API_URL.to_string(),
        }
    }

    /// Point the client at a different API base (tests).
    #[allow(dead_code)]
    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    fn repo_url(&self, path: &str) -> String {
        format!("{}/repos/{}{}", self.api_url, self.repo, path)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .timeout(REQUEST_TIMEOUT)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.repo_url(path);
        self.request(reqwest::Method::GET, &url)
            .send()
            .await
            .with_context(|| format!("Failed to send GET {}", url))?
            .error_for_status()
            .with_context(|| format!("GET {} returned error status", url))?
            .json()
            .await
            .with_context(|| format!("Failed to parse response from {}", url))
    }

    /// GET returning `Ok(None)` on 404 instead of an error.
    pub async fn get_json_opt<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let url = self.repo_url(path);
        let resp = self
            .request(reqwest::Method::GET, &url)
            .send()
            .await
            .with_context(|| format!("Failed to send GET {}", url))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = resp
            .error_for_status()
            .with_context(|| format!("GET {} returned error status", url))?;
        Ok(Some(resp.json().await.with_context(|| {
            format!("Failed to parse response from {}", url)
        })?))
    }

    pub async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T> {
        let url = self.repo_url(path);
        self.request(reqwest::Method::POST, &url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to send POST {}", url))?
            .error_for_status()
            .with_context(|| format!("POST {} returned error status", url))?
            .json()
            .await
            .with_context(|| format!("Failed to parse response from {}", url))
    }

    /// PUT returning the raw response so callers can distinguish "host said
    /// no" from transport failures.
    pub async fn put(&self, path: &str, body: &serde_json::Value) -> Result<reqwest::Response> {
        let url = self.repo_url(path);
        self.request(reqwest::Method::PUT, &url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to send PUT {}", url))
    }

    /// Run a GraphQL query against the host. GraphQL-level errors are
    /// surfaced as `Err`, not silently dropped.
    pub async fn graphql(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let url = format!("{}/graphql", self.api_url);
        let resp: serde_json::Value = self
            .request(reqwest::Method::POST, &url)
            .json(&serde_json::json!({ "query": query, "variables": variables }))
            .send()
            .await
            .context("Failed to send GraphQL request")?
            .error_for_status()
            .context("GraphQL endpoint returned error status")?
            .json()
            .await
            .context("Failed to parse GraphQL response")?;

        if let Some(errors) = resp.get("errors")
            && errors.as_array().is_some_and(|a| !a.is_empty())
        {
            anyhow::bail!("GraphQL query failed: {}", errors);
        }

        resp.get("data")
            .cloned()
            .context("GraphQL response missing data")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_url_builds_repos_path() {
        let client = GitHubClient::new("ghp_x", "acme/widgets");
        assert_eq!(
            client.repo_url("/issues/7"),
            "https://api.github.com/repos/acme/widgets/issues/7"
        );
    }

    #[test]
    fn test_with_api_url_overrides_base() {
        let client =
            GitHubClient::new("ghp_x", "acme/widgets").with_api_url("http://localhost:9999");
        assert_eq!(
            client.repo_url("/pulls"),
            "http://localhost:9999/repos/acme/widgets/pulls"
        );
    }

    #[test]
    fn test_user_agent_carries_version() {
        assert!(USER_AGENT.starts_with("storybot/"));
    }
}
