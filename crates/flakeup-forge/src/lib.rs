//! Forge HTTP layer: retrying fetches, GitHub auth discovery, and
//! rate-limit handling.
//!
//! All upstream version/metadata traffic goes through [`ForgeClient`]. The
//! client retries the fixed set of retryable status codes with exponential
//! backoff, honors `Retry-After`, attaches a GitHub bearer token from the
//! environment or `~/.netrc` when talking to the API host, and converts an
//! exhausted rate limit into its own error kind carrying the reset time.

use std::path::PathBuf;
use std::time::Duration;

use chrono::DateTime;
use reqwest::header::{HeaderMap, RETRY_AFTER};

use flakeup_config::UpdateConfig;
use flakeup_retry::{RetryStrategyConfig, calculate_delay, is_retryable_status};
use flakeup_types::UpdateError;

const GITHUB_API_BASE: &str = "https://api.github.com";

/// Return a GitHub raw-content URL for a repo path at a revision.
pub fn github_raw_url(owner: &str, repo: &str, rev: &str, path: &str) -> String {
    format!("https://raw.githubusercontent.com/{owner}/{repo}/{rev}/{path}")
}

/// Return a GitHub API URL for an API path.
pub fn github_api_url(path: &str) -> String {
    format!("{GITHUB_API_BASE}/{path}")
}

/// Extract a token for one of `hosts` from netrc-format text.
///
/// Handles the flat token stream format: `machine <host> login <user>
/// password <secret>`, in any order within a machine block.
pub fn token_from_netrc(text: &str, hosts: &[&str]) -> Option<String> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let mut current_host: Option<&str> = None;
    let mut index = 0;
    while index + 1 < tokens.len() {
        match tokens[index] {
            "machine" => {
                current_host = Some(tokens[index + 1]);
                index += 2;
            }
            "password" => {
                let password = tokens[index + 1];
                if let Some(host) = current_host
                    && hosts.contains(&host)
                {
                    return Some(password.to_string());
                }
                index += 2;
            }
            _ => index += 1,
        }
    }
    None
}

fn github_token() -> Option<String> {
    if let Ok(token) = std::env::var("GITHUB_TOKEN")
        && !token.trim().is_empty()
    {
        return Some(token);
    }
    let netrc_path: PathBuf = std::env::home_dir()?.join(".netrc");
    let text = std::fs::read_to_string(netrc_path).ok()?;
    token_from_netrc(&text, &["api.github.com", "github.com"])
}

fn rate_limit_reset(headers: &HeaderMap) -> Option<String> {
    let reset = headers.get("X-RateLimit-Reset")?.to_str().ok()?;
    let timestamp: i64 = reset.parse().ok()?;
    Some(
        DateTime::from_timestamp(timestamp, 0)
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_else(|| reset.to_string()),
    )
}

fn check_rate_limit(headers: &HeaderMap, url: &str) -> Result<(), UpdateError> {
    let Some(remaining) = headers
        .get("X-RateLimit-Remaining")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
    else {
        return Ok(());
    };
    if remaining > 0 {
        return Ok(());
    }
    Err(UpdateError::RateLimit {
        url: url.to_string(),
        reset: rate_limit_reset(headers),
    })
}

/// HTTP client for forge APIs and artifact downloads.
#[derive(Debug, Clone)]
pub struct ForgeClient {
    client: reqwest::Client,
    retry: RetryStrategyConfig,
    timeout: Duration,
}

impl ForgeClient {
    pub fn new(config: &UpdateConfig) -> Result<Self, UpdateError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|err| UpdateError::message(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            client,
            retry: RetryStrategyConfig::for_http(config.retries, config.retry_backoff),
            timeout: Duration::from_secs(config.http_timeout),
        })
    }

    async fn request(&self, url: &str) -> Result<(Vec<u8>, HeaderMap), UpdateError> {
        let attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let mut builder = self.client.get(url).timeout(self.timeout);
            if url.starts_with(GITHUB_API_BASE)
                && let Some(token) = github_token()
            {
                builder = builder.bearer_auth(token);
            }

            let failure = match builder.send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let headers = response.headers().clone();
                    let payload = response.bytes().await.map_err(|err| UpdateError::Network {
                        url: url.to_string(),
                        message: format!("failed to read response body: {err}"),
                        status: Some(status),
                    })?;
                    if status < 400 {
                        return Ok((payload.to_vec(), headers));
                    }
                    if status == 429 || status == 403 {
                        check_rate_limit(&headers, url)?;
                    }
                    if !is_retryable_status(status) || attempt >= attempts {
                        let body = String::from_utf8_lossy(&payload);
                        let detail = body.trim();
                        let message = if detail.is_empty() {
                            format!("HTTP {status} after {attempt} attempt(s)")
                        } else {
                            format!("HTTP {status} after {attempt} attempt(s)\n{detail}")
                        };
                        return Err(UpdateError::Network {
                            url: url.to_string(),
                            message,
                            status: Some(status),
                        });
                    }
                    retry_after(&headers)
                }
                Err(err) => {
                    if attempt >= attempts {
                        return Err(UpdateError::Network {
                            url: url.to_string(),
                            message: format!("{err} after {attempt} attempt(s)"),
                            status: None,
                        });
                    }
                    None
                }
            };

            let delay = failure.unwrap_or_else(|| calculate_delay(&self.retry, attempt));
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Fetch raw bytes from a URL.
    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, UpdateError> {
        let (payload, _) = self.request(url).await?;
        Ok(payload)
    }

    /// Fetch raw text from a URL.
    pub async fn fetch_text(&self, url: &str) -> Result<String, UpdateError> {
        let payload = self.fetch_bytes(url).await?;
        Ok(String::from_utf8_lossy(&payload).into_owned())
    }

    /// Fetch and decode JSON. GitHub API responses are additionally
    /// checked for an exhausted rate limit.
    pub async fn fetch_json(&self, url: &str) -> Result<serde_json::Value, UpdateError> {
        let (payload, headers) = self.request(url).await?;
        if url.starts_with(GITHUB_API_BASE) {
            check_rate_limit(&headers, url)?;
        }
        serde_json::from_slice(&payload).map_err(|err| UpdateError::Network {
            url: url.to_string(),
            message: format!("invalid JSON response: {err}"),
            status: None,
        })
    }

    /// Fetch JSON from a GitHub API path with query parameters.
    pub async fn github_api(
        &self,
        api_path: &str,
        params: &[(&str, &str)],
    ) -> Result<serde_json::Value, UpdateError> {
        let mut url = github_api_url(api_path);
        if !params.is_empty() {
            let query: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();
            url = format!("{url}?{}", query.join("&"));
        }
        self.fetch_json(&url).await
    }

    /// Default branch name for a repository.
    pub async fn default_branch(&self, owner: &str, repo: &str) -> Result<String, UpdateError> {
        let data = self.github_api(&format!("repos/{owner}/{repo}"), &[]).await?;
        data.get("default_branch")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                UpdateError::message(format!("no default branch reported for {owner}/{repo}"))
            })
    }

    /// Latest commit SHA that touched `file_path` on `branch`.
    pub async fn latest_commit_for_path(
        &self,
        owner: &str,
        repo: &str,
        file_path: &str,
        branch: &str,
    ) -> Result<String, UpdateError> {
        let data = self
            .github_api(
                &format!("repos/{owner}/{repo}/commits"),
                &[("path", file_path), ("sha", branch), ("per_page", "1")],
            )
            .await?;
        data.as_array()
            .and_then(|commits| commits.first())
            .and_then(|commit| commit.get("sha"))
            .and_then(|sha| sha.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                UpdateError::message(format!("no commits found for {owner}/{repo}:{file_path}"))
            })
    }

    /// Recent releases, newest first (as the forge returns them).
    pub async fn releases(
        &self,
        owner: &str,
        repo: &str,
        per_page: u32,
    ) -> Result<Vec<serde_json::Value>, UpdateError> {
        let per_page = per_page.to_string();
        let data = self
            .github_api(
                &format!("repos/{owner}/{repo}/releases"),
                &[("per_page", per_page.as_str())],
            )
            .await?;
        data.as_array().cloned().ok_or_else(|| {
            UpdateError::message(format!("unexpected releases payload for {owner}/{repo}"))
        })
    }

    /// Recent tags. External invariant: the forge returns these in
    /// reverse chronological order; tag selection relies on it.
    pub async fn tags(
        &self,
        owner: &str,
        repo: &str,
        per_page: u32,
    ) -> Result<Vec<serde_json::Value>, UpdateError> {
        let per_page = per_page.to_string();
        let data = self
            .github_api(
                &format!("repos/{owner}/{repo}/tags"),
                &[("per_page", per_page.as_str())],
            )
            .await?;
        data.as_array().cloned().ok_or_else(|| {
            UpdateError::message(format!("unexpected tags payload for {owner}/{repo}"))
        })
    }

    /// Latest release tag, or an error when the repo has none.
    pub async fn latest_release_tag(&self, owner: &str, repo: &str) -> Result<String, UpdateError> {
        let data = self
            .github_api(&format!("repos/{owner}/{repo}/releases/latest"), &[])
            .await?;
        data.get("tag_name")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                UpdateError::message(format!("no latest release tag for {owner}/{repo}"))
            })
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn test_config() -> UpdateConfig {
        UpdateConfig {
            retries: 3,
            retry_backoff: 0.0,
            http_timeout: 5,
            ..Default::default()
        }
    }

    fn serve_responses(
        responses: Vec<(u16, &'static str, Vec<(String, String)>)>,
    ) -> (String, Arc<AtomicUsize>) {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("bind test server");
        let url = format!("http://{}", server.server_addr());
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();

        std::thread::spawn(move || {
            for (status, body, headers) in responses {
                let Ok(request) = server.recv() else { return };
                hits_clone.fetch_add(1, Ordering::SeqCst);
                let mut response = tiny_http::Response::from_string(body)
                    .with_status_code(tiny_http::StatusCode(status));
                for (name, value) in &headers {
                    response.add_header(
                        tiny_http::Header::from_bytes(name.as_bytes(), value.as_bytes()).unwrap(),
                    );
                }
                let _ = request.respond(response);
            }
        });

        (url, hits)
    }

    #[tokio::test]
    async fn fetch_json_parses_payload() {
        let (url, _) = serve_responses(vec![(200, r#"{"version": "1.2.3"}"#, vec![])]);
        let client = ForgeClient::new(&test_config()).unwrap();
        let data = client.fetch_json(&url).await.unwrap();
        assert_eq!(data["version"], "1.2.3");
    }

    #[tokio::test]
    async fn retries_retryable_statuses() {
        let (url, hits) = serve_responses(vec![
            (503, "try later", vec![]),
            (200, r#"{"ok": true}"#, vec![]),
        ]);
        let client = ForgeClient::new(&test_config()).unwrap();
        let data = client.fetch_json(&url).await.unwrap();
        assert_eq!(data["ok"], true);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_retryable_status_fails_immediately() {
        let (url, hits) = serve_responses(vec![(404, "missing", vec![])]);
        let client = ForgeClient::new(&test_config()).unwrap();
        let err = client.fetch_bytes(&url).await.unwrap_err();
        match err {
            UpdateError::Network { status, message, .. } => {
                assert_eq!(status, Some(404));
                assert!(message.contains("missing"));
            }
            other => panic!("expected network error, got {other}"),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_rate_limit_is_its_own_error() {
        let (url, _) = serve_responses(vec![(
            403,
            "rate limited",
            vec![
                ("X-RateLimit-Remaining".to_string(), "0".to_string()),
                ("X-RateLimit-Reset".to_string(), "1700000000".to_string()),
            ],
        )]);
        let client = ForgeClient::new(&test_config()).unwrap();
        let err = client.fetch_bytes(&url).await.unwrap_err();
        match err {
            UpdateError::RateLimit { reset, .. } => {
                assert!(reset.unwrap().starts_with("2023-11-14"));
            }
            other => panic!("expected rate limit error, got {other}"),
        }
    }

    #[tokio::test]
    async fn invalid_json_is_a_network_error() {
        let (url, _) = serve_responses(vec![(200, "not json", vec![])]);
        let client = ForgeClient::new(&test_config()).unwrap();
        let err = client.fetch_json(&url).await.unwrap_err();
        assert!(err.to_string().contains("invalid JSON"));
    }

    #[test]
    fn raw_and_api_urls() {
        assert_eq!(
            github_raw_url("acme", "tool", "deadbeef", "Cargo.lock"),
            "https://raw.githubusercontent.com/acme/tool/deadbeef/Cargo.lock"
        );
        assert_eq!(
            github_api_url("repos/acme/tool/tags"),
            "https://api.github.com/repos/acme/tool/tags"
        );
    }

    #[test]
    fn netrc_token_extraction() {
        let netrc = "machine example.com login a password nope\n\
                     machine api.github.com login me password ghp_secret\n";
        assert_eq!(
            token_from_netrc(netrc, &["api.github.com", "github.com"]),
            Some("ghp_secret".to_string())
        );
        assert_eq!(token_from_netrc(netrc, &["gitlab.com"]), None);
        assert_eq!(token_from_netrc("", &["github.com"]), None);
    }

    #[test]
    fn retry_after_header_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, "7".parse().unwrap());
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));

        let mut bad = HeaderMap::new();
        bad.insert(RETRY_AFTER, "soon".parse().unwrap());
        assert_eq!(retry_after(&bad), None);
    }
}
