use std::time::Duration;

use anyhow::{anyhow, Context};
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{header::HeaderMap, header::HeaderValue, Response, StatusCode};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_tracing::{SpanBackendWithUrl, TracingMiddleware};
use secrecy::{ExposeSecret, Secret};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use octotriage::integrations::github::GithubNotificationThread;

use crate::{integrations::APP_USER_AGENT, octotriage::OctotriageError};

static GITHUB_BASE_URL: &str = "https://api.github.com";

/// Thin capability over the GitHub REST API: list notification threads since
/// a checkpoint, fetch subject detail, fetch activity streams. Holds no
/// mutable state other than the active token.
#[derive(Debug)]
pub struct GithubService {
    github_base_url: String,
    page_size: usize,
    token: RwLock<Option<Secret<String>>>,
}

impl GithubService {
    pub fn new(
        github_base_url: Option<String>,
        page_size: usize,
    ) -> Result<GithubService, OctotriageError> {
        Ok(GithubService {
            github_base_url: github_base_url.unwrap_or_else(|| GITHUB_BASE_URL.to_string()),
            page_size,
            token: RwLock::new(None),
        })
    }

    pub async fn has_token(&self) -> bool {
        self.token.read().await.is_some()
    }

    /// Validate the token against the identity endpoint, then make it the
    /// active token for subsequent calls. Invalid tokens fail fast.
    #[tracing::instrument(level = "debug", skip_all, err)]
    pub async fn set_token(&self, token: Secret<String>) -> Result<(), OctotriageError> {
        let response = self
            .client(&token)?
            .get(format!("{}/user", self.github_base_url))
            .send()
            .await
            .context("Cannot reach the GitHub identity endpoint")?;

        match response.status() {
            StatusCode::OK => {
                let login = response
                    .json::<serde_json::Value>()
                    .await
                    .ok()
                    .and_then(|user| user.get("login").and_then(|l| l.as_str()).map(String::from))
                    .unwrap_or_else(|| "<unknown>".to_string());
                info!("Authenticated against GitHub as {login}");
                *self.token.write().await = Some(token);
                Ok(())
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(OctotriageError::Unauthorized(
                anyhow!("GitHub rejected the configured token"),
            )),
            status => Err(OctotriageError::Recoverable(anyhow!(
                "GitHub identity endpoint answered {status}"
            ))),
        }
    }

    /// Fetch every notification thread updated since the checkpoint,
    /// paginating until a short page. `None` asks for all accessible
    /// history, bounded by the provider.
    #[tracing::instrument(level = "debug", skip(self), err)]
    pub async fn list_notifications(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<GithubNotificationThread>, OctotriageError> {
        let token = self.active_token().await?;
        let mut threads: Vec<GithubNotificationThread> = Vec::new();
        let mut page = 1u32;

        loop {
            let mut url = format!(
                "{}/notifications?all=true&page={page}&per_page={}",
                self.github_base_url, self.page_size
            );
            if let Some(since) = since {
                url.push_str(&format!(
                    "&since={}",
                    since.to_rfc3339_opts(SecondsFormat::Secs, true)
                ));
            }

            let response = self
                .client(&token)?
                .get(&url)
                .send()
                .await
                .map_err(|err| {
                    OctotriageError::Recoverable(anyhow!(
                        "Cannot fetch notifications from GitHub: {err}"
                    ))
                })?;
            let response = check_upstream_status(response)?;
            let wait_hint = rate_limit_wait(response.headers());

            let body = response
                .text()
                .await
                .context("Failed to read notifications response from GitHub")?;
            let page_threads: Vec<GithubNotificationThread> = serde_json::from_str(&body)
                .map_err(|err| OctotriageError::from_json_serde_error(err, body))?;

            let is_last_page = page_threads.len() < self.page_size;
            threads.extend(page_threads);
            if is_last_page {
                break;
            }
            if let Some(wait) = wait_hint {
                warn!("GitHub rate limit hit, waiting {wait:?} before the next page");
                tokio::time::sleep(wait).await;
            }
            page += 1;
        }

        debug!("Fetched {} notification threads from GitHub", threads.len());
        Ok(threads)
    }

    /// Fetch the opaque subject payload behind a notification (issue, pull
    /// request, release...), used to enrich state beyond the list endpoint.
    #[tracing::instrument(level = "debug", skip(self), err)]
    pub async fn fetch_subject_raw(
        &self,
        url: &str,
    ) -> Result<serde_json::Value, OctotriageError> {
        let token = self.active_token().await?;
        let response = self
            .client(&token)?
            .get(url)
            .send()
            .await
            .map_err(|err| {
                OctotriageError::Recoverable(anyhow!("Cannot fetch subject from GitHub: {err}"))
            })?;
        let response = check_upstream_status(response)?;

        let body = response
            .text()
            .await
            .context("Failed to read subject response from GitHub")?;
        serde_json::from_str(&body).map_err(|err| OctotriageError::from_json_serde_error(err, body))
    }

    pub async fn fetch_timeline(
        &self,
        owner: &str,
        repo: &str,
        number: i64,
        per_page: usize,
        page: u32,
    ) -> Result<serde_json::Value, OctotriageError> {
        self.fetch_paginated(format!(
            "{}/repos/{owner}/{repo}/issues/{number}/timeline?per_page={per_page}&page={page}",
            self.github_base_url
        ))
        .await
    }

    pub async fn fetch_issue_comments(
        &self,
        owner: &str,
        repo: &str,
        number: i64,
        per_page: usize,
        page: u32,
    ) -> Result<serde_json::Value, OctotriageError> {
        self.fetch_paginated(format!(
            "{}/repos/{owner}/{repo}/issues/{number}/comments?per_page={per_page}&page={page}",
            self.github_base_url
        ))
        .await
    }

    pub async fn fetch_pull_request_reviews(
        &self,
        owner: &str,
        repo: &str,
        number: i64,
        per_page: usize,
        page: u32,
    ) -> Result<serde_json::Value, OctotriageError> {
        self.fetch_paginated(format!(
            "{}/repos/{owner}/{repo}/pulls/{number}/reviews?per_page={per_page}&page={page}",
            self.github_base_url
        ))
        .await
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    async fn fetch_paginated(&self, url: String) -> Result<serde_json::Value, OctotriageError> {
        let token = self.active_token().await?;
        let response = self
            .client(&token)?
            .get(&url)
            .send()
            .await
            .map_err(|err| {
                OctotriageError::Recoverable(anyhow!("Cannot fetch {url} from GitHub: {err}"))
            })?;
        let response = check_upstream_status(response)?;

        let body = response
            .text()
            .await
            .context("Failed to read activity response from GitHub")?;
        serde_json::from_str(&body).map_err(|err| OctotriageError::from_json_serde_error(err, body))
    }

    async fn active_token(&self) -> Result<Secret<String>, OctotriageError> {
        self.token
            .read()
            .await
            .clone()
            .ok_or_else(|| OctotriageError::Unauthorized(anyhow!("No GitHub token configured")))
    }

    fn client(&self, token: &Secret<String>) -> Result<ClientWithMiddleware, OctotriageError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "Accept",
            HeaderValue::from_static("application/vnd.github.v3+json"),
        );
        let mut auth_header_value: HeaderValue =
            format!("Bearer {}", token.expose_secret())
                .parse()
                .context("Failed to build GitHub authorization header")?;
        auth_header_value.set_sensitive(true);
        headers.insert("Authorization", auth_header_value);

        let reqwest_client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(APP_USER_AGENT)
            .build()
            .context("Failed to build GitHub client")?;
        Ok(ClientBuilder::new(reqwest_client)
            .with(TracingMiddleware::<SpanBackendWithUrl>::new())
            .build())
    }
}

/// Map upstream statuses onto the error taxonomy: auth failures are
/// permanent, rate limiting and server errors are transient and retried by
/// the queue.
fn check_upstream_status(response: Response) -> Result<Response, OctotriageError> {
    let status = response.status();
    match status {
        StatusCode::UNAUTHORIZED => Err(OctotriageError::Unauthorized(anyhow!(
            "GitHub rejected the configured token"
        ))),
        StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => {
            let wait = rate_limit_wait(response.headers());
            Err(OctotriageError::Recoverable(anyhow!(
                "GitHub rate limited the request (wait hint: {wait:?})"
            )))
        }
        status if status.is_server_error() => Err(OctotriageError::Recoverable(anyhow!(
            "GitHub answered {status}"
        ))),
        status if !status.is_success() => Err(OctotriageError::Unexpected(anyhow!(
            "GitHub answered {status}"
        ))),
        _ => Ok(response),
    }
}

/// Provider-specified wait before the next call, from `Retry-After` or the
/// primary rate-limit headers.
fn rate_limit_wait(headers: &HeaderMap) -> Option<Duration> {
    if let Some(retry_after) = header_as_u64(headers, "retry-after") {
        return Some(Duration::from_secs(retry_after));
    }
    let remaining = header_as_u64(headers, "x-ratelimit-remaining")?;
    if remaining > 0 {
        return None;
    }
    let reset = header_as_u64(headers, "x-ratelimit-reset")?;
    let now = Utc::now().timestamp().max(0) as u64;
    Some(Duration::from_secs(reset.saturating_sub(now).max(1)))
}

fn header_as_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)?
        .to_str()
        .ok()
        .and_then(|value| value.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::{
        matchers::{header_exists, method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    fn thread_json(id: &str, updated_at: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "unread": true,
            "reason": "subscribed",
            "updated_at": updated_at,
            "subject": {"title": "A title", "type": "Issue"},
            "repository": {
                "id": 1,
                "name": "widgets",
                "full_name": "acme/widgets",
                "private": false,
                "owner": {"login": "acme", "id": 10}
            }
        })
    }

    async fn service_with_token(mock_server: &MockServer) -> GithubService {
        Mock::given(method("GET"))
            .and(path("/user"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "login": "octocat", "id": 583231
            })))
            .mount(mock_server)
            .await;
        let service = GithubService::new(Some(mock_server.uri()), 2).unwrap();
        service
            .set_token(Secret::new("gho_test".to_string()))
            .await
            .unwrap();
        service
    }

    #[tokio::test]
    async fn test_set_token_rejects_invalid_token() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/user"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&mock_server)
            .await;

        let service = GithubService::new(Some(mock_server.uri()), 50).unwrap();
        let result = service.set_token(Secret::new("bad".to_string())).await;
        assert!(matches!(result, Err(OctotriageError::Unauthorized(_))));
        assert!(!service.has_token().await);
    }

    #[tokio::test]
    async fn test_list_notifications_paginates_until_short_page() {
        let mock_server = MockServer::start().await;
        let service = service_with_token(&mock_server).await;

        Mock::given(method("GET"))
            .and(path("/notifications"))
            .and(query_param("page", "1"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                thread_json("1", "2024-02-01T10:00:00Z"),
                thread_json("2", "2024-02-01T11:00:00Z"),
            ])))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/notifications"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                thread_json("3", "2024-02-01T09:00:00Z"),
            ])))
            .mount(&mock_server)
            .await;

        let threads = service.list_notifications(None).await.unwrap();
        assert_eq!(
            threads.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
            vec!["1", "2", "3"]
        );
    }

    #[tokio::test]
    async fn test_list_notifications_passes_since_checkpoint() {
        let mock_server = MockServer::start().await;
        let service = service_with_token(&mock_server).await;

        Mock::given(method("GET"))
            .and(path("/notifications"))
            .and(query_param("since", "2024-02-01T00:00:00Z"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .expect(1)
            .mount(&mock_server)
            .await;

        let since = "2024-02-01T00:00:00Z".parse().unwrap();
        let threads = service.list_notifications(Some(since)).await.unwrap();
        assert!(threads.is_empty());
    }

    #[tokio::test]
    async fn test_rate_limited_request_is_recoverable() {
        let mock_server = MockServer::start().await;
        let service = service_with_token(&mock_server).await;

        Mock::given(method("GET"))
            .and(path("/notifications"))
            .respond_with(
                ResponseTemplate::new(429).insert_header("retry-after", "30"),
            )
            .mount(&mock_server)
            .await;

        let result = service.list_notifications(None).await;
        assert!(matches!(result, Err(OctotriageError::Recoverable(_))));
    }

    #[test]
    fn test_rate_limit_wait_prefers_retry_after() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("42"));
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        assert_eq!(rate_limit_wait(&headers), Some(Duration::from_secs(42)));
    }

    #[test]
    fn test_rate_limit_wait_ignores_remaining_budget() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("12"));
        headers.insert("x-ratelimit-reset", HeaderValue::from_static("2000000000"));
        assert_eq!(rate_limit_wait(&headers), None);
    }
}
