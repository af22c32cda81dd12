use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::comments::RemoteComment;
use crate::error::{Error, Result};
use crate::pr::{CiStatus, PrKey, PrMetadata, Review, ReviewEvent, WorkflowRun};

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 500;
const PER_PAGE: usize = 100;

/// A top-level comment sent as part of a review.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DraftComment {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<i64>,
    pub body: String,
}

/// The code-hosting service that owns pull requests.
pub trait CodeHost: Send + Sync {
    fn fetch_metadata(&self, key: &PrKey) -> Result<PrMetadata>;
    fn fetch_diff(&self, key: &PrKey) -> Result<String>;
    fn fetch_comments(&self, key: &PrKey) -> Result<Vec<RemoteComment>>;
    fn fetch_reviews(&self, key: &PrKey) -> Result<Vec<Review>>;
    /// Latest CI run per workflow for a commit of the PR.
    fn fetch_ci_status(&self, key: &PrKey, sha: &str) -> Result<CiStatus>;
    fn submit_review(
        &self,
        key: &PrKey,
        event: ReviewEvent,
        body: &str,
        comments: &[DraftComment],
    ) -> Result<()>;
    fn submit_reply(&self, key: &PrKey, body: &str, reply_to: i64) -> Result<()>;

    fn latest_sha(&self, key: &PrKey) -> Result<String> {
        Ok(self.fetch_metadata(key)?.head_sha)
    }
}

// ---------------------------------------------------------------------------
// HTTP transport (for testability)
// ---------------------------------------------------------------------------

pub trait GitHubApi: Send + Sync {
    fn get(&self, path: &str, accept: &str) -> Result<String>;
    fn post(&self, path: &str, body: &serde_json::Value) -> Result<String>;
}

struct DefaultGitHubApi {
    api_url: String,
    token: Option<String>,
}

impl DefaultGitHubApi {
    fn request(&self, method: &str, path: &str, accept: &str) -> ureq::Request {
        let url = format!("{}{}", self.api_url.trim_end_matches('/'), path);
        let mut req = ureq::request(method, &url)
            .set("Accept", accept)
            .set("User-Agent", "crs")
            .set("X-GitHub-Api-Version", "2022-11-28");
        if let Some(token) = &self.token {
            req = req.set("Authorization", &format!("Bearer {token}"));
        }
        req
    }
}

impl GitHubApi for DefaultGitHubApi {
    fn get(&self, path: &str, accept: &str) -> Result<String> {
        let mut backoff_ms = INITIAL_BACKOFF_MS;
        for attempt in 1..=MAX_RETRIES {
            match self.request("GET", path, accept).call() {
                Ok(response) => {
                    return response.into_string().map_err(|e| {
                        Error::Upstream(format!("failed to read response for {path}: {e}"))
                    });
                }
                Err(ref e) if attempt < MAX_RETRIES && is_retryable(e) => {
                    warn!(
                        attempt,
                        error = %e,
                        backoff_ms,
                        path,
                        "retrying GitHub API after transient error"
                    );
                    thread::sleep(Duration::from_millis(backoff_ms));
                    backoff_ms *= 2;
                }
                Err(e) => return Err(describe_failure(path, e)),
            }
        }
        unreachable!()
    }

    fn post(&self, path: &str, body: &serde_json::Value) -> Result<String> {
        match self
            .request("POST", path, "application/vnd.github+json")
            .send_json(body)
        {
            Ok(response) => response
                .into_string()
                .map_err(|e| Error::Upstream(format!("failed to read response for {path}: {e}"))),
            Err(e) => Err(describe_failure(path, e)),
        }
    }
}

/// Only retry rate-limits (429), server errors (5xx), and transport/network errors.
fn is_retryable(err: &ureq::Error) -> bool {
    match err {
        ureq::Error::Status(code, _) => *code == 429 || *code >= 500,
        ureq::Error::Transport(_) => true,
    }
}

fn describe_failure(path: &str, err: ureq::Error) -> Error {
    match err {
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            Error::Upstream(format!("GitHub API {path} returned {code}: {body}"))
        }
        ureq::Error::Transport(t) => Error::Upstream(format!("GitHub API {path} failed: {t}")),
    }
}

// ---------------------------------------------------------------------------
// REST response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GhUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct GhRef {
    #[serde(rename = "ref")]
    name: String,
    #[serde(default)]
    sha: String,
}

#[derive(Debug, Deserialize)]
struct GhLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GhMilestone {
    title: String,
}

#[derive(Debug, Deserialize)]
struct GhPull {
    number: u64,
    title: String,
    user: GhUser,
    base: GhRef,
    head: GhRef,
    state: String,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    labels: Vec<GhLabel>,
    #[serde(default)]
    assignees: Vec<GhUser>,
    #[serde(default)]
    requested_reviewers: Vec<GhUser>,
    #[serde(default)]
    milestone: Option<GhMilestone>,
    body: Option<String>,
    #[serde(default)]
    html_url: String,
}

impl From<GhPull> for PrMetadata {
    fn from(pr: GhPull) -> Self {
        PrMetadata {
            number: pr.number,
            title: pr.title,
            author: pr.user.login,
            base_ref: pr.base.name,
            head_ref: pr.head.name,
            head_sha: pr.head.sha,
            state: pr.state,
            draft: pr.draft,
            labels: pr.labels.into_iter().map(|l| l.name).collect(),
            assignees: pr.assignees.into_iter().map(|u| u.login).collect(),
            reviewers: pr.requested_reviewers.into_iter().map(|u| u.login).collect(),
            milestone: pr.milestone.map(|m| m.title).unwrap_or_default(),
            ci_status: String::new(),
            ci_failures: Vec::new(),
            description: pr.body.unwrap_or_default(),
            url: pr.html_url,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GhComment {
    id: i64,
    user: Option<GhUser>,
    #[serde(default)]
    body: String,
    path: String,
    position: Option<i64>,
    original_position: Option<i64>,
    in_reply_to_id: Option<i64>,
    #[serde(default)]
    created_at: String,
}

impl From<GhComment> for RemoteComment {
    fn from(c: GhComment) -> Self {
        // GitHub nulls `position` once the commented line leaves the diff.
        let outdated = c.position.is_none() && c.original_position.is_some();
        RemoteComment {
            id: c.id,
            author: c.user.map(|u| u.login).unwrap_or_default(),
            body: c.body,
            path: c.path,
            position: c.position,
            original_position: c.original_position,
            in_reply_to: c.in_reply_to_id,
            created_at: c.created_at,
            outdated,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GhReview {
    id: i64,
    user: Option<GhUser>,
    state: String,
    #[serde(default)]
    body: Option<String>,
    submitted_at: Option<String>,
}

impl From<GhReview> for Review {
    fn from(r: GhReview) -> Self {
        Review {
            id: r.id,
            author: r.user.map(|u| u.login).unwrap_or_default(),
            state: r.state,
            body: r.body.unwrap_or_default(),
            submitted_at: r.submitted_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GhWorkflowRuns {
    #[serde(default)]
    workflow_runs: Vec<GhWorkflowRun>,
}

#[derive(Debug, Deserialize)]
struct GhWorkflowRun {
    #[serde(default)]
    name: Option<String>,
    status: Option<String>,
    conclusion: Option<String>,
    #[serde(default)]
    created_at: String,
}

impl From<GhWorkflowRun> for WorkflowRun {
    fn from(r: GhWorkflowRun) -> Self {
        WorkflowRun {
            name: r.name.unwrap_or_default(),
            status: r.status.unwrap_or_default(),
            conclusion: r.conclusion,
            created_at: r.created_at,
        }
    }
}

// ---------------------------------------------------------------------------
// GitHub host
// ---------------------------------------------------------------------------

pub struct GitHubHost {
    api: Box<dyn GitHubApi>,
}

impl GitHubHost {
    /// `token` is read from the environment variable named `token_env`. A
    /// missing token leaves requests unauthenticated.
    pub fn new(api_url: &str, token_env: &str) -> Self {
        let token = std::env::var(token_env).ok().filter(|t| !t.is_empty());
        if token.is_none() {
            warn!(token_env, "GitHub token not set, using unauthenticated requests");
        }
        Self {
            api: Box::new(DefaultGitHubApi {
                api_url: api_url.to_string(),
                token,
            }),
        }
    }

    pub fn with_api(api: Box<dyn GitHubApi>) -> Self {
        Self { api }
    }

    fn pulls_path(key: &PrKey) -> String {
        format!("/repos/{}/{}/pulls/{}", key.owner, key.repo, key.number)
    }

    fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T> {
        let body = self.api.get(path, "application/vnd.github+json")?;
        serde_json::from_str(&body)
            .map_err(|e| Error::Upstream(format!("failed to parse response for {path}: {e}")))
    }

    fn get_paged<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<Vec<T>> {
        let mut all = Vec::new();
        for page in 1.. {
            let items: Vec<T> = self.get_json(&format!("{path}?per_page={PER_PAGE}&page={page}"))?;
            let done = items.len() < PER_PAGE;
            all.extend(items);
            if done {
                break;
            }
        }
        Ok(all)
    }
}

impl CodeHost for GitHubHost {
    fn fetch_metadata(&self, key: &PrKey) -> Result<PrMetadata> {
        let pr: GhPull = self.get_json(&Self::pulls_path(key))?;
        Ok(pr.into())
    }

    fn fetch_diff(&self, key: &PrKey) -> Result<String> {
        self.api
            .get(&Self::pulls_path(key), "application/vnd.github.v3.diff")
    }

    fn fetch_comments(&self, key: &PrKey) -> Result<Vec<RemoteComment>> {
        let comments: Vec<GhComment> =
            self.get_paged(&format!("{}/comments", Self::pulls_path(key)))?;
        debug!(pr = %key, count = comments.len(), "fetched review comments");
        Ok(comments.into_iter().map(RemoteComment::from).collect())
    }

    fn fetch_reviews(&self, key: &PrKey) -> Result<Vec<Review>> {
        let reviews: Vec<GhReview> =
            self.get_paged(&format!("{}/reviews", Self::pulls_path(key)))?;
        Ok(reviews.into_iter().map(Review::from).collect())
    }

    fn fetch_ci_status(&self, key: &PrKey, sha: &str) -> Result<CiStatus> {
        let path = format!(
            "/repos/{}/{}/actions/runs?head_sha={sha}&per_page={PER_PAGE}",
            key.owner, key.repo
        );
        let runs: GhWorkflowRuns = self.get_json(&path)?;
        debug!(pr = %key, sha, count = runs.workflow_runs.len(), "fetched workflow runs");
        Ok(CiStatus::from_runs(
            runs.workflow_runs.into_iter().map(WorkflowRun::from).collect(),
        ))
    }

    fn submit_review(
        &self,
        key: &PrKey,
        event: ReviewEvent,
        body: &str,
        comments: &[DraftComment],
    ) -> Result<()> {
        let payload = serde_json::json!({
            "event": event.as_str(),
            "body": body,
            "comments": comments,
        });
        self.api
            .post(&format!("{}/reviews", Self::pulls_path(key)), &payload)?;
        Ok(())
    }

    fn submit_reply(&self, key: &PrKey, body: &str, reply_to: i64) -> Result<()> {
        let payload = serde_json::json!({
            "body": body,
            "in_reply_to": reply_to,
        });
        self.api
            .post(&format!("{}/comments", Self::pulls_path(key)), &payload)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct MockApi {
        responses: Mutex<Vec<Result<String>>>,
        requests: Mutex<Vec<(String, Option<serde_json::Value>)>>,
    }

    impl MockApi {
        fn new(responses: Vec<Result<String>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn next(&self) -> Result<String> {
            self.responses.lock().unwrap().remove(0)
        }
    }

    impl GitHubApi for std::sync::Arc<MockApi> {
        fn get(&self, path: &str, accept: &str) -> Result<String> {
            self.requests
                .lock()
                .unwrap()
                .push((format!("GET {path} {accept}"), None));
            self.next()
        }

        fn post(&self, path: &str, body: &serde_json::Value) -> Result<String> {
            self.requests
                .lock()
                .unwrap()
                .push((format!("POST {path}"), Some(body.clone())));
            self.next()
        }
    }

    fn host(responses: Vec<Result<String>>) -> (GitHubHost, std::sync::Arc<MockApi>) {
        let api = std::sync::Arc::new(MockApi::new(responses));
        (GitHubHost::with_api(Box::new(api.clone())), api)
    }

    fn key() -> PrKey {
        PrKey::new("octo", "widgets", 7)
    }

    #[test]
    fn test_fetch_metadata_maps_fields() {
        let json = r#"{
            "number": 7, "title": "Add widgets", "user": {"login": "alice"},
            "base": {"ref": "main", "sha": "aaa"}, "head": {"ref": "feat", "sha": "bbb"},
            "state": "open", "draft": false,
            "labels": [{"name": "feature"}], "assignees": [{"login": "bob"}],
            "requested_reviewers": [{"login": "carol"}],
            "milestone": {"title": "v1.2"},
            "body": null, "html_url": "https://github.com/octo/widgets/pull/7"
        }"#;
        let (host, api) = host(vec![Ok(json.to_string())]);
        let meta = host.fetch_metadata(&key()).unwrap();
        assert_eq!(meta.head_sha, "bbb");
        assert_eq!(meta.author, "alice");
        assert_eq!(meta.labels, vec!["feature"]);
        assert_eq!(meta.reviewers, vec!["carol"]);
        assert_eq!(meta.milestone, "v1.2");
        assert_eq!(meta.description, "");
        assert_eq!(meta.ci_status, "");
        assert_eq!(
            api.requests.lock().unwrap()[0].0,
            "GET /repos/octo/widgets/pulls/7 application/vnd.github+json"
        );
    }

    #[test]
    fn test_latest_sha_uses_metadata() {
        let json = r#"{"number": 7, "title": "t", "user": {"login": "a"},
            "base": {"ref": "main"}, "head": {"ref": "f", "sha": "cafe"},
            "state": "open", "body": "x"}"#;
        let (host, _) = host(vec![Ok(json.to_string())]);
        assert_eq!(host.latest_sha(&key()).unwrap(), "cafe");
    }

    #[test]
    fn test_fetch_ci_status_keeps_latest_run_per_workflow() {
        let json = r#"{"total_count": 3, "workflow_runs": [
            {"name": "ci", "status": "completed", "conclusion": "failure",
             "created_at": "2024-01-01T10:00:00Z"},
            {"name": "ci", "status": "completed", "conclusion": "success",
             "created_at": "2024-01-01T12:00:00Z"},
            {"name": "docs", "status": "in_progress", "conclusion": null,
             "created_at": "2024-01-01T11:00:00Z"}
        ]}"#;
        let (host, api) = host(vec![Ok(json.to_string())]);
        let ci = host.fetch_ci_status(&key(), "bbb").unwrap();
        assert_eq!(ci.runs.len(), 2);
        assert_eq!(ci.overall(), "pending");
        assert!(ci.failures().is_empty());
        assert_eq!(
            api.requests.lock().unwrap()[0].0,
            "GET /repos/octo/widgets/actions/runs?head_sha=bbb&per_page=100 application/vnd.github+json"
        );
    }

    #[test]
    fn test_fetch_diff_requests_diff_media_type() {
        let (host, api) = host(vec![Ok("diff --git a/x b/x\n".to_string())]);
        let diff = host.fetch_diff(&key()).unwrap();
        assert!(diff.starts_with("diff --git"));
        assert!(api.requests.lock().unwrap()[0].0.ends_with("application/vnd.github.v3.diff"));
    }

    #[test]
    fn test_fetch_comments_sets_outdated() {
        let json = r#"[
            {"id": 1, "user": {"login": "alice"}, "body": "b", "path": "a.rs",
             "position": 3, "original_position": 3, "in_reply_to_id": null,
             "created_at": "2024-01-01T00:00:00Z"},
            {"id": 2, "user": {"login": "bob"}, "body": "c", "path": "a.rs",
             "position": null, "original_position": 9, "in_reply_to_id": 1,
             "created_at": "2024-01-02T00:00:00Z"}
        ]"#;
        let (host, api) = host(vec![Ok(json.to_string())]);
        let comments = host.fetch_comments(&key()).unwrap();
        assert_eq!(comments.len(), 2);
        assert!(!comments[0].outdated);
        assert!(comments[1].outdated);
        assert_eq!(comments[1].in_reply_to, Some(1));
        assert!(api.requests.lock().unwrap()[0].0.contains("per_page=100&page=1"));
    }

    #[test]
    fn test_fetch_comments_follows_pages() {
        let one = r#"{"id": 1, "user": {"login": "a"}, "body": "", "path": "a.rs",
            "position": 1, "original_position": 1, "in_reply_to_id": null}"#;
        let full_page = format!("[{}]", vec![one; PER_PAGE].join(","));
        let (host, api) = host(vec![Ok(full_page), Ok("[]".to_string())]);
        let comments = host.fetch_comments(&key()).unwrap();
        assert_eq!(comments.len(), PER_PAGE);
        assert_eq!(api.requests.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_submit_review_payload() {
        let (host, api) = host(vec![Ok("{}".to_string())]);
        let drafts = vec![DraftComment {
            path: "a.rs".to_string(),
            position: Some(2),
            body: "nit".to_string(),
        }];
        host.submit_review(&key(), ReviewEvent::RequestChanges, "please fix", &drafts)
            .unwrap();
        let requests = api.requests.lock().unwrap();
        let (line, body) = &requests[0];
        assert_eq!(line, "POST /repos/octo/widgets/pulls/7/reviews");
        let body = body.as_ref().unwrap();
        assert_eq!(body["event"], "REQUEST_CHANGES");
        assert_eq!(body["comments"][0]["position"], 2);
    }

    #[test]
    fn test_submit_reply_payload() {
        let (host, api) = host(vec![Ok("{}".to_string())]);
        host.submit_reply(&key(), "thanks", 42).unwrap();
        let requests = api.requests.lock().unwrap();
        assert_eq!(requests[0].0, "POST /repos/octo/widgets/pulls/7/comments");
        assert_eq!(requests[0].1.as_ref().unwrap()["in_reply_to"], 42);
    }

    #[test]
    fn test_upstream_error_propagates() {
        let (host, _) = host(vec![Err(Error::Upstream("boom".to_string()))]);
        let err = host.fetch_diff(&key()).unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_file_level_draft_omits_position() {
        let draft = DraftComment {
            path: "a.rs".to_string(),
            position: None,
            body: "x".to_string(),
        };
        let json = serde_json::to_value(&draft).unwrap();
        assert!(json.get("position").is_none());
    }
}
