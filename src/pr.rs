use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies a pull request on the code host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrKey {
    pub owner: String,
    pub repo: String,
    pub number: u64,
}

impl PrKey {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>, number: u64) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
            number,
        }
    }

    /// Identifier used by the tracked-item store, e.g. `octo/widgets-42`.
    pub fn tracked_id(&self) -> String {
        format!("{}/{}-{}", self.owner, self.repo, self.number)
    }
}

impl fmt::Display for PrKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.owner, self.repo, self.number)
    }
}

/// Pull request header information shown above the diff and handed to
/// plugins via `--headers`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrMetadata {
    pub number: u64,
    pub title: String,
    pub author: String,
    pub base_ref: String,
    pub head_ref: String,
    pub head_sha: String,
    pub state: String,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub assignees: Vec<String>,
    #[serde(default)]
    pub reviewers: Vec<String>,
    #[serde(default)]
    pub milestone: String,
    /// `success`, `pending` or `failure`; empty when no CI ran.
    #[serde(default)]
    pub ci_status: String,
    /// Names of the workflows whose latest run failed.
    #[serde(default)]
    pub ci_failures: Vec<String>,
    #[serde(default, alias = "body")]
    pub description: String,
    #[serde(default)]
    pub url: String,
}

impl PrMetadata {
    pub fn apply_ci(&mut self, ci: &CiStatus) {
        self.ci_status = ci.overall().to_string();
        self.ci_failures = ci.failures();
    }
}

/// Latest run of one CI workflow for a commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub name: String,
    /// `queued`, `in_progress` or `completed`.
    pub status: String,
    #[serde(default)]
    pub conclusion: Option<String>,
    #[serde(default)]
    pub created_at: String,
}

impl WorkflowRun {
    fn is_running(&self) -> bool {
        self.conclusion.is_none() && self.status != "completed"
    }

    fn is_failure(&self) -> bool {
        self.conclusion.as_deref() == Some("failure")
    }
}

/// CI state of one commit, one run per workflow name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CiStatus {
    pub runs: Vec<WorkflowRun>,
}

impl CiStatus {
    /// Keep the newest run of each workflow, ordered by name.
    pub fn from_runs(runs: Vec<WorkflowRun>) -> Self {
        let mut latest: BTreeMap<String, WorkflowRun> = BTreeMap::new();
        for run in runs {
            match latest.get(&run.name) {
                Some(seen) if seen.created_at >= run.created_at => {}
                _ => {
                    latest.insert(run.name.clone(), run);
                }
            }
        }
        Self {
            runs: latest.into_values().collect(),
        }
    }

    /// Any failed workflow makes the commit `failure`; otherwise any
    /// unfinished one makes it `pending`. Cancelled or skipped runs count as
    /// done.
    pub fn overall(&self) -> &'static str {
        if self.runs.is_empty() {
            ""
        } else if self.runs.iter().any(WorkflowRun::is_failure) {
            "failure"
        } else if self.runs.iter().any(WorkflowRun::is_running) {
            "pending"
        } else {
            "success"
        }
    }

    pub fn failures(&self) -> Vec<String> {
        self.runs
            .iter()
            .filter(|r| r.is_failure())
            .map(|r| r.name.clone())
            .collect()
    }

    /// Pending results are not worth keeping; the runs will change.
    pub fn is_settled(&self) -> bool {
        self.overall() != "pending"
    }
}

/// A submitted review (approval, change request, or comment-only).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub id: i64,
    pub author: String,
    pub state: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub submitted_at: Option<String>,
}

/// Verdict attached to a submitted review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewEvent {
    Approve,
    RequestChanges,
    Comment,
}

impl ReviewEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewEvent::Approve => "APPROVE",
            ReviewEvent::RequestChanges => "REQUEST_CHANGES",
            ReviewEvent::Comment => "COMMENT",
        }
    }
}

impl std::str::FromStr for ReviewEvent {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "APPROVE" => Ok(ReviewEvent::Approve),
            "REQUEST_CHANGES" => Ok(ReviewEvent::RequestChanges),
            "COMMENT" => Ok(ReviewEvent::Comment),
            other => Err(crate::error::Error::InvalidRequest(format!(
                "unknown review event: {other} (expected: APPROVE, REQUEST_CHANGES, COMMENT)"
            ))),
        }
    }
}
