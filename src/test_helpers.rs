use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::comments::RemoteComment;
use crate::error::{Error, Result};
use crate::pr::{CiStatus, PrKey, PrMetadata, Review, ReviewEvent, WorkflowRun};
use crate::upstream::{CodeHost, DraftComment};

/// A two-file diff: `src/lib.rs` with one hunk and a new `README.md`.
pub fn sample_diff() -> String {
    "diff --git a/src/lib.rs b/src/lib.rs
index 1111111..2222222 100644
--- a/src/lib.rs
+++ b/src/lib.rs
@@ -1,3 +1,4 @@
 pub fn a() {}
+pub fn b() {}
 pub fn c() {}
 pub fn d() {}
diff --git a/README.md b/README.md
new file mode 100644
index 0000000..3333333
--- /dev/null
+++ b/README.md
@@ -0,0 +1 @@
+# widgets
"
    .to_string()
}

pub fn sample_metadata(sha: &str) -> PrMetadata {
    PrMetadata {
        number: 7,
        title: "Add widgets".to_string(),
        author: "alice".to_string(),
        base_ref: "main".to_string(),
        head_ref: "widgets".to_string(),
        head_sha: sha.to_string(),
        state: "open".to_string(),
        ..Default::default()
    }
}

/// One workflow run created at a fixed time.
pub fn workflow_run(name: &str, status: &str, conclusion: Option<&str>) -> WorkflowRun {
    WorkflowRun {
        name: name.to_string(),
        status: status.to_string(),
        conclusion: conclusion.map(str::to_string),
        created_at: "2024-01-02T03:04:05Z".to_string(),
    }
}

/// A remote comment on `src/lib.rs`.
pub fn remote_comment(id: i64, author: &str, position: Option<i64>, reply_to: Option<i64>) -> RemoteComment {
    RemoteComment {
        id,
        author: author.to_string(),
        body: format!("comment {id}"),
        path: "src/lib.rs".to_string(),
        position,
        original_position: position,
        in_reply_to: reply_to,
        created_at: "2024-01-02T03:04:05Z".to_string(),
        outdated: false,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    Reply {
        body: String,
        reply_to: i64,
    },
    Review {
        event: ReviewEvent,
        body: String,
        comments: Vec<DraftComment>,
    },
}

struct FakeState {
    diff: String,
    metadata: PrMetadata,
    comments: Vec<RemoteComment>,
    reviews: Vec<Review>,
    ci_runs: Vec<WorkflowRun>,
    calls: HashMap<&'static str, usize>,
    submissions: Vec<Submission>,
    fail_fetches: bool,
    fail_review: bool,
    fail_reply: bool,
    fail_ci: bool,
}

/// In-memory code host that counts calls and records submissions.
pub struct FakeHost {
    state: Mutex<FakeState>,
}

impl FakeHost {
    pub fn new(diff: String, metadata: PrMetadata) -> Self {
        Self {
            state: Mutex::new(FakeState {
                diff,
                metadata,
                comments: Vec::new(),
                reviews: Vec::new(),
                ci_runs: Vec::new(),
                calls: HashMap::new(),
                submissions: Vec::new(),
                fail_fetches: false,
                fail_review: false,
                fail_reply: false,
                fail_ci: false,
            }),
        }
    }

    pub fn with_comments(self, comments: Vec<RemoteComment>) -> Self {
        self.lock().comments = comments;
        self
    }

    pub fn set_metadata(&self, metadata: PrMetadata) {
        self.lock().metadata = metadata;
    }

    pub fn set_diff(&self, diff: String) {
        self.lock().diff = diff;
    }

    pub fn set_comments(&self, comments: Vec<RemoteComment>) {
        self.lock().comments = comments;
    }

    pub fn set_ci_runs(&self, runs: Vec<WorkflowRun>) {
        self.lock().ci_runs = runs;
    }

    /// CI lookups fail on their own, other fetches keep working.
    pub fn fail_ci(&self, fail: bool) {
        self.lock().fail_ci = fail;
    }

    pub fn fail_fetches(&self, fail: bool) {
        self.lock().fail_fetches = fail;
    }

    pub fn fail_review(&self, fail: bool) {
        self.lock().fail_review = fail;
    }

    pub fn fail_reply(&self, fail: bool) {
        self.lock().fail_reply = fail;
    }

    pub fn calls(&self, method: &str) -> usize {
        self.lock()
            .calls
            .get(method)
            .copied()
            .unwrap_or(0)
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.lock().submissions.clone()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, method: &'static str) -> MutexGuard<'_, FakeState> {
        let mut state = self.lock();
        *state.calls.entry(method).or_default() += 1;
        state
    }

    fn fetch<T>(&self, method: &'static str, f: impl FnOnce(&FakeState) -> T) -> Result<T> {
        let state = self.record(method);
        if state.fail_fetches {
            return Err(Error::Upstream(format!("{method} unavailable")));
        }
        Ok(f(&state))
    }
}

impl CodeHost for FakeHost {
    fn fetch_metadata(&self, _key: &PrKey) -> Result<PrMetadata> {
        self.fetch("fetch_metadata", |s| s.metadata.clone())
    }

    fn fetch_diff(&self, _key: &PrKey) -> Result<String> {
        self.fetch("fetch_diff", |s| s.diff.clone())
    }

    fn fetch_comments(&self, _key: &PrKey) -> Result<Vec<RemoteComment>> {
        self.fetch("fetch_comments", |s| s.comments.clone())
    }

    fn fetch_reviews(&self, _key: &PrKey) -> Result<Vec<Review>> {
        self.fetch("fetch_reviews", |s| s.reviews.clone())
    }

    fn fetch_ci_status(&self, _key: &PrKey, _sha: &str) -> Result<CiStatus> {
        if self.lock().fail_ci {
            self.record("fetch_ci_status");
            return Err(Error::Upstream("workflow runs unavailable".to_string()));
        }
        self.fetch("fetch_ci_status", |s| CiStatus::from_runs(s.ci_runs.clone()))
    }

    fn submit_review(
        &self,
        _key: &PrKey,
        event: ReviewEvent,
        body: &str,
        comments: &[DraftComment],
    ) -> Result<()> {
        let mut state = self.record("submit_review");
        if state.fail_review {
            return Err(Error::Upstream("review rejected".to_string()));
        }
        state.submissions.push(Submission::Review {
            event,
            body: body.to_string(),
            comments: comments.to_vec(),
        });
        Ok(())
    }

    fn submit_reply(&self, _key: &PrKey, body: &str, reply_to: i64) -> Result<()> {
        let mut state = self.record("submit_reply");
        if state.fail_reply {
            return Err(Error::Upstream("reply rejected".to_string()));
        }
        state.submissions.push(Submission::Reply {
            body: body.to_string(),
            reply_to,
        });
        Ok(())
    }
}
