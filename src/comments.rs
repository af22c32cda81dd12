use serde::{Deserialize, Serialize};

/// A submitted review comment as cached from the code host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteComment {
    pub id: i64,
    pub author: String,
    pub body: String,
    pub path: String,
    pub position: Option<i64>,
    #[serde(default)]
    pub original_position: Option<i64>,
    #[serde(default)]
    pub in_reply_to: Option<i64>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub outdated: bool,
}

/// A pending comment that has not been submitted yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalComment {
    pub id: i64,
    pub owner: String,
    pub repo: String,
    pub number: u64,
    pub filename: String,
    pub position: Option<i64>,
    pub body: String,
    pub reply_to: Option<i64>,
    pub created_at: String,
}

/// Comment identity, tagged by where the comment lives. Local and remote ids
/// come from different sequences and may collide numerically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommentId {
    Remote(i64),
    Local(i64),
}

impl std::fmt::Display for CommentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommentId::Remote(id) => write!(f, "{id}"),
            CommentId::Local(id) => write!(f, "local-{id}"),
        }
    }
}

/// Unified view over remote and local comments used for threading and
/// rendering.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Comment {
    pub id: CommentId,
    pub author: String,
    pub body: String,
    pub path: String,
    pub position: Option<i64>,
    pub reply_to: Option<CommentId>,
    pub created_at: String,
    pub outdated: bool,
}

impl Comment {
    pub fn is_pending(&self) -> bool {
        matches!(self.id, CommentId::Local(_))
    }
}

impl From<RemoteComment> for Comment {
    fn from(c: RemoteComment) -> Self {
        Self {
            id: CommentId::Remote(c.id),
            author: c.author,
            body: c.body,
            path: c.path,
            position: c.position,
            reply_to: c.in_reply_to.filter(|id| *id != 0).map(CommentId::Remote),
            created_at: c.created_at,
            outdated: c.outdated,
        }
    }
}

impl Comment {
    /// Local comments have no author on the host yet; `author` is the
    /// configured username.
    pub fn from_local(c: LocalComment, author: &str) -> Self {
        Self {
            id: CommentId::Local(c.id),
            author: author.to_string(),
            body: c.body,
            path: c.filename,
            position: c.position,
            reply_to: c.reply_to.filter(|id| *id != 0).map(CommentId::Remote),
            created_at: c.created_at,
            outdated: false,
        }
    }
}

/// Merge remote and local comments, remote first, then local in creation
/// order.
pub fn merge(remote: Vec<RemoteComment>, local: Vec<LocalComment>, author: &str) -> Vec<Comment> {
    remote
        .into_iter()
        .map(Comment::from)
        .chain(local.into_iter().map(|c| Comment::from_local(c, author)))
        .collect()
}
