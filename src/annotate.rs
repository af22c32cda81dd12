//! Interleaves comment threads with diff lines and renders the result.

use std::collections::{HashMap, HashSet};

use regex::Regex;
use serde::Serialize;

use crate::comments::Comment;
use crate::diff::{DiffLine, LineKind, ParsedDiff};
use crate::pr::PrMetadata;
use crate::threads::{build_trees, tree_authors};

const REVIEW_BANNER: &str = "    ┌─ REVIEW COMMENT ─────────────────";
const PENDING_BANNER: &str = "    ┌─ PENDING COMMENT ────────────────";
const FOOTER: &str = "    └──────────────────────────────────";

#[derive(Debug, Clone, Serialize)]
pub struct AnnotatedLine {
    #[serde(flatten)]
    pub line: DiffLine,
    pub threads: Vec<Vec<Comment>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Annotation {
    /// Comments left after author exclusion, in input order.
    pub comments: Vec<Comment>,
    pub lines: Vec<AnnotatedLine>,
    /// Threads whose root no longer maps to a line of the current diff.
    pub outdated: Vec<Vec<Comment>>,
    /// Threads addressed to a path or position that does not exist in the
    /// diff.
    pub unplaced: Vec<Vec<Comment>>,
    pub text: String,
}

pub struct Annotator {
    excluded_authors: Vec<Regex>,
}

impl Annotator {
    pub fn new(excluded_authors: Vec<Regex>) -> Self {
        Self { excluded_authors }
    }

    fn is_excluded(&self, author: &str) -> bool {
        self.excluded_authors.iter().any(|re| re.is_match(author))
    }

    pub fn annotate(
        &self,
        diff: &ParsedDiff,
        comments: Vec<Comment>,
        metadata: Option<&PrMetadata>,
    ) -> Annotation {
        let comments: Vec<Comment> = comments
            .into_iter()
            .filter(|c| !self.is_excluded(&c.author))
            .collect();
        let trees = build_trees(&comments);

        let mut outdated = Vec::new();
        let mut by_key: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, tree) in trees.iter().enumerate() {
            let root = &tree[0];
            if root.outdated {
                outdated.push(idx);
            } else {
                by_key.entry(comment_key(root)).or_default().push(idx);
            }
        }

        let mut placed: HashSet<usize> = HashSet::new();
        let mut lines = Vec::new();
        for line in diff.lines() {
            let mut threads = Vec::new();
            if let Some(key) = line_key(&line)
                && let Some(indices) = by_key.get(&key)
            {
                for idx in indices {
                    placed.insert(*idx);
                    threads.push(trees[*idx].clone());
                }
            }
            lines.push(AnnotatedLine { line, threads });
        }

        let outdated: Vec<Vec<Comment>> = outdated.into_iter().map(|i| trees[i].clone()).collect();
        let unplaced: Vec<Vec<Comment>> = trees
            .iter()
            .enumerate()
            .filter(|(idx, tree)| !tree[0].outdated && !placed.contains(idx))
            .map(|(_, tree)| tree.clone())
            .collect();

        let text = render_text(metadata, &lines, &outdated, &unplaced);
        Annotation {
            comments,
            lines,
            outdated,
            unplaced,
            text,
        }
    }
}

/// `path:position` for line comments, `path:` for file-level ones.
pub fn comment_key(root: &Comment) -> String {
    match root.position {
        Some(p) if p > 0 => format!("{}:{p}", root.path),
        _ => format!("{}:", root.path),
    }
}

fn line_key(line: &DiffLine) -> Option<String> {
    match (line.kind, line.position) {
        (LineKind::FileHeader, _) => Some(format!("{}:", line.path)),
        (_, Some(p)) => Some(format!("{}:{p}", line.path)),
        (_, None) => None,
    }
}

fn render_text(
    metadata: Option<&PrMetadata>,
    lines: &[AnnotatedLine],
    outdated: &[Vec<Comment>],
    unplaced: &[Vec<Comment>],
) -> String {
    let mut out = String::new();
    if let Some(meta) = metadata {
        out.push_str(&render_metadata(meta));
    }
    for annotated in lines {
        out.push_str(&annotated.line.text);
        out.push('\n');
        for tree in &annotated.threads {
            out.push_str(&render_tree(tree));
        }
    }
    if !outdated.is_empty() {
        out.push_str("\nOutdated comments:\n");
        for tree in outdated {
            out.push_str(&render_tree(tree));
        }
    }
    if !unplaced.is_empty() {
        out.push_str("\nComments outside the diff:\n");
        for tree in unplaced {
            out.push_str(&render_tree(tree));
        }
    }
    out
}

/// Render one thread as a boxed block. Every line ends with a newline.
pub fn render_tree(tree: &[Comment]) -> String {
    let Some(root) = tree.first() else {
        return String::new();
    };

    let mut result = Vec::new();
    result.push(if root.is_pending() {
        PENDING_BANNER.to_string()
    } else {
        REVIEW_BANNER.to_string()
    });
    result.push(format!("    │ File: {}", root.path));
    result.push(format!(
        "    │ {} {} : {}",
        display_time(&root.created_at),
        tree_authors(tree),
        root.id
    ));
    result.push("    │".to_string());

    for (idx, comment) in tree.iter().enumerate() {
        if idx == 0 {
            result.push(format!("    │ [{}]:", comment.author));
        } else {
            result.push("    │".to_string());
            result.push(format!(
                "    │ Reply by [{}]:[{}]",
                comment.author, comment.id
            ));
        }
        for body_line in escape_body(&comment.body).split('\n') {
            result.push(format!("    │   {body_line}"));
        }
    }

    result.push(FOOTER.to_string());
    result.push(String::new());
    result.join("\n")
}

/// `2024-01-02T03:04:05Z` becomes `2024-01-02 03:04:05`; anything else is
/// shown as-is.
fn display_time(ts: &str) -> String {
    ts.trim_end_matches('Z').replacen('T', " ", 1)
}

/// Prepare a comment body for display: drop trailing blank lines and turn a
/// leading `*` into `-` so the block does not read as an outline heading.
pub fn escape_body(body: &str) -> String {
    let lines: Vec<&str> = body.split('\n').collect();
    let end = lines
        .iter()
        .rposition(|l| !l.trim().is_empty())
        .map_or(0, |i| i + 1);
    lines[..end]
        .iter()
        .map(|line| {
            if line.starts_with('*') {
                line.replacen('*', "-", 1)
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Header block shown above the diff.
pub fn render_metadata(meta: &PrMetadata) -> String {
    let mut out = String::new();
    out.push_str(&format!("#{} {}\n", meta.number, meta.title));
    let mut state = meta.state.clone();
    if meta.draft {
        state.push_str(" (draft)");
    }
    out.push_str(&format!("Author: {}  State: {state}\n", meta.author));
    out.push_str(&format!("Branch: {} <- {}\n", meta.base_ref, meta.head_ref));
    if !meta.head_sha.is_empty() {
        out.push_str(&format!("Head: {}\n", meta.head_sha));
    }
    for (label, values) in [
        ("Labels", &meta.labels),
        ("Assignees", &meta.assignees),
        ("Reviewers", &meta.reviewers),
    ] {
        if !values.is_empty() {
            out.push_str(&format!("{label}: {}\n", values.join(", ")));
        }
    }
    if !meta.milestone.is_empty() {
        out.push_str(&format!("Milestone: {}\n", meta.milestone));
    }
    if !meta.ci_status.is_empty() {
        out.push_str(&format!("CI: {}", meta.ci_status));
        if !meta.ci_failures.is_empty() {
            out.push_str(&format!(" ({})", meta.ci_failures.join(", ")));
        }
        out.push('\n');
    }
    if !meta.url.is_empty() {
        out.push_str(&format!("URL: {}\n", meta.url));
    }
    let body = escape_body(&meta.description);
    if !body.is_empty() {
        out.push('\n');
        out.push_str(&body);
        out.push('\n');
    }
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comments::CommentId;
    use crate::diff::parse_diff;

    const DIFF: &str = "diff --git a/src/lib.rs b/src/lib.rs
index 1111111..2222222 100644
--- a/src/lib.rs
+++ b/src/lib.rs
@@ -1,2 +1,3 @@
 fn a() {}
+fn b() {}
 fn c() {}
";

    fn comment(id: CommentId, author: &str, position: Option<i64>, reply_to: Option<i64>) -> Comment {
        Comment {
            id,
            author: author.to_string(),
            body: format!("body {id}"),
            path: "src/lib.rs".to_string(),
            position,
            reply_to: reply_to.map(CommentId::Remote),
            created_at: "2024-05-06T07:08:09Z".to_string(),
            outdated: false,
        }
    }

    fn annotator() -> Annotator {
        Annotator::new(vec![Regex::new("advanced").unwrap()])
    }

    #[test]
    fn test_escape_body() {
        assert_eq!(escape_body("*"), "-");
        assert_eq!(escape_body("Content\n\n\n"), "Content");
        assert_eq!(escape_body(""), "");
        assert_eq!(escape_body("* a\n** b\nc * d\n  \n"), "- a\n-* b\nc * d");
    }

    #[test]
    fn test_render_tree_format() {
        let tree = vec![
            comment(CommentId::Remote(11), "alice", Some(2), None),
            comment(CommentId::Remote(12), "bob", Some(2), Some(11)),
        ];
        let rendered = render_tree(&tree);
        let expected = "    ┌─ REVIEW COMMENT ─────────────────
    │ File: src/lib.rs
    │ 2024-05-06 07:08:09 alice|bob : 11
    │
    │ [alice]:
    │   body 11
    │
    │ Reply by [bob]:[12]
    │   body 12
    └──────────────────────────────────
";
        assert_eq!(rendered, expected);
    }

    #[test]
    fn test_pending_banner_for_local_root() {
        let tree = vec![comment(CommentId::Local(3), "me", Some(1), None)];
        let rendered = render_tree(&tree);
        assert!(rendered.starts_with(PENDING_BANNER));
        assert_eq!(
            PENDING_BANNER.chars().count(),
            REVIEW_BANNER.chars().count()
        );
    }

    #[test]
    fn test_threads_attach_after_their_line() {
        let diff = parse_diff(DIFF);
        let comments = vec![comment(CommentId::Remote(1), "alice", Some(2), None)];
        let out = annotator().annotate(&diff, comments, None);

        let with_threads: Vec<_> = out
            .lines
            .iter()
            .filter(|l| !l.threads.is_empty())
            .collect();
        assert_eq!(with_threads.len(), 1);
        assert_eq!(with_threads[0].line.text, "+fn b() {}");

        let addition = out.text.find("+fn b() {}").unwrap();
        let banner = out.text.find("REVIEW COMMENT").unwrap();
        let next = out.text.find(" fn c() {}").unwrap();
        assert!(addition < banner && banner < next);
    }

    #[test]
    fn test_file_level_comment_attaches_to_header() {
        let diff = parse_diff(DIFF);
        let comments = vec![
            comment(CommentId::Remote(1), "alice", None, None),
            comment(CommentId::Local(1), "me", Some(0), None),
        ];
        let out = annotator().annotate(&diff, comments, None);
        assert_eq!(out.lines[0].line.kind, LineKind::FileHeader);
        assert_eq!(out.lines[0].threads.len(), 2);
        assert!(out.unplaced.is_empty());
    }

    #[test]
    fn test_excluded_authors_are_dropped() {
        let diff = parse_diff(DIFF);
        let comments = vec![
            comment(CommentId::Remote(1), "github-advanced-security", Some(1), None),
            comment(CommentId::Remote(2), "alice", Some(1), None),
        ];
        let out = annotator().annotate(&diff, comments, None);
        assert!(!out.text.contains("advanced"));
        assert_eq!(out.lines.iter().map(|l| l.threads.len()).sum::<usize>(), 1);
        let authors: Vec<&str> = out.comments.iter().map(|c| c.author.as_str()).collect();
        assert_eq!(authors, vec!["alice"]);
    }

    #[test]
    fn test_outdated_and_unplaced_sections() {
        let diff = parse_diff(DIFF);
        let mut stale = comment(CommentId::Remote(1), "alice", None, None);
        stale.outdated = true;
        let reply = comment(CommentId::Remote(2), "bob", None, Some(1));
        let elsewhere = comment(CommentId::Remote(3), "carol", Some(40), None);
        let out = annotator().annotate(&diff, vec![stale, reply, elsewhere], None);

        assert_eq!(out.outdated.len(), 1);
        assert_eq!(out.outdated[0].len(), 2);
        assert_eq!(out.unplaced.len(), 1);
        assert!(out.lines.iter().all(|l| l.threads.is_empty()));
        assert!(out.text.contains("Outdated comments:"));
        assert!(out.text.contains("Comments outside the diff:"));
    }

    #[test]
    fn test_comment_key() {
        let c = comment(CommentId::Remote(1), "a", Some(5), None);
        assert_eq!(comment_key(&c), "src/lib.rs:5");
        let c = comment(CommentId::Remote(1), "a", None, None);
        assert_eq!(comment_key(&c), "src/lib.rs:");
    }

    #[test]
    fn test_metadata_header() {
        let meta = PrMetadata {
            number: 9,
            title: "Add widgets".to_string(),
            author: "alice".to_string(),
            base_ref: "main".to_string(),
            head_ref: "widgets".to_string(),
            state: "open".to_string(),
            draft: true,
            labels: vec!["feature".to_string()],
            description: "* summary\n\n".to_string(),
            ..Default::default()
        };
        let text = render_metadata(&meta);
        assert!(text.starts_with("#9 Add widgets\n"));
        assert!(text.contains("State: open (draft)"));
        assert!(text.contains("Labels: feature\n"));
        assert!(!text.contains("Assignees"));
        assert!(text.contains("- summary"));
        assert!(!text.contains("CI:"));
        assert!(!text.contains("Milestone"));
    }

    #[test]
    fn test_metadata_header_shows_ci_and_milestone() {
        let meta = PrMetadata {
            number: 9,
            title: "Add widgets".to_string(),
            milestone: "v1.2".to_string(),
            ci_status: "failure".to_string(),
            ci_failures: vec!["lint".to_string(), "test".to_string()],
            ..Default::default()
        };
        let text = render_metadata(&meta);
        assert!(text.contains("Milestone: v1.2\n"));
        assert!(text.contains("CI: failure (lint, test)\n"));
    }
}
