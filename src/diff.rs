//! Unified diff parsing with GitHub review-comment positions.
//!
//! A position counts lines below the first `@@` header of a file. The first
//! hunk header itself has no position, the line after it is position 1, and
//! every following line (including later hunk headers and `\ No newline`
//! markers) advances the count by one. Position 0 is reserved for the
//! synthetic file header line, which is where file-level comments attach.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Modified,
    New,
    Deleted,
    Renamed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LineKind {
    FileHeader,
    HunkHeader,
    Addition,
    Deletion,
    Context,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffLine {
    pub path: String,
    pub position: Option<u32>,
    pub kind: LineKind,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub header: String,
    pub position: Option<u32>,
    pub old_start: u32,
    pub old_len: u32,
    pub new_start: u32,
    pub new_len: u32,
    pub lines: Vec<DiffLine>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiff {
    pub path: String,
    pub old_path: Option<String>,
    pub status: FileStatus,
    pub header: Vec<String>,
    pub hunks: Vec<Hunk>,
}

impl FileDiff {
    fn new(header_line: &str) -> Self {
        let (old, new) = parse_git_header(header_line);
        Self {
            path: new,
            old_path: Some(old),
            status: FileStatus::Modified,
            header: vec![header_line.to_string()],
            hunks: Vec::new(),
        }
    }

    /// The synthetic line carrying the raw header block at position 0.
    pub fn header_line(&self) -> DiffLine {
        DiffLine {
            path: self.path.clone(),
            position: Some(0),
            kind: LineKind::FileHeader,
            text: self.header.join("\n"),
        }
    }

    fn finish(mut self) -> Self {
        if self.status != FileStatus::Renamed {
            self.old_path = None;
        }
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedDiff {
    pub files: Vec<FileDiff>,
}

impl ParsedDiff {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn file(&self, path: &str) -> Option<&FileDiff> {
        self.files.iter().find(|f| f.path == path)
    }

    /// All lines in render order: each file's header line, then its hunk
    /// headers and content lines.
    pub fn lines(&self) -> Vec<DiffLine> {
        let mut out = Vec::new();
        for file in &self.files {
            out.push(file.header_line());
            for hunk in &file.hunks {
                out.push(DiffLine {
                    path: file.path.clone(),
                    position: hunk.position,
                    kind: LineKind::HunkHeader,
                    text: hunk.header.clone(),
                });
                out.extend(hunk.lines.iter().cloned());
            }
        }
        out
    }

    /// Positions a review comment may target in `path`, in ascending order.
    pub fn valid_positions(&self, path: &str) -> Vec<u32> {
        let Some(file) = self.file(path) else {
            return Vec::new();
        };
        let mut positions = vec![0];
        for hunk in &file.hunks {
            positions.extend(hunk.position);
            positions.extend(hunk.lines.iter().filter_map(|l| l.position));
        }
        positions
    }
}

/// Parse unified diff text. Input without any `diff --git` header yields an
/// empty result.
pub fn parse_diff(text: &str) -> ParsedDiff {
    let mut files = Vec::new();
    let mut current: Option<FileDiff> = None;
    let mut position: Option<u32> = None;

    for line in text.lines() {
        if line.starts_with("diff --git ") {
            if let Some(file) = current.take() {
                files.push(file.finish());
            }
            current = Some(FileDiff::new(line));
            position = None;
            continue;
        }

        let Some(file) = current.as_mut() else {
            continue;
        };

        if line.starts_with("@@") {
            let (old_start, old_len, new_start, new_len) = parse_hunk_ranges(line);
            let hunk_position = match position {
                None => {
                    position = Some(0);
                    None
                }
                Some(p) => {
                    position = Some(p + 1);
                    position
                }
            };
            file.hunks.push(Hunk {
                header: line.to_string(),
                position: hunk_position,
                old_start,
                old_len,
                new_start,
                new_len,
                lines: Vec::new(),
            });
            continue;
        }

        match position {
            None => apply_header_line(file, line),
            Some(p) => {
                let next = p + 1;
                position = Some(next);
                let kind = match line.as_bytes().first() {
                    Some(b'+') => LineKind::Addition,
                    Some(b'-') => LineKind::Deletion,
                    _ => LineKind::Context,
                };
                let path = file.path.clone();
                if let Some(hunk) = file.hunks.last_mut() {
                    hunk.lines.push(DiffLine {
                        path,
                        position: Some(next),
                        kind,
                        text: line.to_string(),
                    });
                }
            }
        }
    }

    if let Some(file) = current.take() {
        files.push(file.finish());
    }

    ParsedDiff { files }
}

fn apply_header_line(file: &mut FileDiff, line: &str) {
    file.header.push(line.to_string());
    if line.starts_with("new file mode") {
        file.status = FileStatus::New;
    } else if line.starts_with("deleted file mode") {
        file.status = FileStatus::Deleted;
    } else if let Some(from) = line.strip_prefix("rename from ") {
        file.status = FileStatus::Renamed;
        file.old_path = Some(from.to_string());
    } else if let Some(to) = line.strip_prefix("rename to ") {
        file.status = FileStatus::Renamed;
        file.path = to.to_string();
    } else if let Some(from) = line.strip_prefix("--- ") {
        if from != "/dev/null" && file.status != FileStatus::Renamed {
            file.old_path = Some(clean_path(from));
        }
    } else if let Some(to) = line.strip_prefix("+++ ")
        && to != "/dev/null"
    {
        file.path = clean_path(to);
    }
}

/// Split `diff --git a/X b/Y` into `(X, Y)`.
fn parse_git_header(line: &str) -> (String, String) {
    let rest = line.trim_start_matches("diff --git ");
    match rest.find(" b/") {
        Some(idx) => (clean_path(&rest[..idx]), clean_path(&rest[idx + 1..])),
        None => (clean_path(rest), clean_path(rest)),
    }
}

/// Strip the `a/` or `b/` prefix git puts on paths.
fn clean_path(path: &str) -> String {
    let path = path.trim();
    path.strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path)
        .to_string()
}

/// Parse `@@ -a,b +c,d @@`. Missing lengths default to 1.
fn parse_hunk_ranges(line: &str) -> (u32, u32, u32, u32) {
    let mut old = (0, 0);
    let mut new = (0, 0);
    for token in line.split_whitespace().skip(1) {
        if let Some(range) = token.strip_prefix('-') {
            old = parse_range(range);
        } else if let Some(range) = token.strip_prefix('+') {
            new = parse_range(range);
        } else if token == "@@" {
            break;
        }
    }
    (old.0, old.1, new.0, new.1)
}

fn parse_range(range: &str) -> (u32, u32) {
    let mut parts = range.splitn(2, ',');
    let start = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let len = parts.next().and_then(|s| s.parse().ok()).unwrap_or(1);
    (start, len)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_DIFF: &str = "diff --git a/src/main.rs b/src/main.rs
index abc123..def456 100644
--- a/src/main.rs
+++ b/src/main.rs
@@ -1,3 +1,4 @@ fn main()
 fn main() {
     println!(\"Hello\");
+    println!(\"World\");
 }
@@ -20,2 +21,2 @@ fn helper()
-    old();
+    new();
diff --git a/src/lib.rs b/src/lib.rs
index 111222..333444 100644
--- a/src/lib.rs
+++ b/src/lib.rs
@@ -10,3 +10,2 @@ impl Foo {
 impl Foo {
-    // old comment
 }
\\ No newline at end of file
";

    #[test]
    fn test_positions_follow_github_numbering() {
        let diff = parse_diff(SAMPLE_DIFF);
        assert_eq!(diff.files.len(), 2);

        let main = &diff.files[0];
        assert_eq!(main.path, "src/main.rs");
        assert_eq!(main.status, FileStatus::Modified);
        assert_eq!(main.old_path, None);
        assert_eq!(main.hunks[0].position, None);
        let first: Vec<_> = main.hunks[0].lines.iter().map(|l| l.position).collect();
        assert_eq!(first, vec![Some(1), Some(2), Some(3), Some(4)]);
        // The second hunk header consumes a position.
        assert_eq!(main.hunks[1].position, Some(5));
        let second: Vec<_> = main.hunks[1].lines.iter().map(|l| l.position).collect();
        assert_eq!(second, vec![Some(6), Some(7)]);

        // Counting restarts per file, and the no-newline marker counts.
        let lib = &diff.files[1];
        let lib_positions: Vec<_> = lib.hunks[0].lines.iter().map(|l| l.position).collect();
        assert_eq!(lib_positions, vec![Some(1), Some(2), Some(3), Some(4)]);
    }

    #[test]
    fn test_line_kinds_and_ranges() {
        let diff = parse_diff(SAMPLE_DIFF);
        let hunk = &diff.files[0].hunks[0];
        assert_eq!(
            (hunk.old_start, hunk.old_len, hunk.new_start, hunk.new_len),
            (1, 3, 1, 4)
        );
        assert_eq!(hunk.lines[0].kind, LineKind::Context);
        assert_eq!(hunk.lines[2].kind, LineKind::Addition);
        assert_eq!(diff.files[0].hunks[1].lines[0].kind, LineKind::Deletion);
    }

    #[test]
    fn test_flattened_lines_start_with_file_header() {
        let diff = parse_diff(SAMPLE_DIFF);
        let lines = diff.lines();
        assert_eq!(lines[0].kind, LineKind::FileHeader);
        assert_eq!(lines[0].position, Some(0));
        assert!(lines[0].text.starts_with("diff --git a/src/main.rs"));
        assert!(lines[0].text.ends_with("+++ b/src/main.rs"));
        assert_eq!(lines[1].kind, LineKind::HunkHeader);
        assert_eq!(lines[1].position, None);
        // 1 header + 2 hunk headers + 6 lines for main, 1 header + 1 hunk header + 4 lines for lib
        assert_eq!(lines.len(), 15);
    }

    #[test]
    fn test_new_empty_file() {
        let text = "diff --git a/empty.txt b/empty.txt
new file mode 100644
index 0000000..e69de29
";
        let diff = parse_diff(text);
        assert_eq!(diff.files.len(), 1);
        let file = &diff.files[0];
        assert_eq!(file.status, FileStatus::New);
        assert!(file.hunks.is_empty());
        assert_eq!(diff.lines().len(), 1);
        assert_eq!(diff.valid_positions("empty.txt"), vec![0]);
    }

    #[test]
    fn test_new_file_with_content() {
        let text = "diff --git a/new.rs b/new.rs
new file mode 100644
index 0000000..abc1234
--- /dev/null
+++ b/new.rs
@@ -0,0 +1,2 @@
+fn a() {}
+fn b() {}
";
        let diff = parse_diff(text);
        let file = &diff.files[0];
        assert_eq!(file.status, FileStatus::New);
        assert_eq!(file.path, "new.rs");
        assert_eq!(diff.valid_positions("new.rs"), vec![0, 1, 2]);
    }

    #[test]
    fn test_deleted_file() {
        let text = "diff --git a/gone.rs b/gone.rs
deleted file mode 100644
index abc1234..0000000
--- a/gone.rs
+++ /dev/null
@@ -1,1 +0,0 @@
-fn gone() {}
";
        let diff = parse_diff(text);
        let file = &diff.files[0];
        assert_eq!(file.status, FileStatus::Deleted);
        assert_eq!(file.path, "gone.rs");
        assert_eq!(file.hunks[0].lines[0].kind, LineKind::Deletion);
    }

    #[test]
    fn test_renamed_file() {
        let text = "diff --git a/old/name.rs b/new/name.rs
similarity index 90%
rename from old/name.rs
rename to new/name.rs
index abc1234..def5678 100644
--- a/old/name.rs
+++ b/new/name.rs
@@ -1,2 +1,2 @@
-use old;
+use new;
 fn f() {}
";
        let diff = parse_diff(text);
        let file = &diff.files[0];
        assert_eq!(file.status, FileStatus::Renamed);
        assert_eq!(file.path, "new/name.rs");
        assert_eq!(file.old_path.as_deref(), Some("old/name.rs"));
        assert!(diff.lines().iter().all(|l| l.path == "new/name.rs"));
    }

    #[test]
    fn test_pure_rename_without_hunks() {
        let text = "diff --git a/a.txt b/b.txt
similarity index 100%
rename from a.txt
rename to b.txt
";
        let diff = parse_diff(text);
        assert_eq!(diff.files[0].status, FileStatus::Renamed);
        assert_eq!(diff.files[0].path, "b.txt");
        assert!(diff.files[0].hunks.is_empty());
    }

    #[test]
    fn test_malformed_input_yields_empty() {
        assert!(parse_diff("").is_empty());
        assert!(parse_diff("not a diff\n+++ nothing\n@@ -1 +1 @@\n").is_empty());
    }

    #[test]
    fn test_content_that_looks_like_header_inside_hunk() {
        let text = "diff --git a/notes.md b/notes.md
--- a/notes.md
+++ b/notes.md
@@ -1,1 +1,2 @@
 title
+++ not a header
";
        let diff = parse_diff(text);
        let file = &diff.files[0];
        assert_eq!(file.path, "notes.md");
        assert_eq!(file.hunks[0].lines.len(), 2);
        assert_eq!(file.hunks[0].lines[1].kind, LineKind::Addition);
        assert_eq!(file.hunks[0].lines[1].position, Some(2));
    }

    #[test]
    fn test_hunk_range_without_lengths() {
        assert_eq!(parse_hunk_ranges("@@ -3 +4 @@"), (3, 1, 4, 1));
        assert_eq!(parse_hunk_ranges("@@ -0,0 +1,12 @@ ctx"), (0, 0, 1, 12));
    }

    #[test]
    fn test_valid_positions_unknown_path() {
        let diff = parse_diff(SAMPLE_DIFF);
        assert!(diff.valid_positions("missing.rs").is_empty());
        assert_eq!(
            diff.valid_positions("src/main.rs"),
            vec![0, 1, 2, 3, 4, 5, 6, 7]
        );
    }
}
