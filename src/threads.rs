//! Groups a flat comment list into one-level-deep threads.
//!
//! A root collects its direct replies only. A reply to a reply does not join
//! the root's thread; it becomes a standalone thread appended after all the
//! rooted ones, the same as a reply whose parent is missing.

use std::collections::HashSet;
use std::hash::Hash;

use crate::comments::{Comment, CommentId};

pub trait Threaded {
    type Id: Copy + Eq + Hash;

    fn thread_id(&self) -> Self::Id;
    fn parent_id(&self) -> Option<Self::Id>;
}

impl Threaded for Comment {
    type Id = CommentId;

    fn thread_id(&self) -> CommentId {
        self.id
    }

    fn parent_id(&self) -> Option<CommentId> {
        self.reply_to
    }
}

/// Build comment trees. Element 0 of each tree is its root; the remaining
/// elements are direct replies in input order. Every input comment lands in
/// exactly one tree.
pub fn build_trees<T: Threaded + Clone>(comments: &[T]) -> Vec<Vec<T>> {
    let mut processed: HashSet<T::Id> = HashSet::new();
    let mut trees = Vec::new();

    for comment in comments {
        let id = comment.thread_id();
        if processed.contains(&id) || comment.parent_id().is_some() {
            continue;
        }
        processed.insert(id);
        let mut tree = vec![comment.clone()];
        for candidate in comments {
            let cid = candidate.thread_id();
            if !processed.contains(&cid) && candidate.parent_id() == Some(id) {
                processed.insert(cid);
                tree.push(candidate.clone());
            }
        }
        trees.push(tree);
    }

    for comment in comments {
        if processed.insert(comment.thread_id()) {
            trees.push(vec![comment.clone()]);
        }
    }

    trees
}

/// Distinct authors of a tree in first-seen order, joined with `|`.
pub fn tree_authors(tree: &[Comment]) -> String {
    let mut seen = HashSet::new();
    tree.iter()
        .filter(|c| seen.insert(c.author.as_str()))
        .map(|c| c.author.as_str())
        .collect::<Vec<_>>()
        .join("|")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Node(i64, Option<i64>);

    impl Threaded for Node {
        type Id = i64;
        fn thread_id(&self) -> i64 {
            self.0
        }
        fn parent_id(&self) -> Option<i64> {
            self.1
        }
    }

    fn ids(trees: &[Vec<Node>]) -> Vec<Vec<i64>> {
        trees
            .iter()
            .map(|t| t.iter().map(|n| n.0).collect())
            .collect()
    }

    #[test]
    fn test_reply_to_reply_becomes_own_tree() {
        let input = vec![Node(1, None), Node(2, Some(1)), Node(3, Some(2))];
        assert_eq!(ids(&build_trees(&input)), vec![vec![1, 2], vec![3]]);
    }

    #[test]
    fn test_orphan_reply_is_promoted() {
        let input = vec![Node(10, Some(99)), Node(1, None)];
        assert_eq!(ids(&build_trees(&input)), vec![vec![1], vec![10]]);
    }

    #[test]
    fn test_replies_keep_input_order_even_before_root() {
        let input = vec![Node(3, Some(1)), Node(1, None), Node(2, Some(1))];
        assert_eq!(ids(&build_trees(&input)), vec![vec![1, 3, 2]]);
    }

    #[test]
    fn test_every_comment_in_exactly_one_tree() {
        let input = vec![
            Node(1, None),
            Node(2, Some(1)),
            Node(3, None),
            Node(4, Some(3)),
            Node(5, Some(4)),
            Node(6, Some(42)),
            Node(7, Some(1)),
        ];
        let trees = build_trees(&input);
        let mut all: Vec<i64> = trees.iter().flatten().map(|n| n.0).collect();
        all.sort();
        assert_eq!(all, vec![1, 2, 3, 4, 5, 6, 7]);
        for tree in &trees {
            let root = &tree[0];
            for reply in &tree[1..] {
                assert_eq!(reply.1, Some(root.0));
            }
        }
    }

    #[test]
    fn test_empty_input() {
        let trees: Vec<Vec<Node>> = build_trees(&[]);
        assert!(trees.is_empty());
    }

    #[test]
    fn test_local_and_remote_ids_do_not_collide() {
        let mk = |id: CommentId, reply_to: Option<CommentId>, author: &str| Comment {
            id,
            author: author.to_string(),
            body: String::new(),
            path: "a.rs".to_string(),
            position: Some(1),
            reply_to,
            created_at: String::new(),
            outdated: false,
        };
        let input = vec![
            mk(CommentId::Remote(1), None, "alice"),
            mk(CommentId::Local(1), Some(CommentId::Remote(1)), "me"),
            mk(CommentId::Remote(2), Some(CommentId::Remote(1)), "alice"),
        ];
        let trees = build_trees(&input);
        assert_eq!(trees.len(), 1);
        assert_eq!(trees[0].len(), 3);
        assert_eq!(tree_authors(&trees[0]), "alice|me");
    }
}
