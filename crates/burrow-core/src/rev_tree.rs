//! The revision tree: a forest of per-document edit histories.
///
/// A document's tree is a `RevTree` (`Vec<RevPath>`), one `RevPath` per root
/// (first-generation revision). Each `RevPath` holds a linear-or-branching
/// `RevNode` chain. `merge.rs` implements the algorithm that grafts new
/// paths in; this module is the data shape plus the read-only walks over it
/// (leaf/winner collection, path-to-root, ancestor search) that both the
/// merge algorithm and the storage engines need.
use serde::{Deserialize, Serialize};

use crate::revision::Revision;

pub type RevTree = Vec<RevPath>;

/// One root of the forest, together with the generation its root node sits
/// at (usually 1, but can be higher after `stem` prunes the tree).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevPath {
    pub pos: u64,
    pub tree: RevNode,
}

/// Whether a node's body is present in the store or was never fetched
/// (a stub ancestor created by `force_insert`) or has been nulled out by
/// compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevStatus {
    Available,
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeOpts {
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevNode {
    pub hash: String,
    pub status: RevStatus,
    pub opts: NodeOpts,
    pub children: Vec<RevNode>,
}

impl RevNode {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// A leaf revision plus the facts about it that the winner algorithm needs,
/// without borrowing from the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafInfo {
    pub pos: u64,
    pub hash: String,
    pub deleted: bool,
}

impl LeafInfo {
    pub fn revision(&self) -> Revision {
        Revision::new(self.pos, self.hash.clone())
    }
}

/// Collect every leaf (childless node) across the whole forest, ordered
/// winner-first: non-deleted before deleted, then by descending generation,
/// then by descending hash. This is CouchDB's deterministic winner rule —
/// every replica that has received the same set of revisions computes the
/// same order independently.
pub fn collect_leaves(tree: &RevTree) -> Vec<LeafInfo> {
    let mut leaves = Vec::new();
    for path in tree {
        walk_leaves(&path.tree, path.pos, &mut leaves);
    }
    leaves.sort_by(|a, b| {
        a.deleted
            .cmp(&b.deleted)
            .then_with(|| b.pos.cmp(&a.pos))
            .then_with(|| b.hash.cmp(&a.hash))
    });
    leaves
}

fn walk_leaves(node: &RevNode, pos: u64, out: &mut Vec<LeafInfo>) {
    if node.children.is_empty() {
        out.push(LeafInfo {
            pos,
            hash: node.hash.clone(),
            deleted: node.opts.deleted,
        });
        return;
    }
    for child in &node.children {
        walk_leaves(child, pos + 1, out);
    }
}

/// Every node in the forest, flattened to `(Revision, is_leaf, status, deleted)`.
/// Used by `changes_since` and friends to enumerate current-leaf revisions.
pub fn collect_all(tree: &RevTree) -> Vec<(Revision, bool, RevStatus, bool)> {
    let mut out = Vec::new();
    for path in tree {
        walk_all(&path.tree, path.pos, &mut out);
    }
    out
}

fn walk_all(node: &RevNode, pos: u64, out: &mut Vec<(Revision, bool, RevStatus, bool)>) {
    out.push((
        Revision::new(pos, node.hash.clone()),
        node.is_leaf(),
        node.status,
        node.opts.deleted,
    ));
    for child in &node.children {
        walk_all(child, pos + 1, out);
    }
}

/// Find a node by `(pos, hash)` anywhere in the forest.
pub fn find_node<'a>(tree: &'a RevTree, pos: u64, hash: &str) -> Option<&'a RevNode> {
    for path in tree {
        if let Some(found) = find_in_node(&path.tree, path.pos, pos, hash) {
            return Some(found);
        }
    }
    None
}

fn find_in_node<'a>(node: &'a RevNode, cur_pos: u64, pos: u64, hash: &str) -> Option<&'a RevNode> {
    if cur_pos == pos && node.hash == hash {
        return Some(node);
    }
    for child in &node.children {
        if let Some(found) = find_in_node(child, cur_pos + 1, pos, hash) {
            return Some(found);
        }
    }
    None
}

/// Path from the given revision up to its root, newest first (the revision
/// itself is included). Returns `None` if the revision is absent.
pub fn path_to_root(tree: &RevTree, pos: u64, hash: &str) -> Option<Vec<Revision>> {
    for path in tree {
        if let Some(mut chain) = chain_to_root(&path.tree, path.pos, pos, hash) {
            chain.reverse();
            return Some(chain);
        }
    }
    None
}

/// Returns the chain root-first if `target` is found in this subtree.
fn chain_to_root(node: &RevNode, cur_pos: u64, target_pos: u64, target_hash: &str) -> Option<Vec<Revision>> {
    if cur_pos == target_pos && node.hash == target_hash {
        return Some(vec![Revision::new(cur_pos, node.hash.clone())]);
    }
    for child in &node.children {
        if let Some(mut chain) = chain_to_root(child, cur_pos + 1, target_pos, target_hash) {
            chain.insert(0, Revision::new(cur_pos, node.hash.clone()));
            return Some(chain);
        }
    }
    None
}

/// Build a linear (non-branching) `RevPath` from a newest-to-oldest list of
/// hashes, applying the same `status`/`opts` to every node. Handy for tests
/// and for synthesizing a brand-new root-to-leaf chain; real ingestion code
/// that needs per-node status (stub ancestors vs. an available leaf) should
/// build the `RevNode` chain directly.
pub fn build_path_from_revs(pos: u64, hashes: &[String], opts: NodeOpts, status: RevStatus) -> RevPath {
    assert!(!hashes.is_empty());
    let mut node = RevNode {
        hash: hashes[0].clone(),
        status,
        opts: opts.clone(),
        children: vec![],
    };
    for hash in &hashes[1..] {
        node = RevNode {
            hash: hash.clone(),
            status,
            opts: opts.clone(),
            children: vec![node],
        };
    }
    let root_pos = pos - (hashes.len() as u64 - 1);
    RevPath {
        pos: root_pos,
        tree: node,
    }
}

/// Build a linear chain where only the newest node carries `leaf_opts` and
/// `leaf_status`; every ancestor is a `Missing`, non-deleted stub. This is
/// the shape `force_insert` needs: the newest revision arrives with a body,
/// everything behind it is history-only.
pub fn build_stub_chain(
    newest_pos: u64,
    hashes_newest_first: &[String],
    leaf_status: RevStatus,
    leaf_opts: NodeOpts,
) -> RevPath {
    assert!(!hashes_newest_first.is_empty());
    let mut node = RevNode {
        hash: hashes_newest_first[0].clone(),
        status: leaf_status,
        opts: leaf_opts,
        children: vec![],
    };
    for hash in &hashes_newest_first[1..] {
        node = RevNode {
            hash: hash.clone(),
            status: RevStatus::Missing,
            opts: NodeOpts::default(),
            children: vec![node],
        };
    }
    let root_pos = newest_pos - (hashes_newest_first.len() as u64 - 1);
    RevPath {
        pos: root_pos,
        tree: node,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(hash: &str) -> RevNode {
        RevNode {
            hash: hash.into(),
            status: RevStatus::Available,
            opts: NodeOpts::default(),
            children: vec![],
        }
    }

    fn node(hash: &str, children: Vec<RevNode>) -> RevNode {
        RevNode {
            hash: hash.into(),
            status: RevStatus::Available,
            opts: NodeOpts::default(),
            children,
        }
    }

    #[test]
    fn path_to_root_finds_full_ancestry() {
        let tree = vec![RevPath {
            pos: 1,
            tree: node("a", vec![node("b", vec![leaf("c")])]),
        }];
        let chain = path_to_root(&tree, 3, "c").unwrap();
        let hashes: Vec<_> = chain.iter().map(|r| r.suffix.clone()).collect();
        assert_eq!(hashes, vec!["c", "b", "a"]);
    }

    #[test]
    fn path_to_root_missing_returns_none() {
        let tree = vec![RevPath {
            pos: 1,
            tree: leaf("a"),
        }];
        assert!(path_to_root(&tree, 9, "zzz").is_none());
    }

    #[test]
    fn build_stub_chain_only_leaf_available() {
        let path = build_stub_chain(
            3,
            &["c".into(), "b".into(), "a".into()],
            RevStatus::Available,
            NodeOpts::default(),
        );
        assert_eq!(path.pos, 1);
        assert_eq!(path.tree.hash, "a");
        assert_eq!(path.tree.status, RevStatus::Missing);
        assert_eq!(path.tree.children[0].hash, "b");
        assert_eq!(path.tree.children[0].status, RevStatus::Missing);
        assert_eq!(path.tree.children[0].children[0].hash, "c");
        assert_eq!(path.tree.children[0].children[0].status, RevStatus::Available);
    }

    #[test]
    fn collect_all_counts_every_node() {
        let tree = vec![RevPath {
            pos: 1,
            tree: node("a", vec![leaf("b"), leaf("c")]),
        }];
        assert_eq!(collect_all(&tree).len(), 3);
    }

    #[test]
    fn find_node_locates_interior() {
        let tree = vec![RevPath {
            pos: 1,
            tree: node("a", vec![leaf("b")]),
        }];
        assert!(find_node(&tree, 1, "a").is_some());
        assert!(find_node(&tree, 2, "b").is_some());
        assert!(find_node(&tree, 2, "zzz").is_none());
    }
}
