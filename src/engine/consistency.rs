//! Step 3: platform consistency checker
//!
//! Remote names that cannot exist on the local platform (and local names
//! breaking length limits) are temporarily blacklisted: the node leaves the
//! update tree and its id is withheld from propagation until it changes.

use crate::domain::{NodeIdx, TreePair, UpdateTree};
use crate::shared::{Inconsistency, NodeId, ReplicaSide};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::info;

/// Name rules of the synchronizing platform.
#[derive(Debug, Clone)]
pub struct PlatformRules {
    pub forbidden_chars: Vec<char>,
    pub reserved_stems: Vec<&'static str>,
    pub forbid_trailing_space_or_dot: bool,
    pub max_name_len: usize,
    pub max_path_len: usize,
}

impl PlatformRules {
    #[cfg(windows)]
    pub fn current() -> Self {
        Self::windows()
    }

    #[cfg(not(windows))]
    pub fn current() -> Self {
        Self::posix()
    }

    pub fn windows() -> Self {
        Self {
            forbidden_chars: vec!['\\', '/', ':', '*', '?', '"', '<', '>', '|'],
            reserved_stems: vec![
                "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6",
                "COM7", "COM8", "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7",
                "LPT8", "LPT9",
            ],
            forbid_trailing_space_or_dot: true,
            max_name_len: 255,
            max_path_len: 260,
        }
    }

    pub fn posix() -> Self {
        Self {
            forbidden_chars: vec!['/', '\0'],
            reserved_stems: Vec::new(),
            forbid_trailing_space_or_dot: false,
            max_name_len: 255,
            max_path_len: 4096,
        }
    }

    /// First rule a name breaks, if any.
    pub fn check_name(&self, name: &str) -> Option<Inconsistency> {
        if name.chars().any(|c| self.forbidden_chars.contains(&c) || c.is_control()) {
            return Some(Inconsistency::ForbiddenChar);
        }
        let stem = name.split('.').next().unwrap_or(name);
        if self
            .reserved_stems
            .iter()
            .any(|reserved| stem.eq_ignore_ascii_case(reserved))
        {
            return Some(Inconsistency::ReservedName);
        }
        if self.forbid_trailing_space_or_dot && (name.ends_with(' ') || name.ends_with('.')) {
            return Some(Inconsistency::TrailingSpaceOrDot);
        }
        if name.chars().count() > self.max_name_len {
            return Some(Inconsistency::NameTooLong);
        }
        None
    }
}

/// A node withheld from the pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlacklistEntry {
    pub side: ReplicaSide,
    pub node_id: NodeId,
    pub path: PathBuf,
    pub inconsistency: Inconsistency,
}

/// Run the checker over both trees. Offending subtrees are removed from
/// their tree; the returned entries feed the tmp-blacklist.
pub fn check_consistency(trees: &mut TreePair, rules: &PlatformRules) -> Vec<BlacklistEntry> {
    let mut entries = Vec::new();

    // Remote items must comply with local platform rules; local items comply
    // by construction and only get the length checks.
    collect_name_violations(&trees.remote, rules, false, &mut entries);
    collect_name_violations(&trees.local, rules, true, &mut entries);
    collect_sibling_clashes(&trees.remote, &mut entries);

    for entry in &entries {
        let tree = trees.tree_mut(entry.side);
        if let Some(idx) = tree.node_by_id(&entry.node_id) {
            tree.remove_subtree(idx);
        }
        info!(
            side = %entry.side,
            path = %entry.path.display(),
            kind = %entry.inconsistency,
            "Item blacklisted for platform inconsistency"
        );
    }
    entries
}

fn collect_name_violations(
    tree: &UpdateTree,
    rules: &PlatformRules,
    length_only: bool,
    entries: &mut Vec<BlacklistEntry>,
) {
    for idx in tree.bfs() {
        if idx == tree.root() {
            continue;
        }
        let node = tree.node(idx);
        let Some(id) = &node.id else { continue };

        let violation = match rules.check_name(&node.name) {
            Some(Inconsistency::NameTooLong) => Some(Inconsistency::NameTooLong),
            Some(other) if !length_only => Some(other),
            _ => None,
        };
        let path = tree.path_of(idx);
        let violation = violation.or_else(|| {
            (path.to_string_lossy().chars().count() > rules.max_path_len)
                .then_some(Inconsistency::PathTooLong)
        });
        if let Some(inconsistency) = violation {
            entries.push(BlacklistEntry {
                side: node.side,
                node_id: id.clone(),
                path,
                inconsistency,
            });
        }
    }
}

/// Two live siblings whose names collide after case and Unicode
/// normalization cannot both exist locally; the newer arrival (the one
/// carrying a change event) is withheld.
fn collect_sibling_clashes(tree: &UpdateTree, entries: &mut Vec<BlacklistEntry>) {
    for idx in tree.bfs() {
        let node = tree.node(idx);
        if node.kind != crate::shared::NodeKind::Directory {
            continue;
        }
        let mut seen: HashMap<String, NodeIdx> = HashMap::new();
        for child_idx in node.children().to_vec() {
            let child = tree.node(child_idx);
            let key = child.normalized.to_lowercase();
            match seen.get(&key) {
                None => {
                    seen.insert(key, child_idx);
                }
                Some(&first_idx) => {
                    let first = tree.node(first_idx);
                    // Prefer withholding the side of the new change.
                    let loser_idx = if child.has_any_event() || !first.has_any_event() {
                        child_idx
                    } else {
                        first_idx
                    };
                    let loser = tree.node(loser_idx);
                    if let Some(id) = &loser.id {
                        entries.push(BlacklistEntry {
                            side: loser.side,
                            node_id: id.clone(),
                            path: tree.path_of(loser_idx),
                            inconsistency: Inconsistency::NameClash,
                        });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NodeSeed, UpdateTree};
    use crate::shared::{NodeKind, Op};
    use pretty_assertions::assert_eq;

    fn trees() -> TreePair {
        TreePair::new(
            UpdateTree::new(ReplicaSide::Local, 1, "local-root"),
            UpdateTree::new(ReplicaSide::Remote, 1, "remote-root"),
        )
    }

    #[test]
    fn forbidden_remote_name_is_withheld() {
        let mut trees = trees();
        let root = trees.remote.root();
        trees
            .remote
            .insert(
                NodeSeed::new("bad:name.txt", NodeKind::File).id("r1").event(Op::Create),
                root,
            )
            .unwrap();

        let entries = check_consistency(&mut trees, &PlatformRules::windows());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].inconsistency, Inconsistency::ForbiddenChar);
        assert!(trees.remote.node_by_id(&"r1".to_string()).is_none());
    }

    #[test]
    fn reserved_stem_and_trailing_dot_rejected_on_windows_only() {
        let rules = PlatformRules::windows();
        assert_eq!(rules.check_name("CON.txt"), Some(Inconsistency::ReservedName));
        assert_eq!(rules.check_name("report."), Some(Inconsistency::TrailingSpaceOrDot));
        assert_eq!(rules.check_name("fine.txt"), None);

        let posix = PlatformRules::posix();
        assert_eq!(posix.check_name("CON.txt"), None);
        assert_eq!(posix.check_name("report."), None);
    }

    #[test]
    fn local_items_only_get_length_checks() {
        let mut trees = trees();
        let root = trees.local.root();
        // A colon is legal on the posix side it came from, and the local
        // tree pass must not reject it even under windows rules.
        trees
            .local
            .insert(
                NodeSeed::new("ok:here.txt", NodeKind::File).id("l1").event(Op::Create),
                root,
            )
            .unwrap();
        let long_name = "x".repeat(300);
        trees
            .local
            .insert(
                NodeSeed::new(long_name, NodeKind::File).id("l2").event(Op::Create),
                root,
            )
            .unwrap();

        let entries = check_consistency(&mut trees, &PlatformRules::windows());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].node_id, "l2");
        assert_eq!(entries[0].inconsistency, Inconsistency::NameTooLong);
        assert!(trees.local.node_by_id(&"l1".to_string()).is_some());
    }

    #[test]
    fn sibling_clash_blacklists_newer_arrival() {
        let mut trees = trees();
        let root = trees.remote.root();
        trees
            .remote
            .insert(NodeSeed::new("Readme.md", NodeKind::File).id("r-old"), root)
            .unwrap();
        trees
            .remote
            .insert(
                NodeSeed::new("README.MD", NodeKind::File).id("r-new").event(Op::Create),
                root,
            )
            .unwrap();

        let entries = check_consistency(&mut trees, &PlatformRules::posix());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].node_id, "r-new");
        assert_eq!(entries[0].inconsistency, Inconsistency::NameClash);
        assert!(trees.remote.node_by_id(&"r-old".to_string()).is_some());
    }
}
