//! Nested table of contents rebuilt from the flat node list.
//!
//! Levels are folded from the deepest to level 0: every node at the current level
//! is appended to its parent's pending child list (or to the top level), and a volume
//! takes the child list that was completed one level below. No recursion over the
//! flat structure is needed.

use crate::model::{ContentStatus, Node};
use serde::Serialize;

/// One entry of the nested table of contents. `index` points into the node list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TocEntry {
    Section {
        index: usize,
        title: String,
        children: Vec<TocEntry>,
    },
    Chapter {
        index: usize,
        title: String,
    },
}

impl TocEntry {
    pub fn index(&self) -> usize {
        match self {
            TocEntry::Section { index, .. } | TocEntry::Chapter { index, .. } => *index,
        }
    }

    pub fn title(&self) -> &str {
        match self {
            TocEntry::Section { title, .. } | TocEntry::Chapter { title, .. } => title,
        }
    }

    pub fn children(&self) -> &[TocEntry] {
        match self {
            TocEntry::Section { children, .. } => children,
            TocEntry::Chapter { .. } => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TocOptions {
    /// Drop skipped chapters and volumes without any downloaded chapter.
    pub prune: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Toc {
    pub entries: Vec<TocEntry>,
}

impl Toc {
    /// Retained node indices in reading order.
    pub fn spine(&self) -> Vec<usize> {
        let mut out = Vec::new();
        let mut stack: Vec<&TocEntry> = self.entries.iter().rev().collect();
        while let Some(entry) = stack.pop() {
            out.push(entry.index());
            stack.extend(entry.children().iter().rev());
        }
        out
    }

    /// Deepest nesting level of the entries, 1 for a flat list, 0 when empty.
    pub fn max_depth(&self) -> usize {
        fn depth(entries: &[TocEntry]) -> usize {
            entries
                .iter()
                .map(|e| 1 + depth(e.children()))
                .max()
                .unwrap_or(0)
        }
        depth(&self.entries)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Which nodes survive pruning. A removed volume removes its whole subtree.
fn retained(nodes: &[Node], options: TocOptions) -> Vec<bool> {
    if !options.prune {
        return vec![true; nodes.len()];
    }
    let mut has_ok = vec![false; nodes.len()];
    for node in nodes.iter().rev() {
        if node.is_chapter() && node.status() == Some(ContentStatus::Ok) {
            has_ok[node.index] = true;
        }
        if let Some(p) = node.parent {
            if has_ok[node.index] {
                has_ok[p] = true;
            }
        }
    }
    let mut keep = vec![false; nodes.len()];
    for node in nodes {
        let own = if node.is_volume() {
            has_ok[node.index]
        } else {
            node.status() != Some(ContentStatus::Skipped)
        };
        keep[node.index] = own && node.parent.map_or(true, |p| keep[p]);
    }
    keep
}

/// Fold the flat node list into a nested table of contents.
pub fn build(nodes: &[Node], depth: u32, options: TocOptions) -> Toc {
    let keep = retained(nodes, options);
    let depth = nodes.iter().map(|n| n.level).fold(depth, u32::max);
    let mut pending: Vec<Vec<TocEntry>> = vec![Vec::new(); nodes.len()];
    let mut top = Vec::new();
    for level in (0..=depth).rev() {
        for node in nodes.iter().filter(|n| n.level == level && keep[n.index]) {
            let entry = if node.is_volume() {
                TocEntry::Section {
                    index: node.index,
                    title: node.title.clone(),
                    children: std::mem::take(&mut pending[node.index]),
                }
            } else {
                TocEntry::Chapter {
                    index: node.index,
                    title: node.title.clone(),
                }
            };
            match node.parent {
                Some(p) => pending[p].push(entry),
                None => top.push(entry),
            }
        }
    }
    Toc { entries: top }
}
