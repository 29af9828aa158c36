//! Canonical data model: the flat node arena built from a book's chapter list.
//!
//! Nodes are created once by the tree parser and filled exactly once by the downloader.
//! Parent links are plain indices into the same `Vec<Node>`; a parent always has a
//! smaller index than its children.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

const UNCLAIMED: u8 = 0;
const IN_PROGRESS: u8 = 1;
const DONE: u8 = 2;

/// What a node is in the table of contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// Grouping node; no fetchable content of its own.
    Volume,
    /// Leaf with a remote content locator.
    Chapter,
}

/// Terminal outcome of a node's content work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentStatus {
    /// Chapter fetched and normalized.
    Ok,
    /// Transport failure, missing locator, or missing content region.
    Failed,
    /// Password-protected chapter; placeholder emitted.
    Gated,
    /// Chapter fetched but nothing survived normalization; placeholder emitted.
    Empty,
    /// Chapter excluded by chapter selection; never fetched.
    Skipped,
    /// Volume title stub.
    Volume,
}

/// Populated content of a node: markup for EPUB, plain text for TXT output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeContent {
    pub status: ContentStatus,
    /// Minimal markup (`<p>`, `<img>`, `<h1>`). Image sources are store tokens.
    pub html: String,
    /// Plain-text projection, starting with the title line.
    pub text: String,
}

/// One volume or chapter in pre-order.
#[derive(Debug, Serialize)]
pub struct Node {
    pub kind: NodeKind,
    /// Nesting depth, 0 for the top-level sequence.
    pub level: u32,
    /// Position in the flat list. Never reused or renumbered.
    pub index: usize,
    /// Index of the containing volume; `None` at top level.
    pub parent: Option<usize>,
    pub title: String,
    /// Absolute chapter URL; empty for volumes.
    #[serde(rename = "sourceUrl")]
    pub source_url: String,
    /// False when chapter selection excludes this chapter.
    pub selected: bool,
    #[serde(skip)]
    state: AtomicU8,
    #[serde(serialize_with = "serialize_content")]
    content: OnceLock<NodeContent>,
}

fn serialize_content<S: Serializer>(
    content: &OnceLock<NodeContent>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    content.get().serialize(serializer)
}

impl Node {
    pub fn volume(index: usize, level: u32, parent: Option<usize>, title: String) -> Self {
        Self::new(NodeKind::Volume, index, level, parent, title, String::new())
    }

    pub fn chapter(
        index: usize,
        level: u32,
        parent: Option<usize>,
        title: String,
        source_url: String,
    ) -> Self {
        Self::new(NodeKind::Chapter, index, level, parent, title, source_url)
    }

    fn new(
        kind: NodeKind,
        index: usize,
        level: u32,
        parent: Option<usize>,
        title: String,
        source_url: String,
    ) -> Self {
        Self {
            kind,
            level,
            index,
            parent,
            title,
            source_url,
            selected: true,
            state: AtomicU8::new(UNCLAIMED),
            content: OnceLock::new(),
        }
    }

    pub fn is_volume(&self) -> bool {
        self.kind == NodeKind::Volume
    }

    pub fn is_chapter(&self) -> bool {
        self.kind == NodeKind::Chapter
    }

    /// Claim the node for content work without blocking.
    ///
    /// Succeeds for exactly one caller over the node's lifetime; fails when another
    /// worker holds the claim or the node is already done.
    pub fn try_claim(&self) -> bool {
        self.state
            .compare_exchange(UNCLAIMED, IN_PROGRESS, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Publish content and mark the node done. Only the claiming worker calls this.
    ///
    /// Returns false if the node already had content (the new content is dropped).
    pub fn complete(&self, content: NodeContent) -> bool {
        let stored = self.content.set(content).is_ok();
        self.state.store(DONE, Ordering::Release);
        stored
    }

    pub fn is_done(&self) -> bool {
        self.state.load(Ordering::Acquire) == DONE
    }

    pub fn content(&self) -> Option<&NodeContent> {
        self.content.get()
    }

    pub fn status(&self) -> Option<ContentStatus> {
        self.content.get().map(|c| c.status)
    }
}

/// Book-level metadata from the detail page.
#[derive(Debug, Clone, Serialize)]
pub struct BookMeta {
    pub title: String,
    pub author: String,
    /// Normalized description markup (may contain image tokens).
    pub description: Option<String>,
    #[serde(rename = "coverUrl")]
    pub cover_url: Option<String>,
    /// Last update date as shown on the detail page (`YYYY-MM-DD`).
    #[serde(rename = "lastUpdated")]
    pub last_updated: Option<String>,
    #[serde(rename = "sourceUrl")]
    pub source_url: String,
}

/// A parsed book: metadata plus the flat node list and its maximum depth.
#[derive(Debug, Serialize)]
pub struct Book {
    #[serde(flatten)]
    pub meta: BookMeta,
    pub nodes: Vec<Node>,
    pub depth: u32,
}

impl Book {
    pub fn chapters(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.is_chapter())
    }
}

/// Aggregate outcome of a download run over selected chapters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadSummary {
    pub total: usize,
    pub failed: usize,
    pub gated: usize,
    pub empty: usize,
    pub skipped: usize,
    /// (title, locator) of every failed chapter, in list order.
    pub failed_chapters: Vec<(String, String)>,
}

impl DownloadSummary {
    pub fn from_nodes(nodes: &[Node]) -> Self {
        let mut summary = DownloadSummary::default();
        for node in nodes.iter().filter(|n| n.is_chapter()) {
            match node.status() {
                Some(ContentStatus::Skipped) => {
                    summary.skipped += 1;
                    continue;
                }
                Some(ContentStatus::Failed) => {
                    summary.failed += 1;
                    summary
                        .failed_chapters
                        .push((node.title.clone(), node.source_url.clone()));
                }
                Some(ContentStatus::Gated) => summary.gated += 1,
                Some(ContentStatus::Empty) => summary.empty += 1,
                Some(ContentStatus::Ok) | Some(ContentStatus::Volume) | None => {}
            }
            summary.total += 1;
        }
        summary
    }
}
