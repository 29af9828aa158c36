//! Bounded-concurrency download scheduler.
//!
//! A fixed pool of scoped threads scans the same node list. Each node is claimed with a
//! non-blocking compare-and-set; a worker that loses the race moves on to the next node.
//! Every node ends up done, and its work function runs exactly once.

use crate::model::{ContentStatus, Node, NodeContent};
use crate::scraper::normalize::escape_html;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use tracing::{debug, warn};

/// Default number of download threads.
pub const DEFAULT_WORKERS: usize = 4;

/// Progress callback: (completed, total).
pub type ProgressFn<'a> = &'a (dyn Fn(usize, usize) + Sync);

/// Populate every node by running `work` on it exactly once.
///
/// Uses `max(workers, 1)` threads and returns after all of them are joined.
pub fn run<W>(nodes: &[Node], workers: usize, work: W, progress: Option<ProgressFn<'_>>)
where
    W: Fn(&Node) -> NodeContent + Sync,
{
    let workers = workers.max(1);
    let total = nodes.len();
    let completed = AtomicUsize::new(0);
    debug!(workers, total, "starting download");
    thread::scope(|s| {
        for worker in 0..workers {
            let work = &work;
            let completed = &completed;
            s.spawn(move || {
                let mut handled = 0usize;
                for node in nodes {
                    if !node.try_claim() {
                        continue;
                    }
                    let content = work(node);
                    if !node.complete(content) {
                        warn!(index = node.index, "node already had content");
                    }
                    handled += 1;
                    let done = completed.fetch_add(1, Ordering::AcqRel) + 1;
                    if let Some(progress) = progress {
                        progress(done, total);
                    }
                }
                debug!(worker, handled, "worker finished");
            });
        }
    });
}

/// Title stub for a volume node.
pub fn volume_content(node: &Node) -> NodeContent {
    NodeContent {
        status: ContentStatus::Volume,
        html: format!("<h1>{}</h1>\n", escape_html(&node.title)),
        text: format!("{}\n", node.title),
    }
}

/// Placeholder for a chapter that could not be downloaded.
pub fn failed_content(node: &Node) -> NodeContent {
    NodeContent {
        status: ContentStatus::Failed,
        html: format!(
            "<h1>{}</h1>\n<p>Chapter download failed</p>\n<p>{}</p>\n",
            escape_html(&node.title),
            escape_html(&node.source_url)
        ),
        text: format!(
            "{}\nChapter download failed\n{}\n",
            node.title, node.source_url
        ),
    }
}

/// Marker for a chapter excluded by selection. Never fetched.
pub fn skipped_content() -> NodeContent {
    NodeContent {
        status: ContentStatus::Skipped,
        html: String::new(),
        text: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A volume followed by `n - 1` chapters; empty for `n == 0`.
    fn nodes(n: usize) -> Vec<Node> {
        if n == 0 {
            return Vec::new();
        }
        let mut out = vec![Node::volume(0, 0, None, "Vol".into())];
        for i in 1..n {
            out.push(Node::chapter(
                i,
                1,
                Some(0),
                format!("Ch{}", i),
                format!("https://a/{}", i),
            ));
        }
        out
    }

    fn counted_run(node_count: usize, workers: usize) {
        let list = nodes(node_count);
        let counters: Vec<AtomicUsize> = (0..node_count).map(|_| AtomicUsize::new(0)).collect();
        run(
            &list,
            workers,
            |node| {
                counters[node.index].fetch_add(1, Ordering::SeqCst);
                if node.is_volume() {
                    volume_content(node)
                } else {
                    failed_content(node)
                }
            },
            None,
        );
        for (node, counter) in list.iter().zip(&counters) {
            assert!(node.is_done(), "node {} not done", node.index);
            assert_eq!(counter.load(Ordering::SeqCst), 1, "node {}", node.index);
        }
    }

    #[test]
    fn every_node_runs_once_for_any_worker_count() {
        for workers in [0, 1, 2, 3, 8, 32] {
            counted_run(40, workers);
        }
    }

    #[test]
    fn empty_list_returns_immediately() {
        counted_run(0, 4);
        let calls = AtomicUsize::new(0);
        let progress = |_: usize, _: usize| {
            calls.fetch_add(1, Ordering::SeqCst);
        };
        run(&[], 4, volume_content, Some(&progress));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn progress_reaches_total() {
        let list = nodes(10);
        let calls = AtomicUsize::new(0);
        let max_seen = AtomicUsize::new(0);
        let progress = |done: usize, total: usize| {
            assert_eq!(total, 10);
            calls.fetch_add(1, Ordering::SeqCst);
            max_seen.fetch_max(done, Ordering::SeqCst);
        };
        run(&list, 3, volume_content, Some(&progress));
        assert_eq!(calls.load(Ordering::SeqCst), 10);
        assert_eq!(max_seen.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn placeholders_carry_title_and_locator() {
        let node = Node::chapter(1, 0, None, "A & B".into(), "https://a/1?x=1&y=2".into());
        let failed = failed_content(&node);
        assert_eq!(failed.status, ContentStatus::Failed);
        assert!(failed.html.contains("<h1>A &amp; B</h1>"));
        assert!(failed.html.contains("<p>https://a/1?x=1&amp;y=2</p>"));
        assert_eq!(
            failed.text,
            "A & B\nChapter download failed\nhttps://a/1?x=1&y=2\n"
        );
        let volume = volume_content(&Node::volume(0, 0, None, "卷一".into()));
        assert_eq!(volume.html, "<h1>卷一</h1>\n");
        assert_eq!(volume.text, "卷一\n");
    }
}
