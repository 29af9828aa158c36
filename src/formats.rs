//! Single-file output formats: JSON, Markdown, and plain text.
//! Consumes a scraped Book (and its table of contents) and writes one file per format.

use crate::model::{Book, ContentStatus, Node};
use crate::scraper::normalize::plain_text_with_store;
use crate::scraper::ImageStore;
use crate::toc::Toc;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// Output format selector for the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Epub,
    Json,
    Markdown,
    Text,
}

/// Errors from the format writers (JSON, Markdown, text).
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("Cannot write: book title is empty.")]
    EmptyTitle,

    #[error("Failed to write output: {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write output: {0}")]
    Write(#[from] std::io::Error),

    #[error("Failed to write JSON: {0}")]
    Json(#[from] serde_json::Error),
}

fn validate_book(book: &Book) -> Result<(), FormatError> {
    if book.meta.title.trim().is_empty() {
        return Err(FormatError::EmptyTitle);
    }
    Ok(())
}

fn create(path: &Path) -> Result<BufWriter<File>, FormatError> {
    File::create(path)
        .map(BufWriter::new)
        .map_err(|e| FormatError::Io {
            path: path.to_path_buf(),
            source: e,
        })
}

/// Nodes in reading order, as retained by the table of contents.
fn reading_order<'a>(book: &'a Book, toc: &Toc) -> impl Iterator<Item = &'a Node> {
    toc.spine()
        .into_iter()
        .filter_map(move |index| book.nodes.get(index))
}

/// Drop a leading `<h1>...</h1>` that duplicates the node title.
fn strip_leading_heading(html: &str) -> &str {
    if html.starts_with("<h1>") {
        if let Some(end) = html.find("</h1>") {
            return html[end + "</h1>".len()..].trim_start();
        }
    }
    html
}

/// Write the scraped book (metadata, nodes with content) as pretty JSON.
pub fn write_json(book: &Book, path: &Path) -> Result<(), FormatError> {
    let mut f = create(path)?;
    serde_json::to_writer_pretty(&mut f, book)?;
    writeln!(f)?;
    f.flush()?;
    Ok(())
}

/// Write a single Markdown file: title, author, description, then one heading per node
/// (nested by level) with the chapter body converted to Markdown. Images link to their
/// original URL.
pub fn write_markdown(
    book: &Book,
    toc: &Toc,
    images: &ImageStore,
    path: &Path,
) -> Result<(), FormatError> {
    validate_book(book)?;
    let mut f = create(path)?;
    let meta = &book.meta;

    writeln!(f, "# {}", meta.title)?;
    writeln!(f)?;
    if !meta.author.is_empty() {
        writeln!(f, "By {}", meta.author)?;
        writeln!(f)?;
    }
    if let Some(date) = &meta.last_updated {
        writeln!(f, "Last updated: {}", date)?;
        writeln!(f)?;
    }
    if let Some(description) = &meta.description {
        let html = images.rewrite_tokens(description, |e| e.original_url.clone());
        writeln!(f, "{}", html2md::parse_html(&html).trim())?;
        writeln!(f)?;
    }
    writeln!(f, "---")?;
    writeln!(f)?;

    for node in reading_order(book, toc) {
        let hashes = "#".repeat((node.level as usize + 2).min(6));
        writeln!(f, "{} {}", hashes, node.title)?;
        writeln!(f)?;
        let Some(content) = node.content() else {
            continue;
        };
        if matches!(content.status, ContentStatus::Volume | ContentStatus::Skipped) {
            continue;
        }
        let html = images.rewrite_tokens(strip_leading_heading(&content.html), |e| {
            e.original_url.clone()
        });
        writeln!(f, "{}", html2md::parse_html(&html).trim())?;
        writeln!(f)?;
    }
    f.flush()?;
    Ok(())
}

/// Write a single plain-text file: title block, description, then every node's text in
/// reading order. Images appear as their original URL.
pub fn write_text(
    book: &Book,
    toc: &Toc,
    images: &ImageStore,
    path: &Path,
) -> Result<(), FormatError> {
    validate_book(book)?;
    let mut f = create(path)?;
    let meta = &book.meta;

    writeln!(f, "{}", meta.title)?;
    if !meta.author.is_empty() {
        writeln!(f, "{}", meta.author)?;
    }
    if let Some(date) = &meta.last_updated {
        writeln!(f, "{}", date)?;
    }
    writeln!(f)?;
    if let Some(description) = &meta.description {
        writeln!(f, "Description")?;
        f.write_all(plain_text_with_store(description, images).as_bytes())?;
        writeln!(f)?;
    }
    for node in reading_order(book, toc) {
        match node.content() {
            Some(content) if !content.text.is_empty() => f.write_all(content.text.as_bytes())?,
            _ => writeln!(f, "{}", node.title)?,
        }
    }
    f.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BookMeta, NodeContent};
    use crate::scraper::testing::MockFetcher;
    use crate::toc::{self, TocOptions};
    use std::error::Error;

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\nimg";

    fn finish(node: &Node, status: ContentStatus, html: &str, text: &str) {
        node.try_claim();
        node.complete(NodeContent {
            status,
            html: html.to_string(),
            text: text.to_string(),
        });
    }

    fn sample(images: &ImageStore) -> (Book, Toc) {
        let fetcher = MockFetcher::new().with("https://img.test/p.png", None, PNG);
        let image = images.resolve(&fetcher, "https://img.test/p.png").to_markup();
        let nodes = vec![
            Node::volume(0, 0, None, "Vol 1".into()),
            Node::chapter(1, 1, Some(0), "Chapter One".into(), "https://a/1".into()),
            Node::chapter(2, 1, Some(0), "Chapter Two".into(), "https://a/2".into()),
        ];
        finish(&nodes[0], ContentStatus::Volume, "<h1>Vol 1</h1>\n", "Vol 1\n");
        finish(
            &nodes[1],
            ContentStatus::Ok,
            &format!("<p>First paragraph.</p>\n{}\n", image),
            "Chapter One\nFirst paragraph.\nhttps://img.test/p.png\n",
        );
        finish(&nodes[2], ContentStatus::Skipped, "", "");
        let book = Book {
            meta: BookMeta {
                title: "Test Book".into(),
                author: "Test Author".into(),
                description: Some("<p>A test.</p>\n".into()),
                cover_url: None,
                last_updated: None,
                source_url: "https://www.esjzone.cc/detail/1.html".into(),
            },
            nodes,
            depth: 1,
        };
        let toc = toc::build(&book.nodes, book.depth, TocOptions { prune: true });
        (book, toc)
    }

    #[test]
    fn write_markdown_nests_headings_and_links_images() -> Result<(), Box<dyn Error>> {
        let images = ImageStore::new();
        let (book, toc) = sample(&images);
        let path = std::env::temp_dir().join("esjscrape_test_md.md");
        write_markdown(&book, &toc, &images, &path)?;
        let buf = std::fs::read_to_string(&path)?;
        std::fs::remove_file(&path).ok();
        assert!(buf.starts_with("# Test Book"));
        assert!(buf.contains("## Vol 1"));
        assert!(buf.contains("### Chapter One"));
        assert!(buf.contains("First paragraph."));
        assert!(buf.contains("https://img.test/p.png"));
        assert!(!buf.contains("Chapter Two"));
        assert!(!buf.contains("<p>"));
        assert!(!buf.contains("esj-image:"));
        Ok(())
    }

    #[test]
    fn write_text_follows_reading_order() -> Result<(), Box<dyn Error>> {
        let images = ImageStore::new();
        let (book, toc) = sample(&images);
        let path = std::env::temp_dir().join("esjscrape_test_txt.txt");
        write_text(&book, &toc, &images, &path)?;
        let buf = std::fs::read_to_string(&path)?;
        std::fs::remove_file(&path).ok();
        assert_eq!(
            buf,
            "Test Book\nTest Author\n\nDescription\nA test.\n\nVol 1\nChapter One\nFirst paragraph.\nhttps://img.test/p.png\n"
        );
        Ok(())
    }

    #[test]
    fn write_json_includes_nodes_and_content() -> Result<(), Box<dyn Error>> {
        let images = ImageStore::new();
        let (book, _) = sample(&images);
        let path = std::env::temp_dir().join("esjscrape_test_json.json");
        write_json(&book, &path)?;
        let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        std::fs::remove_file(&path).ok();
        assert_eq!(value["title"].as_str(), Some("Test Book"));
        assert_eq!(value["nodes"][1]["content"]["status"].as_str(), Some("ok"));
        assert_eq!(value["nodes"][2]["content"]["status"].as_str(), Some("skipped"));
        Ok(())
    }

    #[test]
    fn validate_rejects_empty_title() {
        let images = ImageStore::new();
        let (mut book, toc) = sample(&images);
        book.meta.title.clear();
        let path = std::env::temp_dir().join("esjscrape_void.txt");
        assert!(matches!(
            write_text(&book, &toc, &images, &path),
            Err(FormatError::EmptyTitle)
        ));
    }

    #[test]
    fn strip_leading_heading_only_removes_first_h1() {
        assert_eq!(
            strip_leading_heading("<h1>T</h1>\n<p>x</p>"),
            "<p>x</p>"
        );
        assert_eq!(strip_leading_heading("<p>x</p>"), "<p>x</p>");
    }
}
