//! ESJ Zone adapter. Fetches the book detail page (metadata + chapter list), then every
//! chapter through the download scheduler; produces a populated [Book].
//!
//! Login is cookie-based; the cookie is passed through the transport verbatim.

use crate::convert::ScriptConvert;
use crate::model::{Book, BookMeta, ContentStatus, DownloadSummary, Node, NodeContent};
use crate::scraper::client::Fetch;
use crate::scraper::download::{self, failed_content, skipped_content, volume_content};
use crate::scraper::error::ScraperError;
use crate::scraper::images::{detect_image_type, ImageStore, ImageType};
use crate::scraper::normalize::{
    plain_text_with_store, ContentNormalizer, EMPTY_PLACEHOLDER, GATED_PLACEHOLDER,
};
use crate::scraper::selection::apply_selection;
use crate::scraper::tree::{ParsedTree, TreeParser};
use crate::scraper::{resolve_url, ScrapeOptions};
use regex::Regex;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use std::sync::LazyLock;
use tracing::{debug, info, warn};

const ESJ_HOSTS: [&str; 2] = ["esjzone.cc", "esjzone.me"];
const GATED_NOTICE: &str = "This chapter is password protected and was skipped.";
const EMPTY_NOTICE: &str = "[empty]";

static DATE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d{4}-\d{2}-\d{2}").unwrap());
static TOTAL_PAGES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"total:\s*(\d+)").unwrap());

/// Parse a CSS selector or return a parse error (avoids panics from Selector::parse).
fn parse_selector(sel: &str) -> Result<Selector, ScraperError> {
    Selector::parse(sel).map_err(|e| ScraperError::Selector {
        selector: sel.to_string(),
        reason: e.to_string(),
    })
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse `url` and report whether it is on an ESJ Zone host.
fn parse_esj_url(url: &str) -> Result<(Url, bool), ScraperError> {
    let parsed = Url::parse(url.trim()).map_err(|e| ScraperError::InvalidUrl {
        input: url.to_string(),
        reason: e.to_string(),
    })?;
    let host = parsed.host_str().ok_or_else(|| ScraperError::InvalidUrl {
        input: url.to_string(),
        reason: "URL has no host".to_string(),
    })?;
    let known_host = ESJ_HOSTS
        .iter()
        .any(|h| host == *h || host.ends_with(&format!(".{}", h)));
    Ok((parsed, known_host))
}

/// Require an ESJ Zone book detail URL (`/detail/<id>.html`).
pub fn ensure_detail_url(url: &str) -> Result<Url, ScraperError> {
    let (parsed, known_host) = parse_esj_url(url)?;
    if !known_host || !parsed.path().starts_with("/detail/") {
        return Err(ScraperError::NotDetailUrl {
            url: url.to_string(),
        });
    }
    Ok(parsed)
}

/// Require an ESJ Zone book listing URL (`/list-NN/` or `/tags/<tag>/`).
///
/// The result is the listing's directory URL: a trailing `<page>.html` and the query
/// are dropped and the path always ends with `/`.
pub fn ensure_listing_url(url: &str) -> Result<Url, ScraperError> {
    let (mut parsed, known_host) = parse_esj_url(url)?;
    let path = parsed.path().to_string();
    if !known_host || !(path.starts_with("/list-") || path.starts_with("/tags/")) {
        return Err(ScraperError::NotListingUrl {
            url: url.to_string(),
        });
    }
    let mut dir = path;
    if dir.ends_with(".html") {
        if let Some(slash) = dir.rfind('/') {
            dir.truncate(slash + 1);
        }
    }
    if !dir.ends_with('/') {
        dir.push('/');
    }
    parsed.set_path(&dir);
    parsed.set_query(None);
    parsed.set_fragment(None);
    Ok(parsed)
}

/// Outcome of parsing one chapter page.
#[derive(Debug, PartialEq, Eq)]
pub enum ChapterPage {
    /// Normalized markup, `None` when nothing survived.
    Content(Option<String>),
    /// Password form instead of content.
    Gated,
    /// No content region on the page.
    Missing,
}

/// Cover image bytes fetched from the detail page.
#[derive(Debug, Clone)]
pub struct CoverImage {
    pub image_type: ImageType,
    pub bytes: Vec<u8>,
}

impl CoverImage {
    pub fn file_name(&self) -> String {
        format!("cover{}", self.image_type.extension())
    }
}

/// Detail page contents. The description stays raw until the book is downloaded.
#[derive(Debug)]
pub struct DetailPage {
    /// Metadata with `description` unset.
    pub meta: BookMeta,
    pub tree: ParsedTree,
    /// Outer markup of the description block.
    pub description_markup: Option<String>,
}

/// How far a scrape went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrapeOutcome {
    /// Every node was processed.
    Downloaded,
    /// Only the chapter list was parsed.
    Listed,
    /// The existing output already has this update; nothing was downloaded.
    Unchanged,
}

/// A scraped book with everything the writers need.
#[derive(Debug)]
pub struct ScrapedBook {
    pub book: Book,
    pub cover: Option<CoverImage>,
    pub summary: DownloadSummary,
    pub outcome: ScrapeOutcome,
}

/// Book detail URLs collected from a listing, in listing order without duplicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookListing {
    pub title: String,
    pub books: Vec<String>,
}

/// One page of a book listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingPage {
    pub title: Option<String>,
    /// Page count announced by the pager script; 0 when absent.
    pub pages: usize,
    pub books: Vec<String>,
}

/// ESJ Zone scraper. Borrows the shared transport, image store, and converter.
pub struct EsjScraper<'a> {
    fetcher: &'a dyn Fetch,
    images: &'a ImageStore,
    converter: &'a dyn ScriptConvert,
}

impl<'a> EsjScraper<'a> {
    pub fn new(
        fetcher: &'a dyn Fetch,
        images: &'a ImageStore,
        converter: &'a dyn ScriptConvert,
    ) -> Self {
        Self {
            fetcher,
            images,
            converter,
        }
    }

    fn normalizer<'b>(&'b self, base: &'b Url) -> ContentNormalizer<'b> {
        ContentNormalizer::new(self.fetcher, self.images, self.converter, base)
    }

    /// Extract metadata and the chapter tree from detail page HTML.
    ///
    /// A missing title means the session is not logged in; a missing chapter list is
    /// also terminal for the book. Nothing is fetched here.
    pub fn parse_detail_page(&self, html: &str, page_url: &Url) -> Result<DetailPage, ScraperError> {
        let doc = Html::parse_document(html);
        let title_sel = parse_selector("h2")?;
        let detail_sel = parse_selector("ul.book-detail")?;
        let link_sel = parse_selector("a")?;
        let cover_sel = parse_selector("div.product-gallery img[src]")?;
        let desc_sel = parse_selector("div.description")?;
        let list_sel = parse_selector("div#chapterList")?;

        let title = doc
            .select(&title_sel)
            .next()
            .map(|e| self.converter.convert(&element_text(e)))
            .ok_or_else(|| ScraperError::NotLoggedIn {
                url: page_url.to_string(),
            })?;
        let detail = doc.select(&detail_sel).next();
        let author = detail
            .and_then(|d| d.select(&link_sel).next())
            .map(|a| self.converter.convert(&element_text(a)))
            .unwrap_or_default();
        let last_updated = detail.and_then(|d| {
            let text: String = d.text().collect();
            DATE_RE
                .find_iter(&text)
                .last()
                .map(|m| m.as_str().to_string())
        });
        let cover_url = doc
            .select(&cover_sel)
            .next()
            .and_then(|img| img.value().attr("src"))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| resolve_url(page_url, s));
        let description_markup = doc.select(&desc_sel).next().map(|d| d.html());

        let list = doc
            .select(&list_sel)
            .next()
            .ok_or_else(|| ScraperError::ChapterListParse {
                reason: "div#chapterList not found".to_string(),
            })?;
        let tree = TreeParser::new(page_url, self.converter).parse_children(list);
        debug!(nodes = tree.nodes.len(), depth = tree.depth, "parsed chapter list");

        let meta = BookMeta {
            title,
            author,
            description: None,
            cover_url,
            last_updated,
            source_url: page_url.to_string(),
        };
        Ok(DetailPage {
            meta,
            tree,
            description_markup,
        })
    }

    /// Normalize description markup kept by [Self::parse_detail_page]. Downloads its images.
    pub fn normalize_description(
        &self,
        markup: &str,
        page_url: &Url,
    ) -> Result<String, ScraperError> {
        let fragment = Html::parse_fragment(markup);
        let desc_sel = parse_selector("div.description")?;
        let normalizer = self.normalizer(page_url);
        Ok(match fragment.select(&desc_sel).next() {
            Some(d) => normalizer.normalize_or_empty(d),
            None => normalizer.normalize_or_empty(fragment.root_element()),
        })
    }

    /// Extract the title, page count and book links from one listing page.
    pub fn parse_listing_page(
        &self,
        html: &str,
        page_url: &Url,
    ) -> Result<ListingPage, ScraperError> {
        let doc = Html::parse_document(html);
        let title_sel = parse_selector("h1")?;
        let script_sel = parse_selector("script")?;
        let card_sel = parse_selector("div.col-lg-3.col-md-4.col-sm-3.col-xs-6")?;
        let link_sel = parse_selector("a[href]")?;

        let title = doc
            .select(&title_sel)
            .next()
            .map(|h| self.converter.convert(&element_text(h)))
            .filter(|t| !t.is_empty());
        let pages = doc
            .select(&script_sel)
            .find_map(|s| {
                let code: String = s.text().collect();
                TOTAL_PAGES_RE
                    .captures(&code)
                    .and_then(|c| c.get(1))
                    .and_then(|m| m.as_str().parse::<usize>().ok())
            })
            .unwrap_or(0);
        let books = doc
            .select(&card_sel)
            .filter_map(|card| card.select(&link_sel).next())
            .filter_map(|a| a.value().attr("href"))
            .map(|href| resolve_url(page_url, href))
            .filter(|url| ensure_detail_url(url).is_ok())
            .collect();
        Ok(ListingPage {
            title,
            pages,
            books,
        })
    }

    /// Collect every book on a `/list-NN/` or `/tags/<tag>/` listing.
    ///
    /// The first page announces the page count; pages `1.html..=N.html` are then read in
    /// order. A listing without a pager yields the books on the first page. Unreachable
    /// later pages are logged and skipped.
    pub fn scrape_listing(&self, url: &str) -> Result<BookListing, ScraperError> {
        let listing_url = ensure_listing_url(url)?;
        let page = self
            .fetcher
            .fetch(listing_url.as_str())
            .map_err(|e| match e {
                ScraperError::HttpStatus { status, url, .. } => ScraperError::HttpStatus {
                    status,
                    url,
                    context: Some("listing page".to_string()),
                },
                other => other,
            })?;
        let first = self.parse_listing_page(&page.text(), &listing_url)?;
        let title = first.title.clone().unwrap_or_else(|| "Listing".to_string());
        info!(%title, pages = first.pages, "listing found");

        let mut seen = HashSet::new();
        let mut books = Vec::new();
        let mut collect = |urls: Vec<String>| {
            for url in urls {
                if seen.insert(url.clone()) {
                    books.push(url);
                }
            }
        };
        if first.pages == 0 {
            collect(first.books);
        }
        for number in 1..=first.pages {
            let page_url = listing_url
                .join(&format!("{}.html", number))
                .map_err(|e| ScraperError::InvalidUrl {
                    input: format!("{}{}.html", listing_url, number),
                    reason: e.to_string(),
                })?;
            let parsed = self
                .fetcher
                .fetch(page_url.as_str())
                .and_then(|f| self.parse_listing_page(&f.text(), &page_url));
            match parsed {
                Ok(p) => {
                    debug!(page = number, books = p.books.len(), "listing page parsed");
                    collect(p.books);
                }
                Err(e) => warn!(url = %page_url, error = %e, "listing page failed, skipped"),
            }
        }
        info!(%title, books = books.len(), "listing collected");
        Ok(BookListing { title, books })
    }

    /// Classify and normalize a chapter page.
    pub fn parse_chapter_page(
        &self,
        html: &str,
        page_url: &Url,
    ) -> Result<ChapterPage, ScraperError> {
        let doc = Html::parse_document(html);
        let region_sel = parse_selector("div.forum-content")?;
        let gate_sel = parse_selector("button.btn-send-pw")?;
        let Some(region) = doc.select(&region_sel).next() else {
            return Ok(ChapterPage::Missing);
        };
        if region.select(&gate_sel).next().is_some() {
            return Ok(ChapterPage::Gated);
        }
        Ok(ChapterPage::Content(self.normalizer(page_url).normalize(region)))
    }

    /// Download one chapter. Never fails: problems become placeholder content.
    pub fn download_chapter(&self, node: &Node) -> NodeContent {
        if node.source_url.is_empty() {
            warn!(title = %node.title, "chapter has no link");
            return failed_content(node);
        }
        let page_url = match Url::parse(&node.source_url) {
            Ok(u) => u,
            Err(e) => {
                warn!(url = %node.source_url, error = %e, "invalid chapter url");
                return failed_content(node);
            }
        };
        let fetched = match self.fetcher.fetch(&node.source_url) {
            Ok(f) => f,
            Err(e) => {
                warn!(
                    title = %node.title,
                    url = %node.source_url,
                    transport = e.is_transport(),
                    error = %e,
                    "chapter download failed"
                );
                return failed_content(node);
            }
        };
        let page = match self.parse_chapter_page(&fetched.text(), &page_url) {
            Ok(p) => p,
            Err(e) => {
                warn!(url = %node.source_url, error = %e, "chapter parse failed");
                return failed_content(node);
            }
        };
        match page {
            ChapterPage::Missing => {
                warn!(title = %node.title, url = %node.source_url, "chapter content not found");
                failed_content(node)
            }
            ChapterPage::Gated => {
                warn!(title = %node.title, "chapter requires a password, skipped");
                NodeContent {
                    status: ContentStatus::Gated,
                    html: GATED_PLACEHOLDER.to_string(),
                    text: format!("{}\n{}\n", node.title, GATED_NOTICE),
                }
            }
            ChapterPage::Content(None) => {
                warn!(title = %node.title, "chapter is empty");
                NodeContent {
                    status: ContentStatus::Empty,
                    html: EMPTY_PLACEHOLDER.to_string(),
                    text: format!("{}\n{}\n", node.title, EMPTY_NOTICE),
                }
            }
            ChapterPage::Content(Some(html)) => {
                let text = format!(
                    "{}\n{}",
                    node.title,
                    plain_text_with_store(&html, self.images)
                );
                NodeContent {
                    status: ContentStatus::Ok,
                    html,
                    text,
                }
            }
        }
    }

    /// Work function for the scheduler.
    pub fn process_node(&self, node: &Node) -> NodeContent {
        if node.is_volume() {
            volume_content(node)
        } else if !node.selected {
            skipped_content()
        } else {
            self.download_chapter(node)
        }
    }

    /// Fetch and sniff the cover image. Failures are logged and yield `None`.
    pub fn fetch_cover(&self, url: &str) -> Option<CoverImage> {
        let fetched = match self.fetcher.fetch(url) {
            Ok(f) => f,
            Err(e) => {
                warn!(url, error = %e, "cover download failed");
                return None;
            }
        };
        match detect_image_type(fetched.content_type.as_deref(), &fetched.bytes) {
            Some(image_type) => Some(CoverImage {
                image_type,
                bytes: fetched.bytes,
            }),
            None => {
                warn!(url, "cover is not a recognized image");
                None
            }
        }
    }

    /// Scrape a book from its detail page URL.
    ///
    /// Only book-level problems (bad URL, unreachable detail page, not logged in, no
    /// chapter list) are errors. Chapter and image failures end up in the summary.
    /// Listing mode and an up-to-date book stop after the detail page: no description
    /// image, cover, or chapter is fetched.
    pub fn scrape_book(
        &self,
        url: &str,
        options: &ScrapeOptions<'_>,
    ) -> Result<ScrapedBook, ScraperError> {
        let detail_url = ensure_detail_url(url)?;
        let page = self
            .fetcher
            .fetch(detail_url.as_str())
            .map_err(|e| match e {
                ScraperError::HttpStatus { status, url, .. } => ScraperError::HttpStatus {
                    status,
                    url,
                    context: Some("detail page".to_string()),
                },
                other => other,
            })?;
        let detail = self.parse_detail_page(&page.text(), &detail_url)?;
        let mut book = Book {
            meta: detail.meta,
            nodes: detail.tree.nodes,
            depth: detail.tree.depth,
        };
        info!(title = %book.meta.title, author = %book.meta.author, chapters = book.chapters().count(), "book found");

        if let Some(selection) = &options.selection {
            let ignored = apply_selection(&mut book.nodes, selection);
            if ignored > 0 {
                warn!(ignored, "selected chapter numbers out of range were ignored");
            }
        }

        if options.list_only {
            return Ok(ScrapedBook {
                book,
                cover: None,
                summary: DownloadSummary::default(),
                outcome: ScrapeOutcome::Listed,
            });
        }
        if options.up_to_date.is_some_and(|current| current(&book.meta)) {
            info!(title = %book.meta.title, last_updated = ?book.meta.last_updated, "existing output is up to date, skipped");
            return Ok(ScrapedBook {
                book,
                cover: None,
                summary: DownloadSummary::default(),
                outcome: ScrapeOutcome::Unchanged,
            });
        }

        if let Some(markup) = &detail.description_markup {
            book.meta.description = Some(self.normalize_description(markup, &detail_url)?);
        }

        let cover = book
            .meta
            .cover_url
            .as_deref()
            .and_then(|u| self.fetch_cover(u));

        download::run(
            &book.nodes,
            options.workers,
            |node| self.process_node(node),
            options.progress,
        );

        let summary = DownloadSummary::from_nodes(&book.nodes);
        info!(
            total = summary.total,
            failed = summary.failed,
            gated = summary.gated,
            empty = summary.empty,
            skipped = summary.skipped,
            images = self.images.len(),
            "download finished"
        );
        for (title, locator) in &summary.failed_chapters {
            warn!(%title, url = %locator, "failed chapter");
        }
        Ok(ScrapedBook {
            book,
            cover,
            summary,
            outcome: ScrapeOutcome::Downloaded,
        })
    }
}
