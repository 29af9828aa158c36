//! Scraping: transport, chapter-list parsing, content normalization, image store,
//! download scheduling, and the ESJ Zone adapter.

mod client;
mod error;

pub mod download;
pub mod esjzone;
pub mod images;
pub mod normalize;
pub mod selection;
pub mod tree;

pub use client::{
    Fetch, Fetched, PoliteClient, PoliteClientBuilder, DEFAULT_BACKOFF_SECS, DEFAULT_RETRY_COUNT,
};
pub use download::{ProgressFn, DEFAULT_WORKERS};
pub use error::ScraperError;
pub use esjzone::{BookListing, CoverImage, EsjScraper, ScrapeOutcome, ScrapedBook};
pub use images::{ImageEntry, ImageRef, ImageStore};
pub use selection::ChapterSelection;

use crate::model::BookMeta;
use reqwest::Url;

/// Decides from the detail page metadata whether the existing output is current.
pub type UpToDateFn<'a> = &'a dyn Fn(&BookMeta) -> bool;

/// Resolve `href` against `base`. Absolute hrefs are kept; blank hrefs resolve to "".
pub fn resolve_url(base: &Url, href: &str) -> String {
    let href = href.trim();
    if href.is_empty() {
        return String::new();
    }
    match Url::parse(href) {
        Ok(url) => url.to_string(),
        Err(_) => base
            .join(href)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| href.to_string()),
    }
}

/// Options for a scrape run: worker count, chapter selection, listing mode, progress
/// callback, and the up-to-date check.
pub struct ScrapeOptions<'a> {
    /// Download threads; values below 1 mean 1.
    pub workers: usize,
    pub selection: Option<ChapterSelection>,
    /// Parse the chapter list only; download nothing.
    pub list_only: bool,
    pub progress: Option<ProgressFn<'a>>,
    /// When it returns true the book is not downloaded.
    pub up_to_date: Option<UpToDateFn<'a>>,
}

impl Default for ScrapeOptions<'_> {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            selection: None,
            list_only: false,
            progress: None,
            up_to_date: None,
        }
    }
}
