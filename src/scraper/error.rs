//! Shared error type for scraping: URL validation, transport, and book-structure errors.
//!
//! Only book-level failures propagate out of a scrape. Per-chapter and per-image
//! transport errors are absorbed into placeholders by the downloader.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScraperError {
    #[error("Invalid URL: {input}: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("Expected a book detail URL (e.g. https://www.esjzone.cc/detail/1557379934.html), got {url}")]
    NotDetailUrl { url: String },

    #[error("Expected a book listing URL (e.g. https://www.esjzone.cc/list-01/ or https://www.esjzone.cc/tags/R18/), got {url}")]
    NotListingUrl { url: String },

    // Transport
    #[error("Failed to create HTTP client: {reason}")]
    ClientBuild { reason: String },

    #[error("Network error: could not reach {url}: {source}")]
    Network { url: String, source: reqwest::Error },

    #[error("HTTP {status} when fetching: {url}")]
    HttpStatus {
        status: u16,
        url: String,
        /// Optional context (e.g. "detail page", "image") for programmatic use.
        context: Option<String>,
    },

    #[error("Failed to read response body from {url}: {source}")]
    BodyRead { url: String, source: reqwest::Error },

    // Book structure
    #[error("Book page at {url} has no title. The cookie is probably invalid or not logged in (cookies are not shared between esjzone.cc and esjzone.me).")]
    NotLoggedIn { url: String },

    #[error("Could not find the chapter list on the book page: {reason}")]
    ChapterListParse { reason: String },

    #[error("Invalid selector {selector:?}: {reason}")]
    Selector { selector: String, reason: String },
}

impl ScraperError {
    /// True for errors produced by the transport layer (fetch, status, body).
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ScraperError::Network { .. }
                | ScraperError::HttpStatus { .. }
                | ScraperError::BodyRead { .. }
        )
    }
}
