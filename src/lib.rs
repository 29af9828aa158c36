//! esjscrape: CLI downloader for ESJ Zone light novels, outputting EPUB, text, Markdown, or JSON.

pub mod cli;
pub mod config;
pub mod convert;
pub mod epub;
pub mod formats;
pub mod logging;
pub mod model;
pub mod scraper;
pub mod toc;

// Re-exports for CLI and consumers.
pub use convert::{ScriptConversion, ScriptConvert};
pub use epub::{write_epub, EpubError, EpubOptions, EpubVersion};
pub use formats::{write_json, write_markdown, write_text, FormatError, OutputFormat};
pub use model::{Book, BookMeta, ContentStatus, DownloadSummary, Node, NodeKind};
pub use scraper::{
    ChapterSelection, EsjScraper, Fetch, ImageStore, PoliteClient, PoliteClientBuilder,
    ScrapeOptions, ScrapeOutcome, ScrapedBook, ScraperError,
};
pub use toc::{Toc, TocEntry, TocOptions};
