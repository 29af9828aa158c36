//! CLI parsing and orchestration. Parses args, runs scrape -> EPUB, JSON, Markdown, or text
//! for one book or every book of a listing. Maps errors to exit codes.

use crate::config::{self, Config};
use crate::convert::ScriptConversion;
use crate::epub::{read_last_change, write_epub, EpubError, EpubOptions, EpubVersion};
use crate::formats::{write_json, write_markdown, write_text, FormatError, OutputFormat};
use crate::model::{BookMeta, DownloadSummary};
use crate::scraper::esjzone::{ensure_detail_url, ensure_listing_url};
use crate::scraper::selection::format_listing;
use crate::scraper::{
    ChapterSelection, EsjScraper, ImageStore, PoliteClient, ProgressFn, ScrapeOptions,
    ScrapeOutcome, ScraperError, UpToDateFn, DEFAULT_BACKOFF_SECS, DEFAULT_RETRY_COUNT,
    DEFAULT_WORKERS,
};
use crate::toc::{self, TocOptions};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Cookie file picked up from the current directory when none is configured.
const DEFAULT_COOKIE_FILE: &str = "esj.txt";
const DEFAULT_TIMEOUT_SECS: u64 = 25;
const MAX_TITLE_CHARS: usize = 48;
const MAX_AUTHOR_CHARS: usize = 16;

/// CLI error carrying exit code and message.
#[derive(Debug, Error)]
pub enum CliRunError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    Scraper(#[from] ScraperError),

    #[error("{0}")]
    Epub(#[from] EpubError),

    #[error("{0}")]
    Format(#[from] FormatError),

    #[error("{0}")]
    Validation(String),
}

impl CliRunError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliRunError::InvalidInput(_) => 1,
            CliRunError::Scraper(_) => 2,
            CliRunError::Epub(_) | CliRunError::Format(_) | CliRunError::Validation(_) => 3,
        }
    }
}

/// Run epubcheck on the given EPUB path. Requires epubcheck on PATH.
fn validate_epub(path: &Path) -> Result<(), CliRunError> {
    let output = std::process::Command::new("epubcheck")
        .arg(path)
        .output()
        .map_err(|e| {
            CliRunError::Validation(format!(
                "Could not run epubcheck: {}. Is epubcheck installed and on PATH?",
                e
            ))
        })?;
    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let msg = if stderr.is_empty() { stdout } else { stderr };
        Err(CliRunError::Validation(format!(
            "epubcheck reported errors:\n{}",
            msg.trim()
        )))
    }
}

#[derive(Parser, Debug)]
#[command(name = "esjscrape")]
#[command(about = "Download a light novel from ESJ Zone and write EPUB or text")]
#[command(
    after_help = "Config file keys (output_dir, user_agent, request_delay_ms, timeout_secs, retry_count, retry_backoff_secs, threads, cookie_file, conversion, toc_page) are read from ./esjscrape.toml or the user config dir. CLI flags override config."
)]
pub struct Args {
    /// Book detail URL (https://www.esjzone.cc/detail/1557379934.html) or listing URL
    /// (https://www.esjzone.cc/list-01/, https://www.esjzone.cc/tags/R18/) to download every book.
    pub url: String,

    /// Output path. Default: ./《title》author.{ext} where ext depends on --format.
    /// For a listing URL this is the output directory.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Output format: epub, json, markdown, or text.
    #[arg(long, default_value = "epub", value_parser = parse_format)]
    pub format: OutputFormat,

    /// Generate EPUB 2 instead of EPUB 3 (only when format is epub).
    #[arg(long)]
    pub epub_2: bool,

    /// Include toc.ncx in EPUB 3 output for legacy readers (no effect for EPUB 2, which always includes NCX).
    #[arg(long)]
    pub ncx: bool,

    /// Suppress progress output (warnings and errors only).
    #[arg(short, long)]
    pub quiet: bool,

    /// Debug logging and verbose error chain.
    #[arg(long)]
    pub verbose: bool,

    /// Download threads (overrides config; default 4).
    #[arg(long)]
    pub threads: Option<usize>,

    /// Download only these chapters (0-based), e.g. 3-9 or 0,4,7. See --list-chapters.
    #[arg(long, value_parser = ChapterSelection::parse)]
    pub chapters: Option<ChapterSelection>,

    /// Print the numbered chapter list and exit without downloading.
    #[arg(long)]
    pub list_chapters: bool,

    /// Script conversion: t2s (traditional to simplified, default), s2t, or none.
    #[arg(long, value_parser = parse_conversion)]
    pub conversion: Option<ScriptConversion>,

    /// File holding the raw Cookie header of a logged-in session (default ./esj.txt when present).
    #[arg(long)]
    pub cookie_file: Option<PathBuf>,

    /// HTTP User-Agent (overrides config).
    #[arg(long)]
    pub user_agent: Option<String>,

    /// Delay between requests in milliseconds (overrides config; default 0).
    #[arg(long)]
    pub delay: Option<u64>,

    /// Request timeout in seconds (overrides config; default 25).
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Keep unselected chapters and volumes without content in the table of contents.
    #[arg(long)]
    pub unfiltered_toc: bool,

    /// After writing an EPUB, run epubcheck to validate it (epubcheck must be on PATH). No effect for non-EPUB output.
    #[arg(long)]
    pub validate: bool,

    /// Skip a book whose existing EPUB records the same last-update date. Always on for listing URLs.
    #[arg(long)]
    pub skip_unchanged: bool,
}

/// What the positional URL points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Book,
    Listing,
}

fn classify_url(url: &str) -> Result<Target, CliRunError> {
    if ensure_detail_url(url).is_ok() {
        return Ok(Target::Book);
    }
    match ensure_listing_url(url) {
        Ok(_) => Ok(Target::Listing),
        Err(e @ ScraperError::InvalidUrl { .. }) => Err(CliRunError::InvalidInput(e.to_string())),
        Err(_) => Err(CliRunError::InvalidInput(format!(
            "Expected a book detail URL (e.g. https://www.esjzone.cc/detail/1557379934.html) or a listing URL (e.g. https://www.esjzone.cc/list-01/), got {}",
            url
        ))),
    }
}

fn parse_format(s: &str) -> Result<OutputFormat, String> {
    match s.to_lowercase().as_str() {
        "epub" => Ok(OutputFormat::Epub),
        "json" => Ok(OutputFormat::Json),
        "markdown" | "md" => Ok(OutputFormat::Markdown),
        "text" | "txt" => Ok(OutputFormat::Text),
        _ => Err(format!(
            "Invalid --format value: '{}'. Use epub, json, markdown, or text.",
            s
        )),
    }
}

fn parse_conversion(s: &str) -> Result<ScriptConversion, String> {
    match s.to_lowercase().as_str() {
        "t2s" => Ok(ScriptConversion::ToSimplified),
        "s2t" => Ok(ScriptConversion::ToTraditional),
        "none" | "off" => Ok(ScriptConversion::Off),
        _ => Err(format!(
            "Invalid conversion value: '{}'. Use t2s, s2t, or none.",
            s
        )),
    }
}

fn extension_for_format(format: OutputFormat) -> &'static str {
    match format {
        OutputFormat::Epub => "epub",
        OutputFormat::Json => "json",
        OutputFormat::Markdown => "md",
        OutputFormat::Text => "txt",
    }
}

/// Strip characters that are invalid in file names on common filesystems.
fn sanitize_component(s: &str) -> String {
    s.chars()
        .filter(|c| !matches!(c, '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .collect::<String>()
        .trim()
        .to_string()
}

/// Keep at most `max` chars; longer input is cut to `max - 1` chars plus `…`.
fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max - 1).collect();
    out.push('…');
    out
}

/// Default output file name: `《title》author[_chapters<min>-<max>].ext`.
fn default_file_name(
    title: &str,
    author: &str,
    selection: Option<&ChapterSelection>,
    format: OutputFormat,
) -> String {
    let title = truncate_chars(&sanitize_component(title), MAX_TITLE_CHARS);
    let author = truncate_chars(&sanitize_component(author), MAX_AUTHOR_CHARS);
    let suffix = selection
        .and_then(ChapterSelection::bounds)
        .map(|(min, max)| format!("_chapters{}-{}", min, max))
        .unwrap_or_default();
    format!(
        "《{}》{}{}.{}",
        title,
        author,
        suffix,
        extension_for_format(format)
    )
}

/// Explicit output file, else `dir` joined with the default name for `meta`.
fn output_path_for(
    dir: &Path,
    file: Option<&Path>,
    meta: &BookMeta,
    selection: Option<&ChapterSelection>,
    format: OutputFormat,
) -> PathBuf {
    match file {
        Some(p) => p.to_path_buf(),
        None => dir.join(default_file_name(
            &meta.title,
            &meta.author,
            selection,
            format,
        )),
    }
}

/// True when the EPUB at `path` records the same last-update date as `meta`.
/// Books without a date are never current.
fn existing_output_is_current(path: &Path, meta: &BookMeta) -> bool {
    match meta.last_updated.as_deref().map(str::trim) {
        Some(date) if !date.is_empty() => read_last_change(path).as_deref() == Some(date),
        _ => false,
    }
}

/// Ensure output path parent exists and is writable; return path.
fn validate_output_path(path: &Path) -> Result<(), CliRunError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            return Err(CliRunError::InvalidInput(format!(
                "Cannot write output: {}: parent directory does not exist.",
                path.display()
            )));
        }
    }
    Ok(())
}

/// Read a cookie header from `path`, trimmed. An empty file means no cookie.
fn read_cookie(path: &Path) -> Result<Option<String>, CliRunError> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        CliRunError::InvalidInput(format!("Cannot read cookie file {}: {}", path.display(), e))
    })?;
    let cookie = raw.trim();
    Ok((!cookie.is_empty()).then(|| cookie.to_string()))
}

/// Effective run settings after layering flags over config over defaults.
#[derive(Debug, PartialEq, Eq)]
struct Settings {
    output_dir: PathBuf,
    user_agent: Option<String>,
    delay_ms: u64,
    timeout_secs: u64,
    retry_count: u32,
    retry_backoff_secs: Vec<u64>,
    threads: usize,
    cookie_file: Option<PathBuf>,
    conversion: ScriptConversion,
    toc_page: bool,
}

impl Settings {
    fn resolve(args: &Args, config: Option<&Config>) -> Result<Self, CliRunError> {
        let conversion = match (args.conversion, config.and_then(|c| c.conversion.as_deref())) {
            (Some(c), _) => c,
            (None, Some(s)) => parse_conversion(s).map_err(CliRunError::InvalidInput)?,
            (None, None) => ScriptConversion::default(),
        };
        let cookie_file = args
            .cookie_file
            .clone()
            .or_else(|| config.and_then(|c| c.cookie_file.clone()))
            .or_else(|| {
                let local = PathBuf::from(DEFAULT_COOKIE_FILE);
                local.is_file().then_some(local)
            });
        Ok(Self {
            output_dir: config
                .and_then(|c| c.output_dir.clone())
                .unwrap_or_else(|| PathBuf::from(".")),
            user_agent: args
                .user_agent
                .clone()
                .or_else(|| config.and_then(|c| c.user_agent.clone())),
            delay_ms: args
                .delay
                .or_else(|| config.and_then(|c| c.request_delay_ms))
                .unwrap_or(0),
            timeout_secs: args
                .timeout
                .or_else(|| config.and_then(|c| c.timeout_secs))
                .unwrap_or(DEFAULT_TIMEOUT_SECS),
            retry_count: config
                .and_then(|c| c.retry_count)
                .unwrap_or(DEFAULT_RETRY_COUNT)
                .max(1),
            retry_backoff_secs: config
                .and_then(|c| c.retry_backoff_secs.clone())
                .unwrap_or_else(|| vec![DEFAULT_BACKOFF_SECS]),
            threads: args
                .threads
                .or_else(|| config.and_then(|c| c.threads))
                .unwrap_or(DEFAULT_WORKERS)
                .max(1),
            cookie_file,
            conversion,
            toc_page: config.and_then(|c| c.toc_page).unwrap_or(true),
        })
    }
}

fn new_progress_bar(total: u64) -> ProgressBar {
    let bar = ProgressBar::new(total);
    match ProgressStyle::default_bar().template("{spinner} {msg} [{bar:40}] {pos}/{len} ({elapsed})")
    {
        Ok(style) => bar.set_style(
            style
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
                .progress_chars("█▉▊▋▌▍▎▏ "),
        ),
        Err(e) => debug!(error = %e, "invalid progress template, using default style"),
    }
    bar.enable_steady_tick(Duration::from_millis(80));
    bar
}

fn print_summary(summary: &DownloadSummary, images: usize) {
    eprintln!(
        "Chapters: {} downloaded, {} failed, {} password protected, {} empty, {} skipped. Images: {}.",
        summary.total - summary.failed - summary.gated - summary.empty,
        summary.failed,
        summary.gated,
        summary.empty,
        summary.skipped,
        images
    );
    if !summary.failed_chapters.is_empty() {
        eprintln!("Failed chapters:");
        for (title, url) in &summary.failed_chapters {
            eprintln!("  {} ({})", title, url);
        }
    }
}

fn build_client(settings: &Settings) -> Result<PoliteClient, CliRunError> {
    let mut builder = PoliteClient::builder()
        .delay_millis(settings.delay_ms)
        .timeout_secs(settings.timeout_secs)
        .retry_count(settings.retry_count)
        .retry_backoff_secs(settings.retry_backoff_secs.clone());
    if let Some(ua) = &settings.user_agent {
        builder = builder.user_agent(ua.clone());
    }
    if let Some(path) = &settings.cookie_file {
        match read_cookie(path)? {
            Some(cookie) => {
                info!(path = %path.display(), "using cookie file");
                builder = builder.cookie(cookie);
            }
            None => debug!(path = %path.display(), "cookie file is empty"),
        }
    }
    builder
        .build()
        .map_err(|e| CliRunError::InvalidInput(format!("Failed to create HTTP client: {}", e)))
}

/// Where one book's output goes.
struct BookTarget<'p> {
    dir: &'p Path,
    /// Explicit output file; overrides `dir` and the default name.
    file: Option<&'p Path>,
    skip_unchanged: bool,
}

/// What happened to one book.
#[derive(Debug, PartialEq, Eq)]
enum BookResult {
    Written(PathBuf),
    Listed,
    Unchanged,
}

/// Entry point for the CLI. Returns Ok(()) on success; Err with exit code and message on failure.
pub fn run(args: &Args) -> Result<(), CliRunError> {
    let target = classify_url(&args.url)?;
    if target == Target::Listing && (args.chapters.is_some() || args.list_chapters) {
        return Err(CliRunError::InvalidInput(
            "--chapters and --list-chapters need a book detail URL, not a listing URL.".to_string(),
        ));
    }

    let config = config::load_config().map_err(CliRunError::InvalidInput)?;
    let settings = Settings::resolve(args, config.as_ref())?;
    debug!(?settings, "effective settings");
    let client = build_client(&settings)?;

    match target {
        Target::Book => {
            let book_target = BookTarget {
                dir: &settings.output_dir,
                file: args.output.as_deref(),
                skip_unchanged: args.skip_unchanged,
            };
            run_book(&client, args, &settings, &args.url, &book_target).map(|_| ())
        }
        Target::Listing => run_listing(&client, args, &settings),
    }
}

/// Download every book of a listing into one directory. Per-book failures are reported
/// and the run goes on.
fn run_listing(client: &PoliteClient, args: &Args, settings: &Settings) -> Result<(), CliRunError> {
    let dir = args.output.as_deref().unwrap_or(&settings.output_dir);
    if !dir.is_dir() {
        return Err(CliRunError::InvalidInput(format!(
            "Cannot write output: {}: directory does not exist.",
            dir.display()
        )));
    }
    let images = ImageStore::new();
    let listing = EsjScraper::new(client, &images, &settings.conversion).scrape_listing(&args.url)?;
    if !args.quiet {
        eprintln!("{}: {} books", listing.title, listing.books.len());
    }

    let book_target = BookTarget {
        dir,
        file: None,
        skip_unchanged: true,
    };
    let (mut written, mut unchanged) = (0usize, 0usize);
    let mut failed: Vec<(String, String)> = Vec::new();
    for (number, url) in listing.books.iter().enumerate() {
        info!(book = number + 1, total = listing.books.len(), %url, "book");
        match run_book(client, args, settings, url, &book_target) {
            Ok(BookResult::Written(path)) => {
                debug!(path = %path.display(), "book written");
                written += 1;
            }
            Ok(BookResult::Unchanged) => unchanged += 1,
            Ok(BookResult::Listed) => {}
            Err(e) => {
                warn!(%url, error = %e, "book failed");
                failed.push((url.clone(), e.to_string()));
            }
        }
    }

    if !args.quiet {
        eprintln!(
            "Books: {} written, {} unchanged, {} failed.",
            written,
            unchanged,
            failed.len()
        );
        for (url, reason) in &failed {
            eprintln!("  {}: {}", url, reason);
        }
    }
    Ok(())
}

/// Scrape one book and write it. Each book gets its own image store.
fn run_book(
    client: &PoliteClient,
    args: &Args,
    settings: &Settings,
    url: &str,
    target: &BookTarget<'_>,
) -> Result<BookResult, CliRunError> {
    let images = ImageStore::new();
    let scraper = EsjScraper::new(client, &images, &settings.conversion);

    let bar: OnceLock<ProgressBar> = OnceLock::new();
    let progress_cb = |done: usize, total: usize| {
        if total == 0 {
            return;
        }
        let pb = bar.get_or_init(|| new_progress_bar(total as u64));
        pb.set_position(done as u64);
        pb.set_message(format!("Downloading {}/{}", done, total));
    };
    let show_progress = !args.quiet && !args.list_chapters;
    let progress: Option<ProgressFn<'_>> = show_progress.then_some(&progress_cb as ProgressFn<'_>);

    let is_current = |meta: &BookMeta| {
        let path = output_path_for(
            target.dir,
            target.file,
            meta,
            args.chapters.as_ref(),
            args.format,
        );
        existing_output_is_current(&path, meta)
    };
    let check_current = target.skip_unchanged && args.format == OutputFormat::Epub;
    let up_to_date: Option<UpToDateFn<'_>> = check_current.then_some(&is_current as UpToDateFn<'_>);

    let options = ScrapeOptions {
        workers: settings.threads,
        selection: args.chapters.clone(),
        list_only: args.list_chapters,
        progress,
        up_to_date,
    };
    let scraped = scraper.scrape_book(url, &options)?;

    if let Some(pb) = bar.get() {
        pb.disable_steady_tick();
        pb.finish_and_clear();
    }

    match scraped.outcome {
        ScrapeOutcome::Listed => {
            print!("{}", format_listing(&scraped.book.nodes));
            return Ok(BookResult::Listed);
        }
        ScrapeOutcome::Unchanged => {
            if !args.quiet {
                eprintln!(
                    "Up to date: {} ({})",
                    scraped.book.meta.title,
                    scraped.book.meta.last_updated.as_deref().unwrap_or("")
                );
            }
            return Ok(BookResult::Unchanged);
        }
        ScrapeOutcome::Downloaded => {}
    }

    let book = &scraped.book;
    let prune = args.chapters.is_some() && !args.unfiltered_toc;
    let toc = toc::build(&book.nodes, book.depth, TocOptions { prune });

    let output_path = output_path_for(
        target.dir,
        target.file,
        &book.meta,
        args.chapters.as_ref(),
        args.format,
    );
    validate_output_path(&output_path)?;

    match args.format {
        OutputFormat::Epub => {
            let options = EpubOptions {
                version: if args.epub_2 {
                    EpubVersion::Epub2
                } else {
                    EpubVersion::Epub3
                },
                include_ncx: args.ncx,
                include_toc_page: settings.toc_page,
            };
            write_epub(
                book,
                &toc,
                &images,
                scraped.cover.as_ref(),
                &output_path,
                &options,
            )?;
            if args.validate {
                validate_epub(&output_path)?;
            }
        }
        OutputFormat::Json => write_json(book, &output_path)?,
        OutputFormat::Markdown => write_markdown(book, &toc, &images, &output_path)?,
        OutputFormat::Text => write_text(book, &toc, &images, &output_path)?,
    }

    if !args.quiet {
        print_summary(&scraped.summary, images.len());
        eprintln!("Wrote {}", output_path.display());
    }
    Ok(BookResult::Written(output_path))
}
