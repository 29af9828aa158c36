//! Content-addressed image store shared by all download workers.
//!
//! Images are keyed by the first 32 hex characters of the SHA-256 of their bytes, so
//! the same picture linked from several chapters (or several URLs) is stored once.
//! Chapter markup only carries `esj-image:<hash>` tokens; writers rewrite them.

use crate::scraper::client::Fetch;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Scheme-like prefix of image tokens embedded in chapter markup.
pub const IMAGE_TOKEN_PREFIX: &str = "esj-image:";
const HASH_LEN: usize = 32;

/// Detected raster image type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageType {
    Png,
    Jpeg,
    Gif,
    Webp,
    Bmp,
    Tiff,
}

impl ImageType {
    pub fn media_type(self) -> &'static str {
        match self {
            ImageType::Png => "image/png",
            ImageType::Jpeg => "image/jpeg",
            ImageType::Gif => "image/gif",
            ImageType::Webp => "image/webp",
            ImageType::Bmp => "image/bmp",
            ImageType::Tiff => "image/tiff",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ImageType::Png => ".png",
            ImageType::Jpeg => ".jpg",
            ImageType::Gif => ".gif",
            ImageType::Webp => ".webp",
            ImageType::Bmp => ".bmp",
            ImageType::Tiff => ".tiff",
        }
    }

    /// Parse a `Content-Type` header value; parameters are ignored.
    pub fn from_content_type(value: &str) -> Option<Self> {
        let essence = value.split(';').next().unwrap_or("").trim().to_lowercase();
        match essence.as_str() {
            "image/png" => Some(ImageType::Png),
            "image/jpeg" | "image/jpg" | "image/pjpeg" => Some(ImageType::Jpeg),
            "image/gif" => Some(ImageType::Gif),
            "image/webp" => Some(ImageType::Webp),
            "image/bmp" | "image/x-ms-bmp" => Some(ImageType::Bmp),
            "image/tiff" => Some(ImageType::Tiff),
            _ => None,
        }
    }

    /// Sniff the type from leading magic bytes.
    pub fn from_magic(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
            Some(ImageType::Png)
        } else if bytes.starts_with(&[0xff, 0xd8, 0xff]) {
            Some(ImageType::Jpeg)
        } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
            Some(ImageType::Gif)
        } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
            Some(ImageType::Webp)
        } else if bytes.starts_with(b"BM") {
            Some(ImageType::Bmp)
        } else if bytes.starts_with(b"II*\0") || bytes.starts_with(b"MM\0*") {
            Some(ImageType::Tiff)
        } else {
            None
        }
    }
}

/// Header first, bytes second.
pub fn detect_image_type(content_type: Option<&str>, bytes: &[u8]) -> Option<ImageType> {
    content_type
        .and_then(ImageType::from_content_type)
        .or_else(|| ImageType::from_magic(bytes))
}

/// First 32 hex characters of the SHA-256 digest.
pub fn content_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut hash = hex::encode(digest);
    hash.truncate(HASH_LEN);
    hash
}

/// A stored image. Never mutated after insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageEntry {
    pub hash: String,
    pub image_type: ImageType,
    /// First URL this content was seen at.
    pub original_url: String,
    pub bytes: Vec<u8>,
}

impl ImageEntry {
    pub fn media_type(&self) -> &'static str {
        self.image_type.media_type()
    }

    /// Deterministic archive file name, e.g. `Image_0123abcd...png`.
    pub fn file_name(&self) -> String {
        format!("Image_{}{}", self.hash, self.image_type.extension())
    }
}

/// Outcome of resolving one image URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRef {
    /// Stored under this hash.
    Stored(String),
    /// Could not be fetched or recognized; carries the URL as given.
    Failed(String),
}

impl ImageRef {
    pub fn token(hash: &str) -> String {
        format!("{}{}", IMAGE_TOKEN_PREFIX, hash)
    }

    /// Markup that replaces the original `<img>` in normalized content.
    pub fn to_markup(&self) -> String {
        match self {
            ImageRef::Stored(hash) => format!(r#"<img src="{}" alt=""/>"#, Self::token(hash)),
            ImageRef::Failed(url) => format!(
                "<p>Image download failed: {}</p>",
                crate::scraper::normalize::escape_html(url)
            ),
        }
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    entries: HashMap<String, Arc<ImageEntry>>,
    order: Vec<String>,
    /// Source URL to content hash, for URLs that already resolved.
    by_url: HashMap<String, String>,
}

/// Thread-safe image cache. All resolutions are serialized by one mutex, so a URL
/// that resolved once is never fetched again.
#[derive(Debug, Default)]
pub struct ImageStore {
    inner: Mutex<StoreInner>,
}

impl ImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Download `url` and store it, or return the existing entry for the same URL or
    /// identical bytes.
    ///
    /// Failures are logged and reported as [ImageRef::Failed]; they never abort a chapter.
    pub fn resolve<F: Fetch + ?Sized>(&self, fetcher: &F, url: &str) -> ImageRef {
        let url = url.trim();
        if url.is_empty() {
            warn!("image without a source, skipped");
            return ImageRef::Failed(String::new());
        }
        let mut inner = self.inner.lock();
        if let Some(hash) = inner.by_url.get(url) {
            debug!(url, %hash, "image url already resolved");
            return ImageRef::Stored(hash.clone());
        }
        let fetched = match fetcher.fetch(url) {
            Ok(f) => f,
            Err(e) => {
                warn!(url, error = %e, "image download failed");
                return ImageRef::Failed(url.to_string());
            }
        };
        let image_type = match detect_image_type(fetched.content_type.as_deref(), &fetched.bytes)
        {
            Some(t) => t,
            None => {
                warn!(url, content_type = ?fetched.content_type, "unrecognized image type");
                return ImageRef::Failed(url.to_string());
            }
        };
        let hash = content_hash(&fetched.bytes);
        inner.by_url.insert(url.to_string(), hash.clone());
        if inner.entries.contains_key(&hash) {
            debug!(url, %hash, "image already stored");
            return ImageRef::Stored(hash);
        }
        let entry = ImageEntry {
            hash: hash.clone(),
            image_type,
            original_url: url.to_string(),
            bytes: fetched.bytes,
        };
        inner.entries.insert(hash.clone(), Arc::new(entry));
        inner.order.push(hash.clone());
        debug!(url, %hash, "image stored");
        ImageRef::Stored(hash)
    }

    pub fn get(&self, hash: &str) -> Option<Arc<ImageEntry>> {
        self.inner.lock().entries.get(hash).cloned()
    }

    /// All entries in first-insertion order.
    pub fn entries(&self) -> Vec<Arc<ImageEntry>> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .filter_map(|h| inner.entries.get(h).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace every `esj-image:<hash>` token in `markup` with `render(entry)`.
    ///
    /// Tokens with no matching entry are left untouched.
    pub fn rewrite_tokens<R>(&self, markup: &str, render: R) -> String
    where
        R: Fn(&ImageEntry) -> String,
    {
        let mut out = String::with_capacity(markup.len());
        let mut rest = markup;
        while let Some(pos) = rest.find(IMAGE_TOKEN_PREFIX) {
            out.push_str(&rest[..pos]);
            let after = &rest[pos + IMAGE_TOKEN_PREFIX.len()..];
            let hash_len = after
                .bytes()
                .take_while(|b| b.is_ascii_hexdigit())
                .count();
            match self.get(&after[..hash_len]) {
                Some(entry) => out.push_str(&render(&entry)),
                None => out.push_str(&rest[pos..pos + IMAGE_TOKEN_PREFIX.len() + hash_len]),
            }
            rest = &after[hash_len..];
        }
        out.push_str(rest);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scraper::testing::MockFetcher;

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n0000rest-of-png";
    const JPEG: &[u8] = &[0xff, 0xd8, 0xff, 0xe0, 1, 2, 3];

    #[test]
    fn content_type_wins_and_parameters_are_ignored() {
        assert_eq!(
            detect_image_type(Some("image/JPEG; charset=binary"), PNG),
            Some(ImageType::Jpeg)
        );
        assert_eq!(
            detect_image_type(Some("application/octet-stream"), PNG),
            Some(ImageType::Png)
        );
        assert_eq!(detect_image_type(None, JPEG), Some(ImageType::Jpeg));
    }

    #[test]
    fn magic_numbers_cover_common_formats() {
        assert_eq!(ImageType::from_magic(b"GIF89a..."), Some(ImageType::Gif));
        assert_eq!(ImageType::from_magic(b"GIF87a..."), Some(ImageType::Gif));
        assert_eq!(
            ImageType::from_magic(b"RIFF\x10\0\0\0WEBPVP8 "),
            Some(ImageType::Webp)
        );
        assert_eq!(ImageType::from_magic(b"BM\0\0"), Some(ImageType::Bmp));
        assert_eq!(ImageType::from_magic(b"II*\0abc"), Some(ImageType::Tiff));
        assert_eq!(ImageType::from_magic(b"MM\0*abc"), Some(ImageType::Tiff));
        assert_eq!(ImageType::from_magic(b"<html>"), None);
        assert_eq!(ImageType::from_magic(b"RIFF\0\0"), None);
    }

    #[test]
    fn hash_is_32_hex_chars() {
        let hash = content_hash(b"abc");
        assert_eq!(hash, "ba7816bf8f01cfea414140de5dae2223");
    }

    #[test]
    fn identical_bytes_from_two_urls_share_one_entry() {
        let fetcher = MockFetcher::new()
            .with("https://img/a.png", Some("image/png"), PNG)
            .with("https://mirror/b", None, PNG);
        let store = ImageStore::new();
        let a = store.resolve(&fetcher, "https://img/a.png");
        let b = store.resolve(&fetcher, "https://mirror/b");
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
        let hash = match a {
            ImageRef::Stored(h) => h,
            other => panic!("expected stored image, got {:?}", other),
        };
        let entry = store.get(&hash).unwrap();
        assert_eq!(entry.original_url, "https://img/a.png");
        assert_eq!(entry.file_name(), format!("Image_{}.png", hash));
        assert_eq!(entry.media_type(), "image/png");
    }

    #[test]
    fn repeated_url_is_fetched_once() {
        let fetcher = MockFetcher::new().with("https://img/a.png", None, PNG);
        let store = ImageStore::new();
        let first = store.resolve(&fetcher, "https://img/a.png");
        let second = store.resolve(&fetcher, " https://img/a.png ");
        assert_eq!(first, second);
        assert_eq!(fetcher.hits("https://img/a.png"), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn failed_url_is_tried_again() {
        let fetcher = MockFetcher::new();
        let store = ImageStore::new();
        store.resolve(&fetcher, "https://img/missing");
        store.resolve(&fetcher, "https://img/missing");
        assert_eq!(fetcher.hits("https://img/missing"), 2);
    }

    #[test]
    fn failures_are_reported_not_raised() {
        let fetcher = MockFetcher::new().with("https://img/page", Some("text/html"), b"<html>");
        let store = ImageStore::new();
        assert_eq!(
            store.resolve(&fetcher, "https://img/missing"),
            ImageRef::Failed("https://img/missing".to_string())
        );
        assert_eq!(
            store.resolve(&fetcher, "https://img/page"),
            ImageRef::Failed("https://img/page".to_string())
        );
        assert_eq!(store.resolve(&fetcher, "  "), ImageRef::Failed(String::new()));
        assert!(store.is_empty());
    }

    #[test]
    fn entries_keep_insertion_order() {
        let fetcher = MockFetcher::new()
            .with("https://img/2", None, JPEG)
            .with("https://img/1", None, PNG);
        let store = ImageStore::new();
        store.resolve(&fetcher, "https://img/2");
        store.resolve(&fetcher, "https://img/1");
        let urls: Vec<String> = store
            .entries()
            .iter()
            .map(|e| e.original_url.clone())
            .collect();
        assert_eq!(urls, vec!["https://img/2", "https://img/1"]);
    }

    #[test]
    fn rewrite_tokens_replaces_known_and_keeps_unknown() {
        let fetcher = MockFetcher::new().with("https://img/a", None, PNG);
        let store = ImageStore::new();
        let stored = store.resolve(&fetcher, "https://img/a");
        let markup = format!(
            "<p>x</p>\n{}\n<img src=\"esj-image:ffff\" alt=\"\"/>",
            stored.to_markup()
        );
        let rewritten = store.rewrite_tokens(&markup, |e| format!("images/{}", e.file_name()));
        let hash = content_hash(PNG);
        assert!(rewritten.contains(&format!(r#"src="images/Image_{}.png""#, hash)));
        assert!(rewritten.contains(r#"src="esj-image:ffff""#));
        assert!(rewritten.starts_with("<p>x</p>\n"));
    }

    #[test]
    fn failed_ref_markup_escapes_url() {
        let markup = ImageRef::Failed("https://a/?x=1&y=<2>".to_string()).to_markup();
        assert_eq!(
            markup,
            "<p>Image download failed: https://a/?x=1&amp;y=&lt;2&gt;</p>"
        );
    }

    #[test]
    fn concurrent_resolution_of_same_bytes_stores_once() {
        let fetcher = MockFetcher::new()
            .with("https://img/1", None, PNG)
            .with("https://img/2", None, PNG)
            .with("https://img/3", None, JPEG);
        let store = ImageStore::new();
        std::thread::scope(|s| {
            for url in ["https://img/1", "https://img/2", "https://img/3", "https://img/1"] {
                let store = &store;
                let fetcher = &fetcher;
                s.spawn(move || store.resolve(fetcher, url));
            }
        });
        assert_eq!(store.len(), 2);
        assert_eq!(fetcher.hits("https://img/1"), 1);
    }
}
