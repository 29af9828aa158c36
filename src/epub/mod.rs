//! EPUB writer. Consumes a scraped [Book], its nested [Toc] and the [ImageStore]; writes
//! EPUB 2 or EPUB 3 (mimetype, container, OPF, nav/NCX, pages, images).

use crate::model::{Book, ContentStatus, Node};
use crate::scraper::normalize::{escape_html, to_plain_text};
use crate::scraper::{CoverImage, ImageEntry, ImageStore};
use crate::toc::{Toc, TocEntry};
use regex::Regex;
use std::io::{Read, Seek, Write};
use std::path::Path;
use std::sync::{Arc, LazyLock};
use thiserror::Error;
use tracing::debug;
use zip::read::ZipArchive;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

const CONTAINER_XML: &[u8] = b"<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<container version=\"1.0\" xmlns=\"urn:oasis:names:tc:opendocument:xmlns:container\">\n  <rootfiles>\n    <rootfile full-path=\"OEBPS/content.opf\" media-type=\"application/oebps-package+xml\"/>\n  </rootfiles>\n</container>";

const MIMETYPE: &[u8] = b"application/epub+zip";
const OEBPS_PREFIX: &str = "OEBPS/";
const LANGUAGE: &str = "zh";
const DESCRIPTION_TITLE: &str = "Description";
const DESCRIPTION_HREF: &str = "description.xhtml";
const OPF_PATH: &str = "OEBPS/content.opf";

static LAST_CHANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<meta\s+name="esj:last-change"\s+content="([^"]*)"\s*/>"#).unwrap()
});

/// EPUB format version.
///
/// Default is EPUB 3 (OPF 3.0, nav.xhtml, HTML5 pages). Use `Epub2` for legacy readers (OPF 2.0, NCX, XHTML 1.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EpubVersion {
    /// EPUB 3: OPF 3.0, nav.xhtml, HTML5 pages. Optional toc.ncx for compatibility.
    #[default]
    Epub3,
    /// EPUB 2: OPF 2.0, toc.ncx only, XHTML 1.1 pages.
    Epub2,
}

/// Packaging switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EpubOptions {
    pub version: EpubVersion,
    /// Also write toc.ncx for EPUB 3 (always written for EPUB 2).
    pub include_ncx: bool,
    /// Insert a visible table-of-contents page after the cover.
    pub include_toc_page: bool,
}

/// Errors from the EPUB writer.
///
/// Maps to CLI exit code 3.
#[derive(Debug, Error)]
pub enum EpubError {
    #[error("Cannot write EPUB: book title is empty.")]
    EmptyTitle,

    #[error("Cannot write EPUB: nothing to write (no chapters left after filtering).")]
    NoChapters,

    #[error("Failed to create EPUB file: {path}: {source}")]
    CreateFile {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write EPUB archive: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl From<std::io::Error> for EpubError {
    fn from(e: std::io::Error) -> Self {
        EpubError::Zip(zip::result::ZipError::Io(e))
    }
}

/// One XHTML content document in reading order.
#[derive(Debug)]
struct Page {
    id: String,
    href: String,
    title: String,
    body: String,
}

/// Everything that goes into one archive.
struct Package<'a> {
    book: &'a Book,
    toc: &'a Toc,
    images: Vec<Arc<ImageEntry>>,
    cover: Option<&'a CoverImage>,
    pages: Vec<Page>,
    has_description: bool,
    options: EpubOptions,
}

fn node_href(index: usize) -> String {
    format!("node-{}.xhtml", index)
}

/// Page body for a node: volumes and failed chapters carry their own heading.
fn node_body(node: &Node) -> String {
    match node.content() {
        Some(c) if matches!(c.status, ContentStatus::Volume | ContentStatus::Failed) => {
            c.html.clone()
        }
        Some(c) => format!("<h1>{}</h1>\n{}", escape_html(&node.title), c.html),
        None => format!("<h1>{}</h1>\n", escape_html(&node.title)),
    }
}

fn image_href(entry: &ImageEntry) -> String {
    format!("images/{}", entry.file_name())
}

fn build_pages(book: &Book, toc: &Toc, images: &ImageStore) -> Vec<Page> {
    let mut pages = Vec::new();
    if let Some(description) = &book.meta.description {
        pages.push(Page {
            id: "description".to_string(),
            href: DESCRIPTION_HREF.to_string(),
            title: DESCRIPTION_TITLE.to_string(),
            body: format!(
                "<h1>{}</h1>\n{}",
                DESCRIPTION_TITLE,
                images.rewrite_tokens(description, image_href)
            ),
        });
    }
    for index in toc.spine() {
        let Some(node) = book.nodes.get(index) else {
            continue;
        };
        pages.push(Page {
            id: format!("node-{}", index),
            href: node_href(index),
            title: node.title.clone(),
            body: images.rewrite_tokens(&node_body(node), image_href),
        });
    }
    pages
}

/// Write a scraped book to an EPUB file.
///
/// Pages follow the table of contents; every stored image is included, and the cover
/// when one was fetched. Output is intended to pass epubcheck.
pub fn write_epub(
    book: &Book,
    toc: &Toc,
    images: &ImageStore,
    cover: Option<&CoverImage>,
    path: &Path,
    options: &EpubOptions,
) -> Result<(), EpubError> {
    validate_book(book, toc)?;

    let path = path.to_path_buf();
    let file = std::fs::File::create(&path).map_err(|e| EpubError::CreateFile {
        path: path.clone(),
        source: e,
    })?;
    let mut zip = ZipWriter::new(file);
    let pages = build_pages(book, toc, images);
    let package = Package {
        book,
        toc,
        images: images.entries(),
        cover,
        has_description: book.meta.description.is_some(),
        pages,
        options: *options,
    };
    package.write(&mut zip)?;
    zip.finish()?;
    debug!(path = %path.display(), "epub written");
    Ok(())
}

fn validate_book(book: &Book, toc: &Toc) -> Result<(), EpubError> {
    if book.meta.title.trim().is_empty() {
        return Err(EpubError::EmptyTitle);
    }
    if toc.is_empty() {
        return Err(EpubError::NoChapters);
    }
    Ok(())
}

impl Package<'_> {
    fn write<W: Write + Seek>(&self, zip: &mut ZipWriter<W>) -> Result<(), EpubError> {
        let options_stored = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored)
            .unix_permissions(0o644);
        let options_deflate = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .unix_permissions(0o644);

        // Mimetype first, uncompressed
        zip.start_file("mimetype", options_stored)?;
        zip.write_all(MIMETYPE)?;

        zip.start_file("META-INF/container.xml", options_deflate)?;
        zip.write_all(CONTAINER_XML)?;

        self.write_opf(zip, options_deflate)?;
        match self.options.version {
            EpubVersion::Epub3 => {
                self.write_nav_xhtml(zip, options_deflate)?;
                if self.options.include_ncx {
                    self.write_ncx(zip, options_deflate)?;
                }
            }
            EpubVersion::Epub2 => self.write_ncx(zip, options_deflate)?,
        }
        if self.cover.is_some() {
            self.write_cover_xhtml(zip, options_deflate)?;
        }
        if self.options.include_toc_page {
            self.write_toc_page_xhtml(zip, options_deflate)?;
        }
        self.write_pages(zip, options_deflate)?;

        if let Some(cover) = self.cover {
            zip.start_file(
                format!("{}images/{}", OEBPS_PREFIX, cover.file_name()),
                options_stored,
            )?;
            zip.write_all(&cover.bytes)?;
        }
        for entry in &self.images {
            zip.start_file(
                format!("{}{}", OEBPS_PREFIX, image_href(entry)),
                options_stored,
            )?;
            zip.write_all(&entry.bytes)?;
        }
        Ok(())
    }

    fn identifier(&self) -> String {
        if self.book.meta.source_url.is_empty() {
            "urn:esjscrape:book".to_string()
        } else {
            self.book.meta.source_url.clone()
        }
    }

    fn write_opf<W: Write + Seek>(
        &self,
        zip: &mut ZipWriter<W>,
        options: SimpleFileOptions,
    ) -> Result<(), EpubError> {
        let epub3 = self.options.version == EpubVersion::Epub3;
        let include_ncx = !epub3 || self.options.include_ncx;
        let meta = &self.book.meta;

        let mut metadata = format!(
            r#"    <dc:identifier id="book-id">{}</dc:identifier>
    <dc:title>{}</dc:title>
    <dc:language>{}</dc:language>
"#,
            escape_html(&self.identifier()),
            escape_html(&meta.title),
            LANGUAGE
        );
        if !meta.author.trim().is_empty() {
            metadata.push_str(&format!(
                "    <dc:creator>{}</dc:creator>\n",
                escape_html(&meta.author)
            ));
        }
        if let Some(description) = &meta.description {
            let text = to_plain_text(description, |_| String::new());
            if !text.trim().is_empty() {
                metadata.push_str(&format!(
                    "    <dc:description>{}</dc:description>\n",
                    escape_html(text.trim())
                ));
            }
        }
        if let Some(date) = &meta.last_updated {
            metadata.push_str(&format!(
                "    <meta name=\"esj:last-change\" content=\"{}\"/>\n",
                escape_html(date)
            ));
        }
        if epub3 {
            metadata.push_str(&format!(
                "    <meta property=\"dcterms:modified\">{}</meta>\n",
                escape_html(&modified_timestamp(meta.last_updated.as_deref()))
            ));
        }
        if self.cover.is_some() {
            metadata.push_str("    <meta name=\"cover\" content=\"cover-img\"/>\n");
        }

        let mut manifest = String::new();
        if epub3 {
            manifest.push_str(
                "    <item id=\"nav\" href=\"nav.xhtml\" media-type=\"application/xhtml+xml\" properties=\"nav\"/>\n",
            );
        }
        if include_ncx {
            manifest.push_str(
                "    <item id=\"ncx\" href=\"toc.ncx\" media-type=\"application/x-dtbncx+xml\"/>\n",
            );
        }
        if let Some(cover) = self.cover {
            manifest.push_str(&format!(
                "    <item id=\"cover-img\" href=\"images/{}\" media-type=\"{}\"{}/>\n",
                cover.file_name(),
                cover.image_type.media_type(),
                if epub3 {
                    " properties=\"cover-image\""
                } else {
                    ""
                }
            ));
            manifest.push_str(
                "    <item id=\"cover\" href=\"cover.xhtml\" media-type=\"application/xhtml+xml\"/>\n",
            );
        }
        if self.options.include_toc_page {
            manifest.push_str(
                "    <item id=\"toc-page\" href=\"toc.xhtml\" media-type=\"application/xhtml+xml\"/>\n",
            );
        }
        for page in &self.pages {
            manifest.push_str(&format!(
                "    <item id=\"{}\" href=\"{}\" media-type=\"application/xhtml+xml\"/>\n",
                page.id, page.href
            ));
        }
        for entry in &self.images {
            manifest.push_str(&format!(
                "    <item id=\"img-{}\" href=\"{}\" media-type=\"{}\"/>\n",
                entry.hash,
                image_href(entry),
                entry.media_type()
            ));
        }

        // Reading order: cover, optional toc page, then pages. Nav is not in the spine.
        let mut spine = String::new();
        if self.cover.is_some() {
            spine.push_str("    <itemref idref=\"cover\"/>\n");
        }
        if self.options.include_toc_page {
            spine.push_str("    <itemref idref=\"toc-page\"/>\n");
        }
        for page in &self.pages {
            spine.push_str(&format!("    <itemref idref=\"{}\"/>\n", page.id));
        }

        let guide = if self.cover.is_some() {
            "  <guide>\n    <reference type=\"cover\" href=\"cover.xhtml\" title=\"Cover\"/>\n  </guide>\n"
        } else {
            ""
        };

        let opf = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" unique-identifier="book-id" version="{version}">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/" xmlns:opf="http://www.idpf.org/2007/opf">
{metadata}  </metadata>
  <manifest>
{manifest}  </manifest>
  <spine{toc_attr}>
{spine}  </spine>
{guide}</package>
"#,
            version = if epub3 { "3.0" } else { "2.0" },
            metadata = metadata,
            manifest = manifest,
            toc_attr = if include_ncx { " toc=\"ncx\"" } else { "" },
            spine = spine,
            guide = guide
        );

        zip.start_file(OPF_PATH, options)?;
        zip.write_all(opf.as_bytes())?;
        Ok(())
    }

    /// Nested `<li>` items for the navigation document and the visible toc page.
    fn nav_items(&self, indent: usize) -> String {
        let mut out = String::new();
        let pad = "  ".repeat(indent);
        if self.has_description {
            out.push_str(&format!(
                "{}<li><a href=\"{}\">{}</a></li>\n",
                pad, DESCRIPTION_HREF, DESCRIPTION_TITLE
            ));
        }
        nav_list(&self.toc.entries, indent, &mut out);
        out
    }

    fn write_nav_xhtml<W: Write + Seek>(
        &self,
        zip: &mut ZipWriter<W>,
        options: SimpleFileOptions,
    ) -> Result<(), EpubError> {
        let nav = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE html>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops" xml:lang="{lang}" lang="{lang}">
<head>
  <meta charset="UTF-8"/>
  <title>{title}</title>
</head>
<body>
  <nav epub:type="toc" id="toc">
    <h1>{title}</h1>
    <ol>
{items}    </ol>
  </nav>
</body>
</html>
"#,
            lang = LANGUAGE,
            title = escape_html(&self.book.meta.title),
            items = self.nav_items(3)
        );
        zip.start_file(format!("{}nav.xhtml", OEBPS_PREFIX), options)?;
        zip.write_all(nav.as_bytes())?;
        Ok(())
    }

    /// Visible table-of-contents page (toc.xhtml), placed after the cover.
    fn write_toc_page_xhtml<W: Write + Seek>(
        &self,
        zip: &mut ZipWriter<W>,
        options: SimpleFileOptions,
    ) -> Result<(), EpubError> {
        let body = format!(
            "  <h1>Table of Contents</h1>\n  <ol>\n{}  </ol>",
            self.nav_items(2)
        );
        let page = render_page(self.options.version, "Table of Contents", &body);
        zip.start_file(format!("{}toc.xhtml", OEBPS_PREFIX), options)?;
        zip.write_all(page.as_bytes())?;
        Ok(())
    }

    fn write_ncx<W: Write + Seek>(
        &self,
        zip: &mut ZipWriter<W>,
        options: SimpleFileOptions,
    ) -> Result<(), EpubError> {
        let mut nav_points = String::new();
        let mut play_order = 0usize;
        if self.has_description {
            play_order += 1;
            nav_points.push_str(&format!(
                "    <navPoint id=\"navpoint-{n}\" playOrder=\"{n}\">\n      <navLabel><text>{}</text></navLabel>\n      <content src=\"{}\"/>\n    </navPoint>\n",
                DESCRIPTION_TITLE,
                DESCRIPTION_HREF,
                n = play_order
            ));
        }
        ncx_points(&self.toc.entries, 2, &mut play_order, &mut nav_points);
        let ncx = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<ncx xmlns="http://www.daisy.org/z3986/2005/ncx/" version="2005-1">
  <head>
    <meta name="dtb:uid" content="{uid}"/>
    <meta name="dtb:depth" content="{depth}"/>
    <meta name="dtb:totalPageCount" content="0"/>
    <meta name="dtb:maxPageNumber" content="0"/>
  </head>
  <docTitle>
    <text>{title}</text>
  </docTitle>
  <navMap>
{points}  </navMap>
</ncx>
"#,
            uid = escape_html(&self.identifier()),
            depth = self.toc.max_depth().max(1),
            title = escape_html(&self.book.meta.title),
            points = nav_points
        );
        zip.start_file(format!("{}toc.ncx", OEBPS_PREFIX), options)?;
        zip.write_all(ncx.as_bytes())?;
        Ok(())
    }

    fn write_cover_xhtml<W: Write + Seek>(
        &self,
        zip: &mut ZipWriter<W>,
        options: SimpleFileOptions,
    ) -> Result<(), EpubError> {
        let Some(cover) = self.cover else {
            return Ok(());
        };
        let body = format!(
            r#"  <div style="text-align: center;">
    <img src="images/{}" alt="Cover" style="max-width: 100%; height: auto;"/>
  </div>"#,
            cover.file_name()
        );
        let page = render_page(self.options.version, "Cover", &body);
        zip.start_file(format!("{}cover.xhtml", OEBPS_PREFIX), options)?;
        zip.write_all(page.as_bytes())?;
        Ok(())
    }

    fn write_pages<W: Write + Seek>(
        &self,
        zip: &mut ZipWriter<W>,
        options: SimpleFileOptions,
    ) -> Result<(), EpubError> {
        for page in &self.pages {
            let html = render_page(self.options.version, &page.title, &page.body);
            zip.start_file(format!("{}{}", OEBPS_PREFIX, page.href), options)?;
            zip.write_all(html.as_bytes())?;
        }
        Ok(())
    }
}

fn nav_list(entries: &[TocEntry], indent: usize, out: &mut String) {
    let pad = "  ".repeat(indent);
    for entry in entries {
        let link = format!(
            "<a href=\"{}\">{}</a>",
            node_href(entry.index()),
            escape_html(entry.title())
        );
        if entry.children().is_empty() {
            out.push_str(&format!("{}<li>{}</li>\n", pad, link));
        } else {
            out.push_str(&format!("{}<li>{}\n{}  <ol>\n", pad, link, pad));
            nav_list(entry.children(), indent + 2, out);
            out.push_str(&format!("{}  </ol>\n{}</li>\n", pad, pad));
        }
    }
}

fn ncx_points(entries: &[TocEntry], indent: usize, play_order: &mut usize, out: &mut String) {
    let pad = "  ".repeat(indent);
    for entry in entries {
        *play_order += 1;
        out.push_str(&format!(
            "{pad}<navPoint id=\"navpoint-{n}\" playOrder=\"{n}\">\n{pad}  <navLabel><text>{}</text></navLabel>\n{pad}  <content src=\"{}\"/>\n",
            escape_html(entry.title()),
            node_href(entry.index()),
            pad = pad,
            n = *play_order
        ));
        ncx_points(entry.children(), indent + 1, play_order, out);
        out.push_str(&format!("{}</navPoint>\n", pad));
    }
}

/// `dcterms:modified` value: the site's last-update day, else the current UTC time.
fn modified_timestamp(last_updated: Option<&str>) -> String {
    match last_updated.map(str::trim).filter(|d| !d.is_empty()) {
        Some(date) => format!("{}T00:00:00Z", date),
        None => chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
    }
}

/// Read the `esj:last-change` date recorded in an EPUB written by [write_epub].
///
/// `None` when the file is missing, unreadable, or carries no date.
pub fn read_last_change(path: &Path) -> Option<String> {
    let file = std::fs::File::open(path).ok()?;
    let mut zip = match ZipArchive::new(file) {
        Ok(z) => z,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "existing output is not a readable epub");
            return None;
        }
    };
    let mut opf = String::new();
    zip.by_name(OPF_PATH).ok()?.read_to_string(&mut opf).ok()?;
    LAST_CHANGE_RE
        .captures(&opf)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|d| !d.is_empty())
}

fn render_page(version: EpubVersion, title: &str, body: &str) -> String {
    let doctype = match version {
        EpubVersion::Epub3 => "<!DOCTYPE html>",
        EpubVersion::Epub2 => {
            r#"<!DOCTYPE html PUBLIC "-//W3C//DTD XHTML 1.1//EN" "http://www.w3.org/TR/xhtml11/DTD/xhtml11.dtd">"#
        }
    };
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
{doctype}
<html xmlns="http://www.w3.org/1999/xhtml" xml:lang="{lang}">
<head>
  <meta http-equiv="Content-Type" content="text/html; charset=utf-8"/>
  <title>{title}</title>
</head>
<body>
{body}
</body>
</html>
"#,
        doctype = doctype,
        lang = LANGUAGE,
        title = escape_html(title),
        body = body
    )
}
