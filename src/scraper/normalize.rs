//! Chapter content normalization.
//!
//! Reduces arbitrary chapter markup to a flat sequence of `<p>` lines and image
//! references. Text is script-converted and escaped; images go through the shared
//! [ImageStore]; links are annotated with a visible `[href]` line.

use crate::convert::ScriptConvert;
use crate::scraper::client::Fetch;
use crate::scraper::images::{ImageRef, ImageStore, IMAGE_TOKEN_PREFIX};
use crate::scraper::resolve_url;
use regex::Regex;
use reqwest::Url;
use scraper::{ElementRef, Html, Node};
use std::sync::LazyLock;

/// Markup emitted for a password-protected chapter.
pub const GATED_PLACEHOLDER: &str = "<p>This chapter is password protected and was skipped.</p>\n";
/// Markup emitted when nothing survives normalization.
pub const EMPTY_PLACEHOLDER: &str = "<p>[empty]</p>\n";
/// Marker attribute set on links that already carry their `[href]` line.
pub const ANNOTATED_ATTR: &str = "data-href-annotated";

static ANCHOR_OPEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<a\b([^>]*?)(/?)>").unwrap());
static HREF_ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\bhref\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#).unwrap()
});
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());

/// Escape text for use in XHTML element content or attribute values.
pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn is_blank(s: &str) -> bool {
    s.chars().all(char::is_whitespace)
}

fn contains_img(el: ElementRef<'_>) -> bool {
    el.descendants()
        .any(|n| matches!(n.value(), Node::Element(e) if e.name() == "img"))
}

fn has_visible_text(el: ElementRef<'_>) -> bool {
    el.text().any(|t| !is_blank(t))
}

/// First non-blank, trimmed text line inside `el`.
fn first_line(el: ElementRef<'_>) -> Option<String> {
    el.text()
        .flat_map(str::lines)
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(String::from)
}

fn needs_annotation(a: ElementRef<'_>, href: &str) -> bool {
    if a.value().attr(ANNOTATED_ATTR).is_some() {
        return false;
    }
    first_line(a).as_deref() != Some(format!("[{}]", href).as_str())
}

/// Raw text lines of an element, with `[href]` lines before link text.
fn text_lines(el: ElementRef<'_>) -> Vec<String> {
    let mut lines = Vec::new();
    for node in el.descendants() {
        match node.value() {
            Node::Element(e) if e.name() == "a" => {
                let href = e.attr("href").map(str::trim).filter(|h| !h.is_empty());
                if let (Some(href), Some(a)) = (href, ElementRef::wrap(node)) {
                    if needs_annotation(a, href) {
                        lines.push(format!("[{}]", href));
                    }
                }
            }
            Node::Text(t) => {
                let in_script = node
                    .parent()
                    .and_then(ElementRef::wrap)
                    .is_some_and(|p| matches!(p.value().name(), "script" | "style"));
                if !in_script {
                    lines.extend(t.lines().map(String::from));
                }
            }
            _ => {}
        }
    }
    lines
}

/// Normalizes chapter and description markup.
pub struct ContentNormalizer<'a> {
    fetcher: &'a dyn Fetch,
    images: &'a ImageStore,
    converter: &'a dyn ScriptConvert,
    base: &'a Url,
}

impl<'a> ContentNormalizer<'a> {
    pub fn new(
        fetcher: &'a dyn Fetch,
        images: &'a ImageStore,
        converter: &'a dyn ScriptConvert,
        base: &'a Url,
    ) -> Self {
        Self {
            fetcher,
            images,
            converter,
            base,
        }
    }

    /// Normalize the children of `region`. `None` when nothing survives.
    pub fn normalize(&self, region: ElementRef<'_>) -> Option<String> {
        let mut blocks = Vec::new();
        self.normalize_children(region, &mut blocks);
        if blocks.is_empty() {
            None
        } else {
            let mut out = blocks.join("\n");
            out.push('\n');
            Some(out)
        }
    }

    /// Like [Self::normalize], with the empty placeholder for blank results.
    pub fn normalize_or_empty(&self, region: ElementRef<'_>) -> String {
        self.normalize(region)
            .unwrap_or_else(|| EMPTY_PLACEHOLDER.to_string())
    }

    fn normalize_children(&self, parent: ElementRef<'_>, blocks: &mut Vec<String>) {
        for child in parent.children() {
            if let Some(el) = ElementRef::wrap(child) {
                self.normalize_element(el, blocks);
            } else if let Node::Text(t) = child.value() {
                self.push_lines(t.lines().map(String::from), blocks);
            }
        }
    }

    fn normalize_element(&self, el: ElementRef<'_>, blocks: &mut Vec<String>) {
        match el.value().name() {
            "img" => blocks.push(self.image(el).to_markup()),
            "script" | "style" => {}
            _ if contains_img(el) => self.normalize_children(el, blocks),
            _ if !has_visible_text(el) => {}
            _ => self.push_lines(text_lines(el), blocks),
        }
    }

    fn image(&self, img: ElementRef<'_>) -> ImageRef {
        let src = img
            .value()
            .attr("src")
            .filter(|s| !s.trim().is_empty())
            .or_else(|| img.value().attr("data-src"))
            .unwrap_or("");
        if src.trim().is_empty() {
            return self.images.resolve(self.fetcher, "");
        }
        let url = resolve_url(self.base, src);
        self.images.resolve(self.fetcher, &url)
    }

    fn push_lines<I: IntoIterator<Item = String>>(&self, lines: I, blocks: &mut Vec<String>) {
        for line in lines {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            blocks.push(format!(
                "<p>{}</p>",
                escape_html(&self.converter.convert(line))
            ));
        }
    }
}

/// First non-blank text line of the link body starting at `rest`, up to its `</a>`.
fn first_link_line(rest: &str) -> Option<&str> {
    let end = rest.to_ascii_lowercase().find("</a").unwrap_or(rest.len());
    TAG_RE
        .split(&rest[..end])
        .flat_map(str::lines)
        .map(str::trim)
        .find(|l| !l.is_empty())
}

/// Insert a `<p>[href]</p>` first child into every not-yet-annotated `<a href>` and mark it.
///
/// Markup-level twin of the `[href]` lines the normalizer emits, for callers that keep
/// raw chapter markup around: normalizing the result gives the same lines as normalizing
/// the input. Marked links, and links whose first text line already is `[href]`, get no
/// new line.
#[allow(dead_code)]
pub(crate) fn annotate_links(markup: &str) -> String {
    let mut out = String::with_capacity(markup.len());
    let mut last = 0;
    for caps in ANCHOR_OPEN_RE.captures_iter(markup) {
        let (Some(whole), Some(attrs)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let self_closing = caps.get(2).is_some_and(|m| !m.as_str().is_empty());
        let attrs = attrs.as_str();
        let href = HREF_ATTR_RE.captures(attrs).and_then(|h| {
            h.get(1)
                .or_else(|| h.get(2))
                .or_else(|| h.get(3))
                .map(|m| m.as_str().trim().to_string())
        });
        let Some(href) = href.filter(|h| !h.is_empty()) else {
            continue;
        };
        if self_closing || attrs.to_lowercase().contains(ANNOTATED_ATTR) {
            continue;
        }
        let line = format!("[{}]", href);
        out.push_str(&markup[last..whole.start()]);
        out.push_str(&format!(r#"<a{} {}="">"#, attrs.trim_end(), ANNOTATED_ATTR));
        if first_link_line(&markup[whole.end()..]) != Some(line.as_str()) {
            out.push_str(&format!("<p>{}</p>", line));
        }
        last = whole.end();
    }
    out.push_str(&markup[last..]);
    out
}

/// Render normalized markup as plain text lines.
///
/// `resolve_image` maps an image `src` (a store token or a plain URL) to the line
/// that stands in for it, usually the original URL.
pub fn to_plain_text<R>(markup: &str, resolve_image: R) -> String
where
    R: Fn(&str) -> String,
{
    let fragment = Html::parse_fragment(markup);
    let mut lines: Vec<String> = Vec::new();
    for node in fragment.root_element().descendants() {
        let Some(el) = ElementRef::wrap(node) else {
            continue;
        };
        match el.value().name() {
            "p" | "h1" | "h2" | "h3" | "li" => {
                let text: String = el.text().collect();
                let text = text.trim();
                if !text.is_empty() {
                    lines.push(text.to_string());
                }
            }
            "img" => {
                let src = el.value().attr("src").unwrap_or("");
                let line = resolve_image(src);
                if !line.trim().is_empty() {
                    lines.push(line);
                }
            }
            _ => {}
        }
    }
    let mut out = lines.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

/// Plain-text projection where stored images become their original URL.
pub fn plain_text_with_store(markup: &str, images: &ImageStore) -> String {
    to_plain_text(markup, |src| match src.strip_prefix(IMAGE_TOKEN_PREFIX) {
        Some(hash) => images
            .get(hash)
            .map(|e| e.original_url.clone())
            .unwrap_or_default(),
        None => src.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::ScriptConversion;
    use crate::scraper::images::content_hash;
    use crate::scraper::testing::MockFetcher;
    use scraper::Selector;

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\nbody";
    const BASE: &str = "https://www.esjzone.cc/forum/1/2.html";

    fn normalize_with(
        inner: &str,
        fetcher: &MockFetcher,
        images: &ImageStore,
        converter: ScriptConversion,
    ) -> Option<String> {
        let html = format!(r#"<div class="forum-content">{}</div>"#, inner);
        let doc = Html::parse_fragment(&html);
        let sel = Selector::parse("div.forum-content").unwrap();
        let region = doc.select(&sel).next().unwrap();
        let base = Url::parse(BASE).unwrap();
        ContentNormalizer::new(fetcher, images, &converter, &base).normalize(region)
    }

    fn normalize(inner: &str) -> Option<String> {
        normalize_with(
            inner,
            &MockFetcher::new(),
            &ImageStore::new(),
            ScriptConversion::Off,
        )
    }

    #[test]
    fn paragraphs_become_trimmed_escaped_lines() {
        let out = normalize("<p>  Hello &amp; <b>bye</b> </p>\n<p>   </p><div>a\n\n b</div>");
        assert_eq!(
            out.as_deref(),
            Some("<p>Hello &amp;</p>\n<p>bye</p>\n<p>a</p>\n<p>b</p>\n")
        );
    }

    #[test]
    fn text_is_script_converted() {
        let out = normalize_with(
            "<p>漢字</p>",
            &MockFetcher::new(),
            &ImageStore::new(),
            ScriptConversion::ToSimplified,
        );
        assert_eq!(out.as_deref(), Some("<p>汉字</p>\n"));
    }

    #[test]
    fn bare_text_under_region_is_kept() {
        assert_eq!(normalize("loose text").as_deref(), Some("<p>loose text</p>\n"));
    }

    #[test]
    fn blank_content_yields_none_and_placeholder() {
        assert_eq!(normalize("<p> </p><br/><div>\n</div>"), None);
        let fetcher = MockFetcher::new();
        let images = ImageStore::new();
        let html = Html::parse_fragment(r#"<div id="r"><p> </p></div>"#);
        let sel = Selector::parse("#r").unwrap();
        let base = Url::parse(BASE).unwrap();
        let region = html.select(&sel).next().unwrap();
        let converter = ScriptConversion::Off;
        let normalizer = ContentNormalizer::new(&fetcher, &images, &converter, &base);
        assert_eq!(normalizer.normalize_or_empty(region), EMPTY_PLACEHOLDER);
    }

    #[test]
    fn links_get_href_line_first() {
        let out = normalize(r#"<p>see <a href="https://x.test/a">here</a></p>"#);
        assert_eq!(
            out.as_deref(),
            Some("<p>see</p>\n<p>[https://x.test/a]</p>\n<p>here</p>\n")
        );
    }

    #[test]
    fn images_are_stored_and_replaced_by_tokens() {
        let fetcher = MockFetcher::new().with("https://www.esjzone.cc/img/1.png", None, PNG);
        let images = ImageStore::new();
        let out = normalize_with(
            r#"<p>before</p><div><span><img src="/img/1.png"></span> caption</div><img src="https://gone.test/x.jpg">"#,
            &fetcher,
            &images,
            ScriptConversion::Off,
        );
        let hash = content_hash(PNG);
        assert_eq!(
            out,
            Some(format!(
                "<p>before</p>\n<img src=\"esj-image:{}\" alt=\"\"/>\n<p>caption</p>\n<p>Image download failed: https://gone.test/x.jpg</p>\n",
                hash
            ))
        );
        assert_eq!(images.len(), 1);
    }

    #[test]
    fn annotate_links_is_idempotent() {
        let markup = r#"<p>a <a href="https://x.test/?a=1&amp;b=2">link</a> <a href='/rel'>r</a> <a name="n">n</a></p>"#;
        let once = annotate_links(markup);
        let twice = annotate_links(&once);
        assert_eq!(once, twice);
        assert!(once.contains(r#"<a href="https://x.test/?a=1&amp;b=2" data-href-annotated=""><p>[https://x.test/?a=1&amp;b=2]</p>link</a>"#));
        assert!(once.contains(r#"<a href='/rel' data-href-annotated=""><p>[/rel]</p>r</a>"#));
        assert!(once.contains(r#"<a name="n">n</a>"#));
    }

    #[test]
    fn normalizing_annotated_markup_matches_original() {
        let markup = concat!(
            r#"<div>intro <a href="https://x.test/a">go</a></div><div><a href="/b">b</a></div>"#,
            r#"<div><a href="https://x.test/c">[https://x.test/c]</a></div>"#,
            r#"<div><a href="https://x.test/d"><span>  [https://x.test/d]</span> more</a></div>"#,
        );
        let annotated = annotate_links(markup);
        assert_eq!(normalize(markup), normalize(&annotated));
        assert!(!annotated.contains("<p>[https://x.test/c]</p>"));
        assert!(!annotated.contains("<p>[https://x.test/d]</p>"));
    }

    #[test]
    fn link_text_already_showing_href_is_not_annotated() {
        let out = normalize(r#"<p><a href="https://x.test/a">[https://x.test/a]</a></p>"#);
        assert_eq!(out.as_deref(), Some("<p>[https://x.test/a]</p>\n"));
    }

    #[test]
    fn plain_text_replaces_images_with_original_url() {
        let fetcher = MockFetcher::new().with("https://img.test/a.png", None, PNG);
        let images = ImageStore::new();
        let markup = format!(
            "<p>one</p>\n{}\n{}\n<p>two &amp; three</p>\n",
            images.resolve(&fetcher, "https://img.test/a.png").to_markup(),
            ImageRef::Failed("https://bad.test/b".into()).to_markup()
        );
        let text = plain_text_with_store(&markup, &images);
        assert_eq!(
            text,
            "one\nhttps://img.test/a.png\nImage download failed: https://bad.test/b\ntwo & three\n"
        );
    }

    #[test]
    fn escape_covers_markup_characters() {
        assert_eq!(
            escape_html(r#"<a href="x">'&'</a>"#),
            "&lt;a href=&quot;x&quot;&gt;&#39;&amp;&#39;&lt;/a&gt;"
        );
    }
}
