//! Chapter-list parsing: turns the irregular markup of a book's chapter list into a
//! flat, pre-order list of volume and chapter nodes with parent indices.
//!
//! Every element is classified up front into [Entry] and then dispatched exhaustively:
//!
//! 1. `<details>` is a volume titled by its `<summary>` (fallback `Volume`); the
//!    remaining children are nested one level deeper.
//! 2. A non-blank `<p>` is an implicit heading: a volume owning every following
//!    sibling up to the next non-blank `<p>` sibling.
//! 3. `<a>` is a chapter.
//! 4. Anything else contributes no node.

use crate::convert::ScriptConvert;
use crate::model::Node;
use crate::scraper::resolve_url;
use reqwest::Url;
use scraper::ElementRef;

/// Title given to a `<details>` section whose label is missing or blank.
pub const FALLBACK_VOLUME_TITLE: &str = "Volume";
const UNTITLED_CHAPTER: &str = "Untitled";

/// Result of parsing a chapter list.
#[derive(Debug)]
pub struct ParsedTree {
    pub nodes: Vec<Node>,
    /// Deepest `level` reached (0 for a flat or empty list).
    pub depth: u32,
}

enum Entry<'a> {
    Section {
        label: Option<String>,
        children: Vec<ElementRef<'a>>,
    },
    Heading(String),
    Link {
        text: String,
        href: Option<String>,
    },
    Skip,
}

fn text_of(el: ElementRef<'_>) -> String {
    el.text().collect()
}

fn is_blank(s: &str) -> bool {
    s.chars().all(char::is_whitespace)
}

fn is_heading(el: ElementRef<'_>) -> bool {
    el.value().name() == "p" && !is_blank(&text_of(el))
}

fn classify(el: ElementRef<'_>) -> Entry<'_> {
    match el.value().name() {
        "details" => {
            let mut label = None;
            let mut children = Vec::new();
            for child in el.children().filter_map(ElementRef::wrap) {
                if label.is_none() && child.value().name() == "summary" {
                    label = Some(text_of(child));
                } else {
                    children.push(child);
                }
            }
            Entry::Section { label, children }
        }
        "p" => {
            let text = text_of(el);
            if is_blank(&text) {
                Entry::Skip
            } else {
                Entry::Heading(text)
            }
        }
        "a" => Entry::Link {
            text: text_of(el),
            href: el.value().attr("href").map(String::from),
        },
        _ => Entry::Skip,
    }
}

/// Index of the next heading sibling at or after `from`, or `elements.len()`.
fn next_heading(elements: &[ElementRef<'_>], from: usize) -> usize {
    elements[from..]
        .iter()
        .position(|el| is_heading(*el))
        .map_or(elements.len(), |offset| from + offset)
}

/// Chapter-list parser. Links are resolved against `base`; titles are converted.
pub struct TreeParser<'a> {
    base: &'a Url,
    converter: &'a dyn ScriptConvert,
}

impl<'a> TreeParser<'a> {
    pub fn new(base: &'a Url, converter: &'a dyn ScriptConvert) -> Self {
        Self { base, converter }
    }

    /// Parse the element children of a chapter-list container.
    pub fn parse_children(&self, container: ElementRef<'_>) -> ParsedTree {
        let children: Vec<ElementRef<'_>> =
            container.children().filter_map(ElementRef::wrap).collect();
        self.parse(&children)
    }

    /// Parse a sequence of sibling elements starting at level 0.
    pub fn parse(&self, elements: &[ElementRef<'_>]) -> ParsedTree {
        self.parse_at(elements, 0)
    }

    /// Parse top-level siblings placed at `level`. Depth is `level` for empty input.
    pub fn parse_at(&self, elements: &[ElementRef<'_>], level: u32) -> ParsedTree {
        let mut nodes = Vec::new();
        let depth = self.parse_level(elements, level, None, &mut nodes);
        ParsedTree { nodes, depth }
    }

    fn parse_level(
        &self,
        elements: &[ElementRef<'_>],
        level: u32,
        parent: Option<usize>,
        nodes: &mut Vec<Node>,
    ) -> u32 {
        let mut depth = level;
        let mut i = 0;
        while i < elements.len() {
            match classify(elements[i]) {
                Entry::Section { label, children } => {
                    let index = nodes.len();
                    let title = label
                        .map(|l| self.clean(&l))
                        .filter(|t| !t.is_empty())
                        .unwrap_or_else(|| FALLBACK_VOLUME_TITLE.to_string());
                    nodes.push(Node::volume(index, level, parent, title));
                    depth = depth.max(self.parse_level(&children, level + 1, Some(index), nodes));
                    i += 1;
                }
                Entry::Heading(text) => {
                    let index = nodes.len();
                    nodes.push(Node::volume(index, level, parent, self.clean(&text)));
                    let end = next_heading(elements, i + 1);
                    depth = depth.max(self.parse_level(
                        &elements[i + 1..end],
                        level + 1,
                        Some(index),
                        nodes,
                    ));
                    i = end;
                }
                Entry::Link { text, href } => {
                    let index = nodes.len();
                    let source_url = href
                        .map(|h| resolve_url(self.base, &h))
                        .unwrap_or_default();
                    let mut title = self.clean(&text);
                    if title.is_empty() {
                        title = if source_url.is_empty() {
                            UNTITLED_CHAPTER.to_string()
                        } else {
                            source_url.clone()
                        };
                    }
                    nodes.push(Node::chapter(index, level, parent, title, source_url));
                    i += 1;
                }
                Entry::Skip => i += 1,
            }
        }
        depth
    }

    /// Collapse whitespace runs, then convert script.
    fn clean(&self, text: &str) -> String {
        let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
        self.converter.convert(&collapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::ScriptConversion;
    use crate::model::NodeKind;
    use scraper::{Html, Selector};

    const BASE: &str = "https://www.esjzone.cc/detail/1.html";

    fn parse_list(inner: &str, converter: ScriptConversion) -> ParsedTree {
        let html = format!(r#"<div id="chapterList">{}</div>"#, inner);
        let doc = Html::parse_fragment(&html);
        let sel = Selector::parse("#chapterList").unwrap();
        let list = doc.select(&sel).next().unwrap();
        let base = Url::parse(BASE).unwrap();
        TreeParser::new(&base, &converter).parse_children(list)
    }

    fn shape(tree: &ParsedTree) -> Vec<(NodeKind, u32, Option<usize>, String)> {
        tree.nodes
            .iter()
            .map(|n| (n.kind, n.level, n.parent, n.title.clone()))
            .collect()
    }

    fn assert_parent_invariant(tree: &ParsedTree) {
        for (i, node) in tree.nodes.iter().enumerate() {
            assert_eq!(node.index, i);
            if let Some(p) = node.parent {
                assert!(p < node.index, "parent {} not before {}", p, node.index);
                assert!(tree.nodes[p].is_volume());
                assert_eq!(tree.nodes[p].level + 1, node.level);
            } else {
                assert_eq!(node.level, 0);
            }
        }
    }

    #[test]
    fn headings_group_following_links() {
        let tree = parse_list(
            r#"<p>Vol 1</p><a href="/a">Ch1</a><a href="/b">Ch2</a><p>Vol 2</p><a href="/c">Ch3</a>"#,
            ScriptConversion::Off,
        );
        assert_eq!(
            shape(&tree),
            vec![
                (NodeKind::Volume, 0, None, "Vol 1".to_string()),
                (NodeKind::Chapter, 1, Some(0), "Ch1".to_string()),
                (NodeKind::Chapter, 1, Some(0), "Ch2".to_string()),
                (NodeKind::Volume, 0, None, "Vol 2".to_string()),
                (NodeKind::Chapter, 1, Some(3), "Ch3".to_string()),
            ]
        );
        assert_eq!(tree.depth, 1);
        assert_eq!(tree.nodes[1].source_url, "https://www.esjzone.cc/a");
        assert_eq!(tree.nodes[4].source_url, "https://www.esjzone.cc/c");
        assert_parent_invariant(&tree);
    }

    #[test]
    fn unlabeled_details_gets_fallback_title() {
        let tree = parse_list(
            r#"<details><a href="/forum/1/2.html">Ch</a></details>"#,
            ScriptConversion::Off,
        );
        assert_eq!(
            shape(&tree),
            vec![
                (NodeKind::Volume, 0, None, FALLBACK_VOLUME_TITLE.to_string()),
                (NodeKind::Chapter, 1, Some(0), "Ch".to_string()),
            ]
        );
        assert_eq!(tree.depth, 1);
    }

    #[test]
    fn whitespace_summary_is_fallback_and_not_a_child() {
        let tree = parse_list(
            r#"<details><summary>   </summary><a href="/x">X</a></details>"#,
            ScriptConversion::Off,
        );
        assert_eq!(tree.nodes.len(), 2);
        assert_eq!(tree.nodes[0].title, FALLBACK_VOLUME_TITLE);
        assert_eq!(tree.nodes[1].parent, Some(0));
    }

    #[test]
    fn labeled_details_uses_summary_text() {
        let tree = parse_list(
            r#"<details><summary> 第一卷
              序章 </summary><a href="/x">X</a></details>"#,
            ScriptConversion::Off,
        );
        assert_eq!(tree.nodes[0].title, "第一卷 序章");
    }

    #[test]
    fn nested_containers_do_not_end_heading_run() {
        let tree = parse_list(
            r#"<p>Vol</p>
               <details><summary>Inner</summary><p>Sub</p><a href="/1">A</a></details>
               <a href="/2">B</a>
               <p>Next</p><a href="/3">C</a>"#,
            ScriptConversion::Off,
        );
        assert_eq!(
            shape(&tree),
            vec![
                (NodeKind::Volume, 0, None, "Vol".to_string()),
                (NodeKind::Volume, 1, Some(0), "Inner".to_string()),
                (NodeKind::Volume, 2, Some(1), "Sub".to_string()),
                (NodeKind::Chapter, 3, Some(2), "A".to_string()),
                (NodeKind::Chapter, 1, Some(0), "B".to_string()),
                (NodeKind::Volume, 0, None, "Next".to_string()),
                (NodeKind::Chapter, 1, Some(5), "C".to_string()),
            ]
        );
        assert_eq!(tree.depth, 3);
        assert_parent_invariant(&tree);
    }

    #[test]
    fn blank_paragraphs_and_unknown_elements_are_skipped() {
        let tree = parse_list(
            r#"<p>  </p><br/><div><a href="/hidden">hidden</a></div><span>x</span><a href="/a">A</a>"#,
            ScriptConversion::Off,
        );
        assert_eq!(
            shape(&tree),
            vec![(NodeKind::Chapter, 0, None, "A".to_string())]
        );
        assert_eq!(tree.depth, 0);
    }

    #[test]
    fn blank_paragraph_does_not_end_heading_run() {
        let tree = parse_list(
            r#"<p>Vol</p><a href="/1">A</a><p> </p><a href="/2">B</a>"#,
            ScriptConversion::Off,
        );
        assert_eq!(tree.nodes.len(), 3);
        assert_eq!(tree.nodes[2].parent, Some(0));
    }

    #[test]
    fn empty_list_has_depth_zero() {
        let tree = parse_list("", ScriptConversion::Off);
        assert!(tree.nodes.is_empty());
        assert_eq!(tree.depth, 0);
    }

    #[test]
    fn parse_at_offsets_levels() {
        let doc = Html::parse_fragment(r#"<div id="l"><p>Vol</p><a href="/a">Ch</a></div>"#);
        let sel = Selector::parse("#l").unwrap();
        let list = doc.select(&sel).next().unwrap();
        let children: Vec<ElementRef<'_>> = list.children().filter_map(ElementRef::wrap).collect();
        let base = Url::parse(BASE).unwrap();
        let converter = ScriptConversion::Off;
        let parser = TreeParser::new(&base, &converter);
        let tree = parser.parse_at(&children, 2);
        assert_eq!(tree.nodes[0].level, 2);
        assert_eq!(tree.nodes[1].level, 3);
        assert_eq!(tree.depth, 3);
        assert_eq!(parser.parse_at(&[], 2).depth, 2);
    }

    #[test]
    fn links_keep_absolute_href_and_fall_back_for_missing_text() {
        let tree = parse_list(
            r#"<a href="https://other.example/x">  </a><a>No href</a>"#,
            ScriptConversion::Off,
        );
        assert_eq!(tree.nodes[0].source_url, "https://other.example/x");
        assert_eq!(tree.nodes[0].title, "https://other.example/x");
        assert_eq!(tree.nodes[1].source_url, "");
        assert_eq!(tree.nodes[1].title, "No href");
    }

    #[test]
    fn titles_are_script_converted() {
        let tree = parse_list(
            r#"<p>第一卷 漢字</p><a href="/1">第一話 開始</a>"#,
            ScriptConversion::ToSimplified,
        );
        assert_eq!(tree.nodes[0].title, "第一卷 汉字");
        assert_eq!(tree.nodes[1].title, "第一话 开始");
    }

    #[test]
    fn parsing_is_deterministic() {
        let markup = r#"<p>A</p><details><summary>B</summary><a href="/1">1</a>
            <p>C</p><a href="/2">2</a></details><a href="/3">3</a>"#;
        let first = parse_list(markup, ScriptConversion::Off);
        let second = parse_list(markup, ScriptConversion::Off);
        assert_eq!(shape(&first), shape(&second));
        assert_eq!(first.depth, second.depth);
        let urls = |t: &ParsedTree| {
            t.nodes
                .iter()
                .map(|n| n.source_url.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(urls(&first), urls(&second));
        assert_parent_invariant(&first);
    }
}
