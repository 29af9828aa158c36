//! Chapter selection by 0-based chapter ordinal, and the chapter listing.
//!
//! Ordinals count chapters only; volumes are never numbered.

use crate::model::Node;

/// Which chapters to download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChapterSelection {
    /// Inclusive ordinal range.
    Range { start: usize, end: usize },
    /// Sorted, disjoint, non-adjacent inclusive spans.
    List(Vec<(usize, usize)>),
}

fn parse_ordinal(s: &str) -> Result<usize, String> {
    s.trim()
        .parse::<usize>()
        .map_err(|_| format!("invalid chapter number {:?}", s.trim()))
}

fn parse_span(part: &str) -> Result<(usize, usize), String> {
    match part.split_once('-') {
        Some((a, b)) => {
            let (start, end) = (parse_ordinal(a)?, parse_ordinal(b)?);
            if start > end {
                return Err(format!("range start {} is after end {}", start, end));
            }
            Ok((start, end))
        }
        None => {
            let n = parse_ordinal(part)?;
            Ok((n, n))
        }
    }
}

impl ChapterSelection {
    /// Parse `"3-9"` (inclusive range) or `"1,5,7"` / `"0,4-6"` (list).
    pub fn parse(s: &str) -> Result<Self, String> {
        let parts: Vec<&str> = s
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();
        match parts.as_slice() {
            [] => Err("empty chapter selection".to_string()),
            [single] if single.contains('-') => {
                let (start, end) = parse_span(single)?;
                Ok(ChapterSelection::Range { start, end })
            }
            _ => {
                let mut spans = parts
                    .iter()
                    .map(|p| parse_span(p))
                    .collect::<Result<Vec<_>, _>>()?;
                spans.sort_unstable();
                let mut merged: Vec<(usize, usize)> = Vec::with_capacity(spans.len());
                for (start, end) in spans {
                    match merged.last_mut() {
                        Some(last) if start <= last.1.saturating_add(1) => {
                            last.1 = last.1.max(end)
                        }
                        _ => merged.push((start, end)),
                    }
                }
                Ok(ChapterSelection::List(merged))
            }
        }
    }

    pub fn contains(&self, ordinal: usize) -> bool {
        match self {
            ChapterSelection::Range { start, end } => (*start..=*end).contains(&ordinal),
            ChapterSelection::List(spans) => {
                let i = spans.partition_point(|&(_, end)| end < ordinal);
                spans.get(i).is_some_and(|&(start, _)| start <= ordinal)
            }
        }
    }

    /// Smallest and largest requested ordinal.
    pub fn bounds(&self) -> Option<(usize, usize)> {
        match self {
            ChapterSelection::Range { start, end } => Some((*start, *end)),
            ChapterSelection::List(spans) => Some((spans.first()?.0, spans.last()?.1)),
        }
    }

    /// Number of requested ordinals at or beyond `chapter_count`, saturating at `usize::MAX`.
    pub fn out_of_range(&self, chapter_count: usize) -> usize {
        match self {
            ChapterSelection::Range { start, end } => span_beyond(*start, *end, chapter_count),
            ChapterSelection::List(spans) => spans.iter().fold(0usize, |acc, &(start, end)| {
                acc.saturating_add(span_beyond(start, end, chapter_count))
            }),
        }
    }
}

fn span_beyond(start: usize, end: usize, chapter_count: usize) -> usize {
    if end < chapter_count {
        0
    } else {
        (end - start.max(chapter_count)).saturating_add(1)
    }
}

/// Mark chapters outside `selection` as unselected. Returns how many requested
/// ordinals did not match any chapter.
pub fn apply_selection(nodes: &mut [Node], selection: &ChapterSelection) -> usize {
    let mut count = 0;
    for (ordinal, node) in nodes.iter_mut().filter(|n| n.is_chapter()).enumerate() {
        node.selected = selection.contains(ordinal);
        count += 1;
    }
    selection.out_of_range(count)
}

/// Human-readable chapter list: `[ordinal] title` for chapters, `[Volume] title` for
/// volumes, indented by level, followed by the chapter total.
pub fn format_listing(nodes: &[Node]) -> String {
    let mut out = String::new();
    let mut ordinal = 0;
    for node in nodes {
        let indent = "  ".repeat(node.level as usize);
        if node.is_chapter() {
            out.push_str(&format!("[{}] {}{}\n", ordinal, indent, node.title));
            ordinal += 1;
        } else {
            out.push_str(&format!("{}[Volume] {}\n", indent, node.title));
        }
    }
    out.push_str(&format!("Total: {} chapters\n", ordinal));
    out
}
