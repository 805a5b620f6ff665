use crate::types::{DocItem, DocItemKind, EnrichedChunk, ParsedDocument, ProvisionalChunk};

/// Rough token estimate used as the chunking budget unit. The splitter
/// knobs below are expressed in tokens and converted with the same proxy.
pub(crate) fn estimate_tokens(text: &str) -> usize {
    text.len() / 4
}

/// Layout-aware hierarchical chunker. Sections follow the document's
/// heading tree; small sibling sections are merged so chunks do not
/// degenerate into single paragraphs.
pub struct LayoutChunker {
    token_budget: usize,
    merge_under_chars: usize,
}

impl LayoutChunker {
    pub fn new(token_budget: usize, merge_under_chars: usize) -> Self {
        Self {
            token_budget,
            merge_under_chars,
        }
    }

    pub fn chunk(&self, doc: &ParsedDocument) -> Vec<ProvisionalChunk> {
        let mut chunks: Vec<ProvisionalChunk> = Vec::new();
        let mut heading_stack: Vec<String> = Vec::new();
        let mut section = SectionBuffer::default();

        for (idx, item) in doc.items.iter().enumerate() {
            match &item.kind {
                DocItemKind::Heading { level } => {
                    section.flush_into(&mut chunks, &heading_stack);
                    let depth = (*level).max(1) as usize;
                    heading_stack.truncate(depth - 1);
                    heading_stack.push(item.text.trim().to_string());
                }
                DocItemKind::Text | DocItemKind::Table => {
                    if item.text.trim().is_empty() {
                        continue;
                    }
                    let projected = section.token_len + estimate_tokens(&item.text);
                    if !section.is_empty() && projected > self.token_budget {
                        section.flush_into(&mut chunks, &heading_stack);
                    }
                    section.push(idx, item);
                }
                // Pictures attach during structural enrichment, by bbox.
                DocItemKind::Picture => {}
            }
        }
        section.flush_into(&mut chunks, &heading_stack);

        self.merge_small_siblings(chunks)
    }

    /// Fold undersized chunks into their predecessor, keeping the
    /// predecessor's heading path.
    fn merge_small_siblings(&self, chunks: Vec<ProvisionalChunk>) -> Vec<ProvisionalChunk> {
        let mut merged: Vec<ProvisionalChunk> = Vec::new();

        for chunk in chunks {
            let is_small = chunk.text.len() < self.merge_under_chars;
            match merged.last_mut() {
                Some(previous) if is_small => {
                    previous.text.push_str("\n\n");
                    previous.text.push_str(&chunk.text);
                    previous.pages.extend(chunk.pages);
                    previous.pages.sort_unstable();
                    previous.pages.dedup();
                    previous.item_indices.extend(chunk.item_indices);
                }
                _ => merged.push(chunk),
            }
        }

        merged
    }
}

#[derive(Default)]
struct SectionBuffer {
    parts: Vec<String>,
    pages: Vec<u32>,
    item_indices: Vec<usize>,
    token_len: usize,
}

impl SectionBuffer {
    fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    fn push(&mut self, idx: usize, item: &DocItem) {
        self.token_len += estimate_tokens(&item.text);
        self.parts.push(item.text.trim().to_string());
        self.pages.push(item.page);
        self.item_indices.push(idx);
    }

    fn flush_into(&mut self, chunks: &mut Vec<ProvisionalChunk>, headings: &[String]) {
        if self.is_empty() {
            return;
        }
        let mut pages = std::mem::take(&mut self.pages);
        pages.sort_unstable();
        pages.dedup();

        chunks.push(ProvisionalChunk {
            text: std::mem::take(&mut self.parts).join("\n\n"),
            headings: headings.to_vec(),
            pages,
            item_indices: std::mem::take(&mut self.item_indices),
        });
        self.token_len = 0;
    }
}

/// Recursive character splitter. Separators are tried in priority order:
/// paragraph break, line break, pipe (table rows), sentence end, space;
/// a split that still exceeds the budget recurses with the remaining
/// separators.
pub struct RecursiveSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl RecursiveSplitter {
    const SEPARATORS: [&'static str; 5] = ["\n\n", "\n", "|", ". ", " "];

    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            chunk_overlap,
        }
    }

    pub fn split(&self, text: &str) -> Vec<String> {
        let pieces = self.split_recursive(text, &Self::SEPARATORS);
        self.merge_pieces(pieces)
    }

    fn split_recursive(&self, text: &str, separators: &[&str]) -> Vec<String> {
        if text.len() <= self.chunk_size {
            return vec![text.to_string()];
        }

        let Some((sep, rest)) = separators.split_first() else {
            return split_by_chars(text, self.chunk_size);
        };
        if !text.contains(sep) {
            return self.split_recursive(text, rest);
        }

        let mut pieces = Vec::new();
        for piece in split_keep_separator(text, sep) {
            if piece.len() > self.chunk_size {
                pieces.extend(self.split_recursive(&piece, rest));
            } else {
                pieces.push(piece);
            }
        }
        pieces
    }

    fn merge_pieces(&self, pieces: Vec<String>) -> Vec<String> {
        let mut chunks: Vec<String> = Vec::new();
        let mut current = String::new();
        // An overlap tail alone never flushes as its own chunk.
        let mut has_content = false;

        for piece in pieces {
            if has_content && current.len() + piece.len() > self.chunk_size {
                let finished = current.trim().to_string();
                current = overlap_tail(&finished, self.chunk_overlap);
                has_content = false;
                if !finished.is_empty() {
                    chunks.push(finished);
                }
            }
            current.push_str(&piece);
            has_content = true;
        }

        let finished = current.trim().to_string();
        if has_content && !finished.is_empty() {
            chunks.push(finished);
        }
        chunks
    }
}

/// Split keeping the separator attached to the end of each piece.
fn split_keep_separator(text: &str, sep: &str) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut rest = text;
    while let Some(pos) = rest.find(sep) {
        let end = pos + sep.len();
        pieces.push(rest[..end].to_string());
        rest = &rest[end..];
    }
    if !rest.is_empty() {
        pieces.push(rest.to_string());
    }
    pieces
}

fn split_by_chars(text: &str, size: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut start = 0;
    while start < text.len() {
        let end = snap_to_char_boundary(text, (start + size).min(text.len()));
        let end = if end <= start { text.len() } else { end };
        pieces.push(text[start..end].to_string());
        start = end;
    }
    pieces
}

/// Tail of `text` used as the overlap prefix of the next chunk, snapped to
/// a char boundary.
fn overlap_tail(text: &str, overlap: usize) -> String {
    if overlap == 0 || text.is_empty() {
        return String::new();
    }
    let start = snap_to_char_boundary(text, text.len().saturating_sub(overlap));
    let mut tail = text[start..].to_string();
    if !tail.is_empty() {
        tail.push(' ');
    }
    tail
}

fn snap_to_char_boundary(text: &str, pos: usize) -> usize {
    if pos >= text.len() {
        return text.len();
    }
    let mut p = pos;
    while p > 0 && !text.is_char_boundary(p) {
        p -= 1;
    }
    p
}

/// Rechunk over-long enriched chunks. The splitter budget is a character
/// proxy of the token knobs (x3). Continuation pieces inherit the base
/// heading with a continuation suffix; pieces that carry table rows are
/// flagged so row cohesion survives downstream prompts.
pub fn split_enriched_chunks(
    chunks: Vec<EnrichedChunk>,
    chunk_size_tokens: usize,
    overlap_tokens: usize,
) -> Vec<EnrichedChunk> {
    let splitter = RecursiveSplitter::new(chunk_size_tokens * 3, overlap_tokens * 3);
    let mut title_counters: std::collections::HashMap<String, usize> =
        std::collections::HashMap::new();
    let mut result: Vec<EnrichedChunk> = Vec::new();

    for original in chunks {
        let base_title = original.heading_full.clone();
        let counter = title_counters.entry(base_title.clone()).or_insert(0);
        let sub_texts = splitter.split(&original.text);
        let last = sub_texts.len().saturating_sub(1);

        for (i, sub_text) in sub_texts.into_iter().enumerate() {
            let mut sub = original.clone();
            let has_table_rows = sub_text.contains('|');
            sub.is_table_cut = has_table_rows && i < last;

            if i == 0 {
                sub.heading_full = if *counter == 0 {
                    base_title.clone()
                } else {
                    format!("{} (Cont. {})", base_title, counter)
                };
            } else if has_table_rows {
                sub.heading_full = format!("{} (Table cont. {})", base_title, i);
                sub.tables = vec![sub_text.clone()];
                sub.is_table_continuation = true;
            } else {
                sub.heading_full = format!("{} (Cont. {})", base_title, i);
                sub.tables = Vec::new();
                sub.images_urls = Vec::new();
            }

            sub.headings = crate::types::headings_from_full(&sub.heading_full);
            sub.text = sub_text;
            *counter += 1;
            result.push(sub);
        }
    }

    for (i, chunk) in result.iter_mut().enumerate() {
        chunk.chunk_index = i as i32;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::join_headings;

    fn doc(items: Vec<DocItem>) -> ParsedDocument {
        ParsedDocument {
            page_count: 3,
            items,
            markdown: String::new(),
            scanned: false,
        }
    }

    fn enriched(index: i32, heading: &str, text: &str) -> EnrichedChunk {
        EnrichedChunk {
            chunk_index: index,
            text: text.to_string(),
            headings: vec![heading.to_string()],
            heading_full: heading.to_string(),
            page_numbers: vec![1],
            tables: vec![],
            images_urls: vec![],
            is_table_continuation: false,
            is_table_cut: false,
        }
    }

    #[test]
    fn sections_follow_the_heading_tree() {
        let chunker = LayoutChunker::new(1500, 10);
        let long_a = "a".repeat(600);
        let long_b = "b".repeat(600);
        let chunks = chunker.chunk(&doc(vec![
            DocItem::heading(1, 1, "Chapter 1"),
            DocItem::heading(1, 2, "Rites"),
            DocItem::text(1, long_a.as_str()),
            DocItem::heading(2, 2, "Stations"),
            DocItem::text(2, long_b.as_str()),
        ]));

        assert_eq!(chunks.len(), 2);
        assert_eq!(join_headings(&chunks[0].headings), "Chapter 1 > Rites");
        assert_eq!(join_headings(&chunks[1].headings), "Chapter 1 > Stations");
        assert_eq!(chunks[1].pages, vec![2]);
    }

    #[test]
    fn table_items_join_their_section() {
        let chunker = LayoutChunker::new(1500, 10);
        let intro = "Hello world. ".repeat(50);
        let chunks = chunker.chunk(&doc(vec![
            DocItem::heading(1, 1, "Intro"),
            DocItem::text(1, intro.as_str()),
            DocItem::table(2, "| a | b |\n|---|---|\n| 1 | 2 |"),
        ]));

        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.contains("| a | b |"));
        assert_eq!(chunks[0].pages, vec![1, 2]);
        assert_eq!(chunks[0].item_indices, vec![1, 2]);
    }

    #[test]
    fn budget_overflow_starts_a_new_chunk() {
        // Budget of 50 tokens ~ 200 chars; two 150-char paragraphs split.
        let chunker = LayoutChunker::new(50, 10);
        let para = "x".repeat(150);
        let chunks = chunker.chunk(&doc(vec![
            DocItem::text(1, para.as_str()),
            DocItem::text(1, para.as_str()),
        ]));
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn small_siblings_merge_into_predecessor() {
        let chunker = LayoutChunker::new(1500, 500);
        let body = "y".repeat(600);
        let chunks = chunker.chunk(&doc(vec![
            DocItem::heading(1, 1, "Intro"),
            DocItem::text(1, body.as_str()),
            DocItem::heading(2, 1, "Tiny"),
            DocItem::text(2, "short."),
        ]));

        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.contains("short."));
        assert_eq!(chunks[0].pages, vec![1, 2]);
    }

    #[test]
    fn splitter_prefers_paragraph_breaks() {
        let splitter = RecursiveSplitter::new(40, 0);
        let text = "first paragraph here.\n\nsecond paragraph here.\n\nthird one.";
        let pieces = splitter.split(text);
        assert!(pieces.len() >= 2);
        assert!(pieces[0].starts_with("first paragraph"));
        // No piece materially exceeds the budget.
        assert!(pieces.iter().all(|p| p.len() <= 60));
    }

    #[test]
    fn splitter_short_text_is_untouched() {
        let splitter = RecursiveSplitter::new(100, 10);
        assert_eq!(splitter.split("short"), vec!["short".to_string()]);
    }

    #[test]
    fn splitter_handles_multibyte_text() {
        let splitter = RecursiveSplitter::new(20, 4);
        let text = "été répété ".repeat(10);
        for piece in splitter.split(&text) {
            // Would panic on a non-boundary slice; also keep sizes sane.
            assert!(piece.len() <= 40);
        }
    }

    #[test]
    fn table_continuations_are_flagged() {
        let row = "| cell one | cell two | cell three |\n";
        let table = row.repeat(40);
        let chunks = split_enriched_chunks(vec![enriched(0, "Rates", &table)], 100, 10);

        assert!(chunks.len() > 1);
        assert!(chunks[0].is_table_cut);
        assert!(!chunks[0].is_table_continuation);
        let tail = &chunks[chunks.len() - 1];
        assert!(tail.is_table_continuation);
        assert!(tail.heading_full.contains("(Table cont."));
        assert_eq!(tail.tables.len(), 1);
    }

    #[test]
    fn text_continuations_drop_tables_and_images() {
        let mut chunk = enriched(0, "Notes", &"plain text sentence. ".repeat(60));
        chunk.tables = vec!["| a | b |".to_string()];
        chunk.images_urls = vec!["http://blobs/x.jpg".to_string()];

        let chunks = split_enriched_chunks(vec![chunk], 100, 10);
        assert!(chunks.len() > 1);
        // First piece keeps the original attachments.
        assert_eq!(chunks[0].tables.len(), 1);
        // Later plain-text pieces carry none.
        assert!(chunks[1].tables.is_empty());
        assert!(chunks[1].images_urls.is_empty());
        assert!(chunks[1].heading_full.contains("(Cont."));
    }

    #[test]
    fn chunk_indices_are_sequential_after_splitting() {
        let chunks = split_enriched_chunks(
            vec![
                enriched(0, "A", &"sentence one. ".repeat(80)),
                enriched(1, "B", "tiny"),
            ],
            100,
            10,
        );
        let indices: Vec<i32> = chunks.iter().map(|c| c.chunk_index).collect();
        let expected: Vec<i32> = (0..chunks.len() as i32).collect();
        assert_eq!(indices, expected);
    }

    #[test]
    fn repeated_headings_get_continuation_numbers() {
        let chunks = split_enriched_chunks(
            vec![
                enriched(0, "Same", "first body"),
                enriched(1, "Same", "second body"),
            ],
            100,
            10,
        );
        assert_eq!(chunks[0].heading_full, "Same");
        assert_eq!(chunks[1].heading_full, "Same (Cont. 1)");
    }
}
