//! Document identity card: a compact, generator-written summary of the
//! document's title, type, subject, structure, themes and context. Exactly
//! one per document, persisted with the sentinel chunk index.

use anyhow::Result;
use std::sync::Arc;

use crate::llm::{ContentPart, GenerationRequest, Generator};
use crate::types::{DocItemKind, ParsedDocument};

/// Search window (lines) at the head and tail of the document when
/// looking for an explicit table of contents.
const TOC_SEARCH_ZONE_LINES: usize = 200;
/// Lines captured after a TOC keyword match.
const TOC_WINDOW_LINES: usize = 50;
/// Cap on headings collected for the estimated-structure fallback.
const MAX_FALLBACK_HEADINGS: usize = 60;
const MAX_HEADING_CHARS: usize = 120;
/// Character cap on the sampled excerpts fed to the generator.
const SAMPLE_MAX_CHARS: usize = 10_000;
const SAMPLE_PARAGRAPHS: usize = 15;

const TOC_KEYWORDS: [&str; 4] = [
    "table of contents",
    "contents",
    "sommaire",
    "table des matières",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TocKind {
    /// Found an explicit TOC block near the head or tail.
    Official,
    /// Reconstructed from document headings.
    Estimated,
    Absent,
}

#[derive(Debug, Clone)]
pub struct TocBlock {
    pub kind: TocKind,
    pub content: String,
}

impl TocBlock {
    fn label(&self) -> &'static str {
        match self.kind {
            TocKind::Official => "TABLE OF CONTENTS",
            TocKind::Estimated => "DETECTED STRUCTURE (main headings)",
            TocKind::Absent => "UNKNOWN STRUCTURE",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SampledText {
    pub text: String,
    /// Symbolic sampling marker: empty when the whole document fit, `[0]`
    /// when head/middle/tail sampling applied.
    pub pages_sampled: Vec<i32>,
}

#[derive(Debug, Clone)]
pub struct IdentityCard {
    pub text: String,
    pub pages_sampled: Vec<i32>,
}

/// Look for an explicit TOC near the document head or tail; fall back to
/// collected headings.
pub fn extract_table_of_contents(doc: &ParsedDocument) -> TocBlock {
    let lines: Vec<&str> = doc.markdown.lines().collect();
    let total = lines.len();

    let head: &[&str] = &lines[..total.min(TOC_SEARCH_ZONE_LINES)];
    let tail: &[&str] = if total > TOC_SEARCH_ZONE_LINES {
        &lines[total - TOC_SEARCH_ZONE_LINES..]
    } else {
        &[]
    };

    for zone in [head, tail] {
        for (i, line) in zone.iter().enumerate() {
            let lowered = line.trim().to_lowercase();
            if TOC_KEYWORDS.iter().any(|kw| lowered.contains(kw)) {
                let window = &zone[i..zone.len().min(i + TOC_WINDOW_LINES)];
                let content: Vec<&str> = window
                    .iter()
                    .map(|l| l.trim())
                    .filter(|l| !l.is_empty())
                    .collect();
                return TocBlock {
                    kind: TocKind::Official,
                    content: content.join("\n"),
                };
            }
        }
    }

    // No explicit TOC: reconstruct from headings, first level preferred.
    let mut headings: Vec<&str> = doc
        .items
        .iter()
        .filter(|item| matches!(item.kind, DocItemKind::Heading { level: 1 }))
        .map(|item| item.text.trim())
        .filter(|text| !text.is_empty() && text.len() < MAX_HEADING_CHARS)
        .take(MAX_FALLBACK_HEADINGS)
        .collect();

    if headings.is_empty() {
        headings = doc
            .items
            .iter()
            .filter(|item| matches!(item.kind, DocItemKind::Heading { .. }))
            .map(|item| item.text.trim())
            .filter(|text| !text.is_empty() && text.len() < MAX_HEADING_CHARS)
            .take(MAX_FALLBACK_HEADINGS)
            .collect();
    }

    if headings.is_empty() {
        TocBlock {
            kind: TocKind::Absent,
            content: "Not detected".to_string(),
        }
    } else {
        TocBlock {
            kind: TocKind::Estimated,
            content: headings.join("\n"),
        }
    }
}

/// Sample the flattened markdown: the whole document when it fits, else
/// leading, centered and trailing paragraph runs with elision markers.
pub fn sample_document(markdown: &str) -> SampledText {
    if markdown.len() <= SAMPLE_MAX_CHARS {
        return SampledText {
            text: markdown.to_string(),
            pages_sampled: Vec::new(),
        };
    }

    let paragraphs: Vec<&str> = markdown.split("\n\n").collect();
    let total = paragraphs.len();
    let mid = total / 2;

    let start = &paragraphs[..total.min(SAMPLE_PARAGRAPHS)];
    let mid_lo = mid.saturating_sub(SAMPLE_PARAGRAPHS / 2);
    let mid_hi = total.min(mid_lo + SAMPLE_PARAGRAPHS);
    let middle = &paragraphs[mid_lo..mid_hi];
    let end = &paragraphs[total.saturating_sub(SAMPLE_PARAGRAPHS)..];

    let sampled = format!(
        "--- DOCUMENT START ---\n{}\n\n... [MIDDLE CONTENT] ...\n\n{}\n\n... [FINAL CONTENT] ...\n\n{}\n--- DOCUMENT END ---",
        start.join("\n\n"),
        middle.join("\n\n"),
        end.join("\n\n"),
    );

    SampledText {
        text: truncate_chars(&sampled, SAMPLE_MAX_CHARS),
        pages_sampled: vec![0],
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

const CARD_SEPARATOR: &str = "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━";

pub fn build_identity_prompt(title: &str, toc: &TocBlock, sample: &SampledText) -> String {
    let context_instruction = match toc.kind {
        TocKind::Official => {
            "Use the official table of contents below to understand the exact organization of the document."
        }
        _ => {
            "Note: no official table of contents was found. Below is a list of headings extracted from the body to give you an idea of the structure."
        }
    };

    format!(
        r#"You are an assistant specialized in writing ultra-condensed IDENTITY CARDS for study documents.

DOCUMENT UNDER ANALYSIS:
Title: {title}

STRUCTURE PROVIDED ({label}):
{toc_content}

DOCUMENT EXCERPTS:
{sample_text}

{separator}
TASK: Write an ultra-condensed IDENTITY CARD (MAX 400 words).
YOU MUST USE A LINE BREAK BETWEEN EVERY ELEMENT.
{context_instruction}
{separator}

STRICT FORMAT TO FOLLOW:

{separator}
DOCUMENT IDENTITY CARD
{separator}

TITLE: [exact title]
TYPE: [biography / course / essay / etc.]
SUBJECT: [2-3 sentences summarizing what the document is about]

DOCUMENT STRUCTURE (TABLE OF CONTENTS / HEADING LIST):
(Each chapter/heading MUST be on its own line with a dash)
- 1. [Chapter name] (p.[number])
- 2. [Chapter name] (p.[number])
...

KEY THEMES: [3-5 keywords separated by commas]

CONTEXT: [period, place, setting if found in the sampled pages - 1-2 lines max]

{separator}

GOLDEN LAYOUT RULES:
1. Compact text paragraphs are FORBIDDEN for the structure section.
2. ONE CHAPTER = ONE LINE. This is crucial for semantic distinction.
3. Never mix names of people or sections on the same line.
4. Page numbers are ESSENTIAL.
5. Ultra-scannable format for an LLM and a reranker.

START DIRECTLY WITH "{separator}" (no preamble)."#,
        title = title,
        label = toc.label(),
        toc_content = toc.content,
        sample_text = sample.text,
        separator = CARD_SEPARATOR,
        context_instruction = context_instruction,
    )
}

/// Deterministic card used when the generator fails.
pub fn fallback_identity(title: &str, toc_content: &str) -> String {
    let structured_toc = toc_content.replace(". ", ".\n- ");
    format!(
        r#"{sep}
DOCUMENT IDENTITY CARD
{sep}

TITLE: {title}
TYPE: Study document
SUBJECT: Content pending analysis

DOCUMENT STRUCTURE:
- {toc}

KEY THEMES: To be determined
CONTEXT: Not detected

{sep}"#,
        sep = CARD_SEPARATOR,
        title = if title.is_empty() { "Untitled" } else { title },
        toc = structured_toc,
    )
}

/// Generate the identity card for a parsed document, degrading to the
/// deterministic template when the generator call fails.
pub async fn create_identity_card(
    generator: &Arc<dyn Generator>,
    doc: &ParsedDocument,
    title: &str,
) -> Result<IdentityCard> {
    let toc = extract_table_of_contents(doc);
    let sample = sample_document(&doc.markdown);
    let prompt = build_identity_prompt(title, &toc, &sample);

    let request = GenerationRequest {
        system: None,
        parts: vec![ContentPart::Text(prompt)],
        temperature: 0.02,
        max_tokens: 600,
        json_mode: false,
    };

    match generator.generate(request).await {
        Ok(text) if !text.trim().is_empty() => Ok(IdentityCard {
            text: text.trim().to_string(),
            pages_sampled: sample.pages_sampled,
        }),
        Ok(_) => {
            tracing::warn!("Generator returned an empty identity card, using fallback");
            Ok(IdentityCard {
                text: fallback_identity(title, &toc.content),
                pages_sampled: sample.pages_sampled,
            })
        }
        Err(e) => {
            tracing::warn!(error = %e, "Identity card generation failed, using fallback");
            Ok(IdentityCard {
                text: fallback_identity(title, &toc.content),
                pages_sampled: sample.pages_sampled,
            })
        }
    }
}

/// Pull valid section titles out of an identity card's structure block.
/// Used by heading hygiene to validate long extracted headings.
pub fn extract_valid_titles(identity_text: &str) -> Vec<String> {
    let upper = identity_text.to_uppercase();
    if !upper.contains("STRUCTURE") && !upper.contains("TABLE OF CONTENTS") {
        return Vec::new();
    }

    let line_re = regex::Regex::new(r"^[-*•]\s*(?:\d+[.)]\s*)?(.+?)(?:\s*\(p\.\s*\d+(?:\s*-\s*\d+)?\))?$")
        .expect("valid titles regex");

    identity_text
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            line_re.captures(line).and_then(|caps| {
                let title = caps.get(1)?.as_str().trim().to_string();
                (title.len() > 3).then_some(title)
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DocItem;

    fn doc_with_markdown(markdown: &str) -> ParsedDocument {
        ParsedDocument {
            page_count: 1,
            items: Vec::new(),
            markdown: markdown.to_string(),
            scanned: false,
        }
    }

    #[test]
    fn official_toc_detected_near_head() {
        let markdown = "Some intro\nTable of Contents\n1. First chapter\n2. Second chapter\nBody starts";
        let toc = extract_table_of_contents(&doc_with_markdown(markdown));
        assert_eq!(toc.kind, TocKind::Official);
        assert!(toc.content.contains("1. First chapter"));
    }

    #[test]
    fn toc_detected_in_tail_zone() {
        let mut lines: Vec<String> = (0..300).map(|i| format!("body line {i}")).collect();
        lines.push("Sommaire".to_string());
        lines.push("1. Chapitre un".to_string());
        let toc = extract_table_of_contents(&doc_with_markdown(&lines.join("\n")));
        assert_eq!(toc.kind, TocKind::Official);
        assert!(toc.content.contains("Chapitre un"));
    }

    #[test]
    fn heading_fallback_caps_and_filters() {
        let mut items = vec![DocItem::heading(1, 1, "Valid chapter")];
        items.push(DocItem::heading(2, 1, "x".repeat(150)));
        for i in 0..80 {
            items.push(DocItem::heading(3, 1, format!("Chapter {i}")));
        }
        let doc = ParsedDocument {
            page_count: 3,
            items,
            markdown: "no keywords here".to_string(),
            scanned: false,
        };

        let toc = extract_table_of_contents(&doc);
        assert_eq!(toc.kind, TocKind::Estimated);
        let lines: Vec<&str> = toc.content.lines().collect();
        assert!(lines.len() <= MAX_FALLBACK_HEADINGS);
        assert!(!toc.content.contains(&"x".repeat(150)));
    }

    #[test]
    fn no_structure_at_all_is_absent() {
        let toc = extract_table_of_contents(&doc_with_markdown("plain text only"));
        assert_eq!(toc.kind, TocKind::Absent);
    }

    #[test]
    fn small_documents_are_sampled_whole() {
        let sample = sample_document("short document body");
        assert_eq!(sample.text, "short document body");
        assert!(sample.pages_sampled.is_empty());
    }

    #[test]
    fn large_documents_sample_head_middle_tail() {
        let paragraphs: Vec<String> = (0..200)
            .map(|i| format!("Paragraph number {i} with filler text to pad the size a bit."))
            .collect();
        let markdown = paragraphs.join("\n\n");
        let sample = sample_document(&markdown);

        assert!(sample.text.len() <= SAMPLE_MAX_CHARS);
        assert!(sample.text.contains("--- DOCUMENT START ---"));
        assert!(sample.text.contains("[MIDDLE CONTENT]"));
        assert!(sample.text.contains("Paragraph number 0 "));
        assert!(sample.text.contains("Paragraph number 100 "));
        assert_eq!(sample.pages_sampled, vec![0]);
    }

    #[test]
    fn fallback_card_carries_title_and_toc() {
        let card = fallback_identity("My Course", "1. Intro. 2. Body");
        assert!(card.contains("TITLE: My Course"));
        assert!(card.contains("DOCUMENT STRUCTURE"));
        assert!(card.contains("- 2. Body"));

        let untitled = fallback_identity("", "x");
        assert!(untitled.contains("TITLE: Untitled"));
    }

    #[test]
    fn valid_titles_parse_structure_lines() {
        let identity = format!(
            "{sep}\nDOCUMENT IDENTITY CARD\n{sep}\nDOCUMENT STRUCTURE:\n- 1. The Five Pillars (p.3)\n- 2. Purification rites (p.12)\n- x\nKEY THEMES: faith",
            sep = CARD_SEPARATOR
        );
        let titles = extract_valid_titles(&identity);
        assert_eq!(
            titles,
            vec![
                "The Five Pillars".to_string(),
                "Purification rites".to_string()
            ]
        );
    }

    #[test]
    fn valid_titles_require_structure_section() {
        assert!(extract_valid_titles("- 1. Orphan line (p.3)").is_empty());
    }
}
