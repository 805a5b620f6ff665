//! Structural enrichment: turn provisional chunks into persisted-shape
//! records carrying tables, page numbers, cleaned headings and uploaded
//! image URLs.

use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use crate::blob::BlobStore;
use crate::types::{
    join_headings, DocItemKind, EnrichedChunk, ParsedDocument, ProvisionalChunk, GENERAL_SECTION,
};

/// Pictures smaller than this (either edge, pixels) are decorative noise.
const MIN_PICTURE_EDGE: u32 = 200;
/// Vertical margin (page units) around the chunk span when matching
/// pictures to chunks.
const PICTURE_MARGIN: f32 = 100.0;
/// A picture covering more than this share of a table chunk's vertical
/// extent is the rendered table itself.
const TABLE_COVERAGE_LIMIT: f32 = 0.05;
/// Headings longer than this and absent from the identity TOC are treated
/// as swallowed paragraphs.
const MAX_UNVERIFIED_HEADING_CHARS: usize = 56;

fn table_row_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\|[-\s:]+\|").expect("table row regex"))
}

/// A chunk whose body is a markdown table (pipe separator row present).
pub fn is_markdown_table(text: &str) -> bool {
    table_row_regex().is_match(text)
}

fn noise_regexes() -> &'static Vec<Regex> {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        [
            r"^\d+$",
            r"^[^\w\s]+$",
            r"(?i)^page\s*\d+$",
            r"^\d+\s*[€$]$",
            r"^©.*$",
            r"^\d{2}/\d{2}/\d{4}$",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("heading noise regex"))
        .collect()
    })
}

fn normalize_title(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .to_lowercase()
}

/// Heading hygiene: quoted citations, pure noise, and long headings that
/// the identity TOC does not know about all collapse to the generic
/// section label.
pub fn filter_suspicious_heading(heading: &str, valid_titles: &[String]) -> String {
    let h = heading.trim();
    if h.is_empty() {
        return GENERAL_SECTION.to_string();
    }

    let quote_start = ['"', '«', '“', '‘'];
    let quote_end = ['"', '»', '”', '’'];
    if h.starts_with(quote_start) || h.ends_with(quote_end) {
        return GENERAL_SECTION.to_string();
    }

    if valid_titles.len() > 3 {
        let h_norm = normalize_title(h);
        let in_summary = valid_titles.iter().any(|title| {
            let t_norm = normalize_title(title);
            !t_norm.is_empty() && (t_norm.contains(&h_norm) || h_norm.contains(&t_norm))
        });
        if !in_summary && h.len() > MAX_UNVERIFIED_HEADING_CHARS {
            return GENERAL_SECTION.to_string();
        }
    }

    if noise_regexes().iter().any(|re| re.is_match(h)) {
        return GENERAL_SECTION.to_string();
    }

    h.to_string()
}

/// Vertical span of a chunk's layout items.
#[derive(Debug, Clone, Copy)]
struct ChunkSpan {
    low: f32,
    high: f32,
}

fn chunk_span(doc: &ParsedDocument, chunk: &ProvisionalChunk) -> Option<ChunkSpan> {
    let mut low = f32::MAX;
    let mut high = f32::MIN;
    let mut seen = false;

    for &idx in &chunk.item_indices {
        if let Some(bbox) = doc.items.get(idx).and_then(|item| item.bbox) {
            low = low.min(bbox.t.min(bbox.b));
            high = high.max(bbox.t.max(bbox.b));
            seen = true;
        }
    }
    seen.then_some(ChunkSpan { low, high })
}

/// Decide, for every chunk, which picture items should be uploaded and
/// attached. A picture belongs to the first chunk that claims it (one
/// upload per page+bbox per ingest).
pub(crate) fn plan_picture_attachments(
    doc: &ParsedDocument,
    chunks: &[ProvisionalChunk],
) -> Vec<Vec<usize>> {
    let mut claimed: HashSet<String> = HashSet::new();
    let mut plans = Vec::with_capacity(chunks.len());

    for chunk in chunks {
        let mut plan = Vec::new();
        let chunk_is_table = is_markdown_table(&chunk.text);
        let span = chunk_span(doc, chunk);

        for (idx, item) in doc.pictures() {
            let Some(bbox) = item.bbox else { continue };
            let Some(picture) = item.picture.as_ref() else {
                continue;
            };

            let signature = format!(
                "pg_{}_{}_{}_{}_{}",
                item.page, bbox.l, bbox.t, bbox.r, bbox.b
            );
            if claimed.contains(&signature) {
                continue;
            }
            if !chunk.pages.contains(&item.page) {
                continue;
            }

            let pic_top = bbox.t.max(bbox.b);
            let is_near = span
                .map(|s| (s.low - PICTURE_MARGIN) <= pic_top && pic_top <= (s.high + PICTURE_MARGIN))
                .unwrap_or(false);
            let is_sole = chunk.pages.len() == 1 && chunk.pages[0] == item.page;
            if !is_near && !is_sole {
                continue;
            }

            if picture.width < MIN_PICTURE_EDGE || picture.height < MIN_PICTURE_EDGE {
                continue;
            }

            if chunk_is_table {
                if let Some(s) = span {
                    let chunk_height = (s.high - s.low).abs();
                    if chunk_height > 0.0 && bbox.height() / chunk_height > TABLE_COVERAGE_LIMIT {
                        tracing::debug!(
                            page = item.page,
                            coverage = bbox.height() / chunk_height,
                            "Skipping picture: rendered table duplicate"
                        );
                        continue;
                    }
                }
            }

            claimed.insert(signature);
            plan.push(idx);
        }
        plans.push(plan);
    }

    plans
}

/// Structural enrichment over all provisional chunks: tables, pages,
/// heading hygiene with inheritance, and image upload.
pub async fn enrich_chunks(
    doc: &ParsedDocument,
    provisional: &[ProvisionalChunk],
    identity_text: &str,
    blobs: &BlobStore,
) -> Vec<EnrichedChunk> {
    let valid_titles = super::identity::extract_valid_titles(identity_text);
    let plans = plan_picture_attachments(doc, provisional);

    // One upload per planned picture item, shared across the whole ingest.
    let mut uploaded: HashMap<usize, Option<String>> = HashMap::new();
    let mut enriched: Vec<EnrichedChunk> = Vec::with_capacity(provisional.len());

    for (i, (chunk, plan)) in provisional.iter().zip(plans.iter()).enumerate() {
        let mut tables: Vec<String> = Vec::new();
        for &idx in &chunk.item_indices {
            if let Some(item) = doc.items.get(idx) {
                if item.kind == DocItemKind::Table && !tables.contains(&item.text) {
                    tables.push(item.text.clone());
                }
            }
        }
        if tables.is_empty() && is_markdown_table(&chunk.text) {
            tables.push(chunk.text.clone());
        }

        let raw_heading = join_headings(&chunk.headings);
        let mut heading_full = filter_suspicious_heading(&raw_heading, &valid_titles);
        if heading_full == GENERAL_SECTION {
            // Inherit the nearest preceding valid heading.
            for previous in enriched.iter().rev() {
                if previous.heading_full != GENERAL_SECTION && !previous.heading_full.is_empty() {
                    heading_full = previous.heading_full.clone();
                    break;
                }
            }
        }

        let mut images_urls = Vec::new();
        for &pic_idx in plan {
            let url = match uploaded.get(&pic_idx) {
                Some(cached) => cached.clone(),
                None => {
                    let url = match doc.items[pic_idx].picture.as_ref() {
                        Some(picture) => blobs.upload_image(&picture.bytes).await,
                        None => None,
                    };
                    uploaded.insert(pic_idx, url.clone());
                    url
                }
            };
            if let Some(url) = url {
                if !images_urls.contains(&url) {
                    images_urls.push(url);
                }
            }
        }

        let mut page_numbers: Vec<i32> = chunk.pages.iter().map(|p| *p as i32).collect();
        page_numbers.sort_unstable();
        page_numbers.dedup();

        enriched.push(EnrichedChunk {
            chunk_index: i as i32,
            text: chunk.text.clone(),
            headings: crate::types::headings_from_full(&heading_full),
            heading_full,
            page_numbers,
            tables,
            images_urls,
            is_table_continuation: false,
            is_table_cut: false,
        });
    }

    enriched
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BBox, DocItem, PictureData};

    fn picture_item(page: u32, bbox: BBox, width: u32, height: u32) -> DocItem {
        DocItem {
            kind: DocItemKind::Picture,
            page,
            bbox: Some(bbox),
            text: String::new(),
            picture: Some(PictureData {
                bytes: vec![0u8; 4],
                width,
                height,
            }),
        }
    }

    fn text_item(page: u32, text: &str, bbox: BBox) -> DocItem {
        DocItem {
            kind: DocItemKind::Text,
            page,
            bbox: Some(bbox),
            text: text.to_string(),
            picture: None,
        }
    }

    fn bbox(t: f32, b: f32) -> BBox {
        BBox {
            l: 0.0,
            t,
            r: 100.0,
            b,
        }
    }

    fn chunk_over(items: &[usize], pages: &[u32], text: &str) -> ProvisionalChunk {
        ProvisionalChunk {
            text: text.to_string(),
            headings: vec![],
            pages: pages.to_vec(),
            item_indices: items.to_vec(),
        }
    }

    #[test]
    fn markdown_tables_are_detected() {
        assert!(is_markdown_table("| a | b |\n|---|---|\n| 1 | 2 |"));
        assert!(!is_markdown_table("plain prose with | one pipe"));
    }

    #[test]
    fn suspicious_headings_collapse_to_general_section() {
        let none: Vec<String> = Vec::new();
        assert_eq!(filter_suspicious_heading("", &none), GENERAL_SECTION);
        assert_eq!(filter_suspicious_heading("42", &none), GENERAL_SECTION);
        assert_eq!(filter_suspicious_heading("***", &none), GENERAL_SECTION);
        assert_eq!(filter_suspicious_heading("Page 12", &none), GENERAL_SECTION);
        assert_eq!(filter_suspicious_heading("15 €", &none), GENERAL_SECTION);
        assert_eq!(
            filter_suspicious_heading("© 2024 Publisher", &none),
            GENERAL_SECTION
        );
        assert_eq!(
            filter_suspicious_heading("12/03/2023", &none),
            GENERAL_SECTION
        );
        assert_eq!(
            filter_suspicious_heading("« A quoted aphorism »", &none),
            GENERAL_SECTION
        );
        assert_eq!(
            filter_suspicious_heading("The Five Pillars", &none),
            "The Five Pillars"
        );
    }

    #[test]
    fn long_headings_need_toc_confirmation() {
        let titles: Vec<String> = ["Alpha", "Beta", "Gamma", "Delta"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let long_known = "Alpha and a very long subtitle that stretches well past the cutoff";
        // Absent from the TOC and long: rejected.
        let long_unknown =
            "A sentence that was mistaken for a heading and rambles on far too long for one";
        assert_eq!(
            filter_suspicious_heading(long_unknown, &titles),
            GENERAL_SECTION
        );
        // Contains a TOC title: kept despite the length.
        assert_eq!(filter_suspicious_heading(long_known, &titles), long_known);
    }

    #[test]
    fn picture_attaches_when_bbox_overlaps_chunk_span() {
        let doc = ParsedDocument {
            page_count: 2,
            items: vec![
                text_item(1, "body", bbox(700.0, 500.0)),
                picture_item(1, bbox(480.0, 300.0), 400, 300),
                picture_item(2, bbox(480.0, 300.0), 400, 300),
            ],
            markdown: String::new(),
            scanned: false,
        };
        // Chunk spans pages [1] with items [0]; picture top 480 is within
        // [500-100, 700+100].
        let chunks = vec![chunk_over(&[0], &[1], "body")];
        let plans = plan_picture_attachments(&doc, &chunks);
        assert_eq!(plans[0], vec![1]);
    }

    #[test]
    fn small_pictures_are_skipped() {
        let doc = ParsedDocument {
            page_count: 1,
            items: vec![
                text_item(1, "body", bbox(700.0, 500.0)),
                picture_item(1, bbox(650.0, 600.0), 150, 150),
            ],
            markdown: String::new(),
            scanned: false,
        };
        let chunks = vec![chunk_over(&[0], &[1], "body")];
        let plans = plan_picture_attachments(&doc, &chunks);
        assert!(plans[0].is_empty());
    }

    #[test]
    fn rendered_table_picture_is_skipped() {
        // Table chunk 200 units tall; picture of height 190 covers 95%.
        let table_md = "| a | b |\n|---|---|\n| 1 | 2 |";
        let doc = ParsedDocument {
            page_count: 1,
            items: vec![
                DocItem {
                    kind: DocItemKind::Table,
                    page: 1,
                    bbox: Some(bbox(700.0, 500.0)),
                    text: table_md.to_string(),
                    picture: None,
                },
                picture_item(1, bbox(695.0, 505.0), 400, 400),
            ],
            markdown: String::new(),
            scanned: false,
        };
        let chunks = vec![chunk_over(&[0], &[1], table_md)];
        let plans = plan_picture_attachments(&doc, &chunks);
        assert!(plans[0].is_empty());
    }

    #[test]
    fn sole_page_chunk_claims_page_pictures() {
        // No bbox overlap, but the chunk is alone on the picture's page.
        let doc = ParsedDocument {
            page_count: 1,
            items: vec![
                text_item(1, "body", bbox(900.0, 850.0)),
                picture_item(1, bbox(200.0, 100.0), 400, 300),
            ],
            markdown: String::new(),
            scanned: false,
        };
        let chunks = vec![chunk_over(&[0], &[1], "body")];
        let plans = plan_picture_attachments(&doc, &chunks);
        assert_eq!(plans[0], vec![1]);
    }

    #[test]
    fn each_picture_is_claimed_once() {
        let doc = ParsedDocument {
            page_count: 1,
            items: vec![
                text_item(1, "first", bbox(700.0, 500.0)),
                text_item(1, "second", bbox(500.0, 300.0)),
                picture_item(1, bbox(480.0, 350.0), 400, 300),
            ],
            markdown: String::new(),
            scanned: false,
        };
        let chunks = vec![
            chunk_over(&[0], &[1], "first"),
            chunk_over(&[1], &[1], "second"),
        ];
        let plans = plan_picture_attachments(&doc, &chunks);
        let total: usize = plans.iter().map(|p| p.len()).sum();
        assert_eq!(total, 1, "picture claimed by exactly one chunk");
        assert_eq!(plans[0], vec![2]);
    }
}
