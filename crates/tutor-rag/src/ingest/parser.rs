//! Layout parser contract and PDF probing.
//!
//! The heavy layout engine (reading order, table structure, OCR, page
//! images) is an external collaborator: the core only consumes the typed
//! `DocItem` stream behind `PdfParser`. What lives here is the scanned-PDF
//! heuristic that decides whether OCR is requested, and a plain-text
//! fallback parser for native PDFs.

use anyhow::{Context, Result};
use lopdf::{Document, Object};

use crate::types::{DocItem, ParsedDocument};

/// Parser knobs decided by the orchestrator before parsing.
#[derive(Debug, Clone, Copy)]
pub struct ParseOptions {
    pub enable_ocr: bool,
    pub table_structure: bool,
    pub page_images: bool,
}

impl ParseOptions {
    pub fn for_document(scanned: bool) -> Self {
        Self {
            enable_ocr: scanned,
            table_structure: true,
            page_images: true,
        }
    }
}

pub trait PdfParser: Send + Sync {
    fn parse(&self, pdf: &[u8], options: &ParseOptions) -> Result<ParsedDocument>;
}

/// Scanned-document heuristic: inspect up to the first three pages; the
/// document is treated as scanned when every inspected page has fewer
/// than 50 text characters and at least one embedded image. Unreadable
/// PDFs default to native (no OCR).
pub fn detect_scanned(pdf: &[u8]) -> bool {
    match Document::load_mem(pdf) {
        Ok(doc) => looks_scanned(&page_stats(&doc, 3)),
        Err(e) => {
            tracing::warn!(error = %e, "Scan detection failed, assuming native PDF");
            false
        }
    }
}

/// Per-page (text chars, embedded image count) for the first `limit`
/// pages.
fn page_stats(doc: &Document, limit: usize) -> Vec<(usize, usize)> {
    doc.get_pages()
        .iter()
        .take(limit)
        .map(|(page_no, page_id)| {
            let text_len = doc
                .extract_text(&[*page_no])
                .map(|t| t.trim().len())
                .unwrap_or(0);
            (text_len, count_page_images(doc, *page_id))
        })
        .collect()
}

fn looks_scanned(stats: &[(usize, usize)]) -> bool {
    !stats.is_empty()
        && stats
            .iter()
            .all(|(text_len, images)| *text_len < 50 && *images >= 1)
}

/// Count image XObjects referenced by a page's resources.
fn count_page_images(doc: &Document, page_id: (u32, u16)) -> usize {
    let Ok(page) = doc.get_object(page_id) else {
        return 0;
    };
    let Ok(page_dict) = page.as_dict() else {
        return 0;
    };

    let resources = match page_dict.get(b"Resources") {
        Ok(Object::Reference(ref_id)) => doc.get_object(*ref_id).ok(),
        Ok(other) => Some(other),
        Err(_) => None,
    };
    let Some(resources) = resources.and_then(|r| r.as_dict().ok()) else {
        return 0;
    };

    let xobjects = match resources.get(b"XObject") {
        Ok(Object::Reference(ref_id)) => doc.get_object(*ref_id).ok(),
        Ok(other) => Some(other),
        Err(_) => None,
    };
    let Some(xobjects) = xobjects.and_then(|x| x.as_dict().ok()) else {
        return 0;
    };

    xobjects
        .iter()
        .filter(|(_, obj)| {
            let resolved = match obj {
                Object::Reference(ref_id) => doc.get_object(*ref_id).ok(),
                other => Some(other).map(|v| &**v),
            };
            resolved
                .and_then(|o| o.as_stream().ok())
                .and_then(|s| s.dict.get(b"Subtype").ok())
                .and_then(|st| st.as_name().ok())
                .map(|name| name == b"Image".as_slice())
                .unwrap_or(false)
        })
        .count()
}

/// Fallback parser for native PDFs: plain text per page, paragraphs as
/// `Text` items, no layout, no pictures. Deployments wire a layout engine
/// here; this keeps the pipeline functional without one.
pub struct PlainTextParser;

impl PdfParser for PlainTextParser {
    fn parse(&self, pdf: &[u8], options: &ParseOptions) -> Result<ParsedDocument> {
        if options.enable_ocr {
            tracing::warn!("PlainTextParser cannot OCR a scanned PDF; text may be empty");
        }

        let doc = Document::load_mem(pdf).context("Unreadable PDF")?;
        let page_numbers: Vec<u32> = doc.get_pages().keys().copied().collect();
        let page_count = page_numbers.len();

        let mut items = Vec::new();
        for page_no in page_numbers {
            let text = match doc.extract_text(&[page_no]) {
                Ok(text) => text,
                Err(e) => {
                    tracing::debug!(page = page_no, error = %e, "Page text extraction failed");
                    continue;
                }
            };

            for paragraph in text.split("\n\n") {
                let paragraph = paragraph.trim();
                if paragraph.is_empty() {
                    continue;
                }
                items.push(DocItem::text(page_no, paragraph));
            }
        }

        // The flattened rendering feeds identity sampling and TOC
        // detection; pdf-extract keeps reading order better than the
        // per-page content streams.
        let markdown = pdf_extract::extract_text_from_mem(pdf).unwrap_or_else(|e| {
            tracing::debug!(error = %e, "Flattened text extraction failed");
            items
                .iter()
                .map(|item| item.text.as_str())
                .collect::<Vec<_>>()
                .join("\n\n")
        });

        Ok(ParsedDocument {
            page_count,
            items,
            markdown: markdown.trim().to_string(),
            scanned: options.enable_ocr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scanned_requires_low_text_and_images_on_every_page() {
        // Three image-only pages: scanned.
        assert!(looks_scanned(&[(0, 1), (12, 2), (49, 1)]));
        // One page with real text breaks the pattern.
        assert!(!looks_scanned(&[(0, 1), (800, 1), (0, 1)]));
        // Images missing on a page: not scanned.
        assert!(!looks_scanned(&[(0, 1), (10, 0), (0, 1)]));
        // No pages inspected: default to native.
        assert!(!looks_scanned(&[]));
    }

    #[test]
    fn garbage_bytes_default_to_native() {
        assert!(!detect_scanned(b"not a pdf at all"));
    }

    #[test]
    fn parse_options_follow_scan_detection() {
        let scanned = ParseOptions::for_document(true);
        assert!(scanned.enable_ocr && scanned.table_structure && scanned.page_images);

        let native = ParseOptions::for_document(false);
        assert!(!native.enable_ocr && native.table_structure && native.page_images);
    }
}
