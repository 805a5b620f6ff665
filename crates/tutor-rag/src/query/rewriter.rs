//! Multi-query rewriting. The generator turns the user's question plus
//! recent history into three standalone variants and a keyword string;
//! any failure falls back to the raw question so retrieval never blocks.

use std::sync::Arc;

use crate::llm::{ContentPart, GenerationRequest, Generator};

use super::session::ChatSession;

const REWRITE_TEMPERATURE: f32 = 0.05;
const REWRITE_MAX_TOKENS: u32 = 400;

#[derive(Debug, Clone, PartialEq)]
pub struct RewrittenQuery {
    /// V1: the canonical standalone query, used for reranking and
    /// downstream prompting.
    pub canonical: String,
    /// All variants (V1 first), each dense-searched independently.
    pub variants: Vec<String>,
    /// Keyword string for the lexical leg.
    pub keywords: String,
}

impl RewrittenQuery {
    pub fn fallback(question: &str) -> Self {
        Self {
            canonical: question.to_string(),
            variants: vec![question.to_string()],
            keywords: question.to_string(),
        }
    }
}

pub fn build_rewrite_prompt(question: &str, history: &str) -> String {
    format!(
        r#"You are a query rewriter for a document retrieval system.
Your ONLY task is to rewrite the student's latest question into standalone,
fully explicit search queries.

Rules:
- Use ONLY the conversation history to resolve pronouns and references.
- Do NOT answer the question.
- Do NOT add new information or make deductions.
- If the intent is ambiguous, keep the ambiguity.
- NEVER leak a possible answer or answer examples into the variants.
- If the question cannot be rewritten, repeat it unchanged as V1.

Output EXACTLY four lines, nothing else:
V1: <the standalone question, faithful to the original>
V2: <a paraphrase using different wording>
V3: <the question from another angle>
KEYWORDS: <the key search terms, space-separated>

Conversation history:
{history}

Latest question:
{question}"#,
    )
}

/// Line-prefix parsing of the rewriter output. `None` when no usable V1
/// line is present.
pub fn parse_rewrite_output(raw: &str, question: &str) -> Option<RewrittenQuery> {
    let mut v1 = None;
    let mut v2 = None;
    let mut v3 = None;
    let mut keywords = None;

    for line in raw.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("V1:") {
            v1 = non_empty(rest);
        } else if let Some(rest) = line.strip_prefix("V2:") {
            v2 = non_empty(rest);
        } else if let Some(rest) = line.strip_prefix("V3:") {
            v3 = non_empty(rest);
        } else if let Some(rest) = line.strip_prefix("KEYWORDS:") {
            keywords = non_empty(rest);
        }
    }

    let canonical = v1?;
    let mut variants = vec![canonical.clone()];
    variants.extend(v2);
    variants.extend(v3);

    Some(RewrittenQuery {
        keywords: keywords.unwrap_or_else(|| question.to_string()),
        canonical,
        variants,
    })
}

fn non_empty(text: &str) -> Option<String> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Rewrite the question with the generator, falling back to the raw
/// question on any failure.
pub async fn rewrite_query(
    generator: &Arc<dyn Generator>,
    question: &str,
    session: &ChatSession,
) -> RewrittenQuery {
    if question.trim().is_empty() {
        return RewrittenQuery::fallback(question);
    }

    let prompt = build_rewrite_prompt(question, &session.render_recent());
    let request = GenerationRequest {
        system: None,
        parts: vec![ContentPart::Text(prompt)],
        temperature: REWRITE_TEMPERATURE,
        max_tokens: REWRITE_MAX_TOKENS,
        json_mode: false,
    };

    match generator.generate(request).await {
        Ok(raw) => match parse_rewrite_output(&raw, question) {
            Some(rewritten) => rewritten,
            None => {
                tracing::warn!("Rewriter output had no V1 line, using raw question");
                RewrittenQuery::fallback(question)
            }
        },
        Err(e) => {
            tracing::warn!(error = %e, "Query rewriting failed, using raw question");
            RewrittenQuery::fallback(question)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_four_line_format() {
        let raw = "V1: What is the miqat in the pilgrimage?\nV2: Where does consecration begin?\nV3: Which boundary marks the start of ihram?\nKEYWORDS: miqat ihram boundary pilgrimage";
        let parsed = parse_rewrite_output(raw, "what is it?").unwrap();

        assert_eq!(parsed.canonical, "What is the miqat in the pilgrimage?");
        assert_eq!(parsed.variants.len(), 3);
        assert_eq!(parsed.keywords, "miqat ihram boundary pilgrimage");
    }

    #[test]
    fn tolerates_noise_around_prefixed_lines() {
        let raw = "Here you go:\n  V1: Standalone question\nV2: Another wording\nsome commentary\nKEYWORDS: a b c";
        let parsed = parse_rewrite_output(raw, "q").unwrap();
        assert_eq!(parsed.canonical, "Standalone question");
        assert_eq!(parsed.variants.len(), 2);
    }

    #[test]
    fn missing_v1_is_a_parse_failure() {
        assert!(parse_rewrite_output("V2: only a paraphrase", "q").is_none());
        assert!(parse_rewrite_output("free-form text", "q").is_none());
        assert!(parse_rewrite_output("V1:   ", "q").is_none());
    }

    #[test]
    fn missing_keywords_default_to_the_question() {
        let parsed = parse_rewrite_output("V1: Standalone", "original question").unwrap();
        assert_eq!(parsed.keywords, "original question");
    }

    #[test]
    fn fallback_uses_the_raw_question_everywhere() {
        let fallback = RewrittenQuery::fallback("What is zakat?");
        assert_eq!(fallback.canonical, "What is zakat?");
        assert_eq!(fallback.variants, vec!["What is zakat?".to_string()]);
        assert_eq!(fallback.keywords, "What is zakat?");
    }
}
