//! Answer assembly: one multimodal prompt per query, built from the
//! grouped context, the bounded history window and the prompt style.

use std::sync::Arc;

use crate::config::PromptStyle;
use crate::llm::{ContentPart, GenerationRequest, Generator};
use crate::reranking::build_rerank_text;
use crate::types::ContextItem;

use super::session::ChatSession;

const ANSWER_TEMPERATURE: f32 = 0.25;

/// Fixed reply when the generator is unreachable. The request still
/// succeeds with sources attached; history is left untouched.
pub const APOLOGY_ANSWER: &str =
    "Sorry, I am having a technical issue generating the answer.";

/// Reply when retrieval produced nothing to ground an answer on.
pub const NO_CONTEXT_ANSWER: &str =
    "I could not find anything in the course documents to answer this question.";

const REFUSAL_RULE: &str = r#"If the documents contain NO relevant information to answer the question, reply:
"I could not find anything in the course documents to answer this question.""#;

pub fn system_prompt(style: PromptStyle) -> String {
    match style {
        PromptStyle::Light => format!(
            r#"You are a document analysis assistant.
Answer using ONLY the information present in the KNOWLEDGE blocks below.
Never use outside knowledge. {REFUSAL_RULE}"#
        ),
        PromptStyle::Verbose => format!(
            r#"You are a document analysis assistant for students.
Your role is to identify, organize and faithfully restate the information present in the provided documents, without oversimplification or outside interpretation.

STRICT RULES:
1. Base yourself ONLY on the KNOWLEDGE blocks provided. Never use personal or external knowledge.
2. You MAY paraphrase, combine several passages, organize the information and cite examples that appear in the documents.
3. You may NOT infer conclusions that are not explicitly stated, nor add outside information.
4. PRECISION: respect the fine distinctions of the original text; do not overgeneralize. When your answer is a synthesis, never present it as exhaustive.
5. PARTIAL ANSWERS: if you find partial information, give it and say what is missing. If you covered everything, say "This is all the relevant information available in the documents on this precise question."
6. LINGUISTIC TOLERANCE: be flexible with spelling variants (e.g. Rusul/Rusl, Wudu/Woudou) and common synonyms when identifying the requested information, but always restate using the exact terms of the documents.
7. {REFUSAL_RULE}"#
        ),
        PromptStyle::Reasoning => format!(
            r#"You are a document analysis assistant for students.
Before giving the final answer, reason internally in a [DECOMPOSITION] block:
break the question into the facts needed, locate each fact in the KNOWLEDGE blocks, then write the final answer after [ANSWER].

Fidelity rules: use ONLY the provided KNOWLEDGE blocks; respect the precise distinctions of the text; be flexible with spelling variants when searching but restate with the documents' exact terms. {REFUSAL_RULE}"#
        ),
    }
}

/// Render the grouped context: one `[KNOWLEDGE #idx]` block per item with
/// its page list and structured passage text, plus `[TABLE DATA]` blocks
/// for tables the text does not already contain.
pub fn render_context(context: &[ContextItem]) -> String {
    let mut blocks = Vec::with_capacity(context.len());

    for (i, item) in context.iter().enumerate() {
        let chunk = &item.chunk;
        let pages = if chunk.page_numbers.is_empty() {
            "n/a".to_string()
        } else {
            chunk
                .page_numbers
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };

        let mut block = format!(
            "[KNOWLEDGE #{idx} | Page(s): {pages}]\n{body}",
            idx = i + 1,
            pages = pages,
            body = build_rerank_text(chunk),
        );

        for table in &chunk.tables {
            if !chunk.text.contains(table.as_str()) {
                block.push_str("\n[TABLE DATA]: ");
                block.push_str(table);
            }
        }
        blocks.push(block);
    }

    blocks.join("\n\n")
}

pub fn build_user_prompt(question: &str, context: &[ContextItem], history: &str) -> String {
    format!(
        r#"CONVERSATION HISTORY:
{history}

CONTEXT EXTRACTED FROM THE DOCUMENTS:
{context}

CURRENT QUESTION:
{question}

CRITICAL INSTRUCTIONS:
1. Answer using ONLY the information in the documents above.
2. Respect the precise nuances and distinctions of the original text.
3. Give concrete examples when they appear in the documents.
4. If you present an overview while the documents hold more detail, say so explicitly.
5. If no relevant information is available, say so clearly.

ANSWER:"#,
        history = history,
        context = render_context(context),
        question = question,
    )
}

/// Unique image URLs across the context, in first-seen order.
pub fn collect_image_urls(context: &[ContextItem]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut urls = Vec::new();
    for item in context {
        for url in &item.chunk.images_urls {
            if seen.insert(url.clone()) {
                urls.push(url.clone());
            }
        }
    }
    urls
}

/// Generate the final answer. On success the (question, answer) pair is
/// appended to the session; on generator failure the fixed apology string
/// is returned and the session stays unchanged.
pub async fn generate_answer(
    generator: &Arc<dyn Generator>,
    question: &str,
    context: &[ContextItem],
    session: &mut ChatSession,
    style: PromptStyle,
    max_tokens: u32,
) -> String {
    let mut parts = vec![ContentPart::Text(build_user_prompt(
        question,
        context,
        &session.render_recent(),
    ))];
    for url in collect_image_urls(context) {
        parts.push(ContentPart::ImageUrl(url));
    }

    let request = GenerationRequest {
        system: Some(system_prompt(style)),
        parts,
        temperature: ANSWER_TEMPERATURE,
        max_tokens,
        json_mode: false,
    };

    match generator.generate(request).await {
        Ok(answer) => {
            session.push(question, answer.clone());
            answer
        }
        Err(e) => {
            tracing::error!(error = %e, "Answer generation failed");
            APOLOGY_ANSWER.to_string()
        }
    }
}
