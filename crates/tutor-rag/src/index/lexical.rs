use anyhow::{anyhow, Context, Result};
use std::path::Path;
use tantivy::collector::TopDocs;
use tantivy::query::{BooleanQuery, Occur, Query, TermQuery};
use tantivy::schema::{
    self, IndexRecordOption, Schema, TextFieldIndexing, TextOptions, Value as TantivyValue,
    STORED, STRING,
};
use tantivy::tokenizer::{AsciiFoldingFilter, LowerCaser, SimpleTokenizer, TextAnalyzer};
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};
use uuid::Uuid;

/// Name of the registered analyzer. Indexing and query-side tokenization
/// both go through it, so the two can never diverge.
const ANALYZER: &str = "folded";

/// BM25 lexical index over chunk search text. Tokenization is word-based
/// with lowercasing and diacritic folding; matching is disjunctive (any
/// term present qualifies a document).
pub struct LexicalIndex {
    index: Index,
    reader: IndexReader,
    writer: parking_lot::Mutex<IndexWriter>,
    id_field: schema::Field,
    doc_id_field: schema::Field,
    text_field: schema::Field,
}

impl LexicalIndex {
    fn build_schema() -> (Schema, schema::Field, schema::Field, schema::Field) {
        let mut sb = Schema::builder();
        // `id` is STRING (indexed, untokenized) so delete_term works for
        // idempotent upserts.
        let id_field = sb.add_text_field("id", STRING | STORED);
        let doc_id_field = sb.add_text_field("doc_id", STRING | STORED);
        let text_indexing = TextFieldIndexing::default()
            .set_tokenizer(ANALYZER)
            .set_index_option(IndexRecordOption::WithFreqsAndPositions);
        let text_options = TextOptions::default().set_indexing_options(text_indexing);
        let text_field = sb.add_text_field("search_text", text_options);
        (sb.build(), id_field, doc_id_field, text_field)
    }

    fn analyzer() -> TextAnalyzer {
        TextAnalyzer::builder(SimpleTokenizer::default())
            .filter(LowerCaser)
            .filter(AsciiFoldingFilter)
            .build()
    }

    pub fn open(data_dir: &Path, collection: &str) -> Result<Self> {
        let index_path = data_dir.join(format!("{collection}_lexical"));
        std::fs::create_dir_all(&index_path).ok();

        let (schema, id_field, doc_id_field, text_field) = Self::build_schema();

        let dir = tantivy::directory::MmapDirectory::open(&index_path)
            .context("Failed to open lexical index directory")?;
        let index = if Index::exists(&dir)? {
            Index::open_in_dir(&index_path)?
        } else {
            Index::create_in_dir(&index_path, schema)?
        };
        index.tokenizers().register(ANALYZER, Self::analyzer());

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()
            .context("Failed to create lexical index reader")?;

        let writer = index
            .writer(50_000_000)
            .context("Failed to create lexical index writer")?;

        Ok(Self {
            index,
            reader,
            writer: parking_lot::Mutex::new(writer),
            id_field,
            doc_id_field,
            text_field,
        })
    }

    /// Index (or re-index) a batch of chunks and commit. Returns once the
    /// new documents are searchable.
    pub fn upsert_batch(&self, entries: &[(Uuid, Uuid, String)]) -> Result<()> {
        {
            let writer = self.writer.lock();
            for (chunk_id, doc_id, search_text) in entries {
                let id = chunk_id.to_string();
                writer.delete_term(Term::from_field_text(self.id_field, &id));
                writer.add_document(doc!(
                    self.id_field => id.as_str(),
                    self.doc_id_field => doc_id.to_string().as_str(),
                    self.text_field => search_text.as_str(),
                ))?;
            }
        }
        self.commit()
    }

    fn commit(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.commit().context("Lexical index commit failed")?;
        self.reader.reload()?;
        Ok(())
    }

    /// Tokenize raw terms through the registered analyzer.
    fn tokenize(&self, terms: &str) -> Result<Vec<String>> {
        let mut analyzer = self
            .index
            .tokenizers()
            .get(ANALYZER)
            .ok_or_else(|| anyhow!("analyzer '{}' not registered", ANALYZER))?;

        let mut tokens = Vec::new();
        let mut stream = analyzer.token_stream(terms);
        while stream.advance() {
            tokens.push(stream.token().text.clone());
        }
        Ok(tokens)
    }

    /// Disjunctive term search: a chunk matches when at least one term is
    /// present. Scores are BM25. `doc_filter` restricts to one document.
    pub fn search(
        &self,
        terms: &str,
        k: usize,
        doc_filter: Option<Uuid>,
    ) -> Result<Vec<(Uuid, f32)>> {
        let tokens = self.tokenize(terms)?;
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let clauses: Vec<(Occur, Box<dyn Query>)> = tokens
            .iter()
            .map(|token| {
                let term = Term::from_field_text(self.text_field, token);
                let query: Box<dyn Query> =
                    Box::new(TermQuery::new(term, IndexRecordOption::WithFreqs));
                (Occur::Should, query)
            })
            .collect();
        let query = BooleanQuery::new(clauses);

        let searcher = self.reader.searcher();
        // Overfetch when filtering so post-filtering still fills k.
        let fetch_limit = if doc_filter.is_some() { k * 3 } else { k };
        let top_docs = searcher.search(&query, &TopDocs::with_limit(fetch_limit.max(1)))?;

        let filter_str = doc_filter.map(|id| id.to_string());
        let mut results = Vec::with_capacity(k);
        for (score, address) in top_docs {
            let Ok(doc) = searcher.doc::<TantivyDocument>(address) else {
                continue;
            };

            if let Some(ref wanted) = filter_str {
                let doc_id = doc
                    .get_first(self.doc_id_field)
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                if doc_id != wanted {
                    continue;
                }
            }

            if let Some(id) = doc
                .get_first(self.id_field)
                .and_then(|v| v.as_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            {
                results.push((id, score));
                if results.len() >= k {
                    break;
                }
            }
        }

        Ok(results)
    }

    pub fn count(&self) -> Result<usize> {
        Ok(self.reader.searcher().num_docs() as usize)
    }
}
