use std::{collections::HashSet, path::Path};

use tantivy::{
    Index,
    IndexReader,
    IndexWriter,
    TantivyDocument,
    Term,
    collector::{DocSetCollector, TopDocs},
    doc,
    query::{BooleanQuery, FuzzyTermQuery, Occur, Query, QueryParser, TermQuery},
    schema::*,
    tokenizer::{
        Language,
        LowerCaser,
        RemoveLongFilter,
        SimpleTokenizer,
        Stemmer,
        TextAnalyzer,
    },
};

use crate::{
    error::Result,
    settings::{LexicalSettings, StemLanguage},
};

/// Field names used in the schema.
pub mod fields {
    pub const PASSAGE_ID: &str = "passage_id";
    pub const DOC_NUM_ID: &str = "doc_num_id";
    pub const SOURCE: &str = "source";
    pub const CHUNK_INDEX: &str = "chunk_index";
    pub const START: &str = "start";
    pub const END: &str = "end";
    pub const TEXT: &str = "text";
}

const TOKENIZER: &str = "docrag_stem";

/// Query words shorter than this get no fuzzy expansion.
const FUZZY_MIN_LEN: usize = 4;

/// BM25 keyword index over passages. Also the passage store: text and spans
/// are kept as stored fields and read back with [`LexicalIndex::passage`].
pub struct LexicalIndex {
    index: Index,
    reader: IndexReader,
    fields: SchemaFields,
    fuzzy: bool,
}

/// Resolved field handles for the schema.
#[derive(Clone, Copy)]
pub struct SchemaFields {
    pub passage_id: Field,
    pub doc_num_id: Field,
    pub source: Field,
    pub chunk_index: Field,
    pub start: Field,
    pub end: Field,
    pub text: Field,
}

/// A passage as stored in the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPassage {
    pub passage_id: u64,
    pub doc_num_id: u64,
    /// Absolute path of the source document.
    pub source: String,
    pub chunk_index: u64,
    /// Character span in the normalized document text.
    pub start: u64,
    pub end: u64,
    pub text: String,
}

fn build_schema() -> (Schema, SchemaFields) {
    let mut builder = Schema::builder();

    let passage_id =
        builder.add_u64_field(fields::PASSAGE_ID, INDEXED | STORED | FAST);
    let doc_num_id = builder.add_u64_field(fields::DOC_NUM_ID, INDEXED | STORED);
    let source = builder.add_text_field(fields::SOURCE, STRING | STORED);
    let chunk_index = builder.add_u64_field(fields::CHUNK_INDEX, STORED);
    let start = builder.add_u64_field(fields::START, STORED);
    let end = builder.add_u64_field(fields::END, STORED);

    let text_opts = TextOptions::default()
        .set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer(TOKENIZER)
                .set_index_option(IndexRecordOption::WithFreqsAndPositions),
        )
        .set_stored();
    let text = builder.add_text_field(fields::TEXT, text_opts);

    let schema = builder.build();
    let fields = SchemaFields {
        passage_id,
        doc_num_id,
        source,
        chunk_index,
        start,
        end,
        text,
    };

    (schema, fields)
}

fn register_tokenizers(index: &Index, language: StemLanguage) {
    let language = match language {
        StemLanguage::English => Language::English,
        StemLanguage::French => Language::French,
    };
    let analyzer = TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(40))
        .filter(LowerCaser)
        .filter(Stemmer::new(language))
        .build();
    index.tokenizers().register(TOKENIZER, analyzer);
}

impl LexicalIndex {
    /// Open or create an index at the given directory.
    pub fn open(dir: &Path, settings: &LexicalSettings) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let (schema, fields) = build_schema();

        let mmap_dir = tantivy::directory::MmapDirectory::open(dir)?;
        let exists = Index::exists(&mmap_dir)
            .map_err(|e| tantivy::TantivyError::SystemError(e.to_string()))?;
        let index = if exists {
            Index::open(mmap_dir)?
        } else {
            Index::create(mmap_dir, schema, tantivy::IndexSettings::default())?
        };

        Self::from_index(index, fields, settings)
    }

    /// Create an in-memory index (for testing).
    pub fn open_in_ram(settings: &LexicalSettings) -> Result<Self> {
        let (schema, fields) = build_schema();
        let index = Index::create_in_ram(schema);
        Self::from_index(index, fields, settings)
    }

    fn from_index(
        index: Index,
        fields: SchemaFields,
        settings: &LexicalSettings,
    ) -> Result<Self> {
        register_tokenizers(&index, settings.language);
        let reader = index.reader()?;
        Ok(Self {
            index,
            reader,
            fields,
            fuzzy: settings.fuzzy,
        })
    }

    pub fn fields(&self) -> SchemaFields {
        self.fields
    }

    /// Create a writer with the given memory budget (in bytes).
    pub fn writer(&self, memory_budget: usize) -> Result<IndexWriter> {
        Ok(self.index.writer(memory_budget)?)
    }

    /// Add passages, replacing any existing passage with the same id.
    pub fn upsert(
        &self,
        writer: &IndexWriter,
        passages: &[StoredPassage],
    ) -> Result<()> {
        let f = self.fields;
        for p in passages {
            writer.delete_term(Term::from_field_u64(f.passage_id, p.passage_id));
            writer.add_document(doc!(
                f.passage_id => p.passage_id,
                f.doc_num_id => p.doc_num_id,
                f.source => p.source.as_str(),
                f.chunk_index => p.chunk_index,
                f.start => p.start,
                f.end => p.end,
                f.text => p.text.as_str(),
            ))?;
        }
        Ok(())
    }

    pub fn delete_passages(&self, writer: &IndexWriter, passage_ids: &[u64]) {
        for &id in passage_ids {
            writer.delete_term(Term::from_field_u64(self.fields.passage_id, id));
        }
    }

    /// Delete every passage of a document.
    pub fn delete_document(&self, writer: &IndexWriter, doc_num_id: u64) {
        writer.delete_term(Term::from_field_u64(self.fields.doc_num_id, doc_num_id));
    }

    pub fn clear(&self, writer: &IndexWriter) -> Result<()> {
        writer.delete_all_documents()?;
        Ok(())
    }

    /// BM25 search, ORed with distance-1 fuzzy matches for longer words
    /// when fuzzy matching is enabled.
    ///
    /// Returns up to `limit` `(passage_id, score)` pairs, best first.
    pub fn query(&self, query_str: &str, limit: usize) -> Result<Vec<(u64, f32)>> {
        if limit == 0 || query_str.trim().is_empty() {
            return Ok(Vec::new());
        }
        let f = self.fields;
        self.reader.reload()?;
        let searcher = self.reader.searcher();

        let parser = QueryParser::for_index(&self.index, vec![f.text]);
        let (bm25_query, errors) = parser.parse_query_lenient(query_str);
        if !errors.is_empty() {
            tracing::debug!(?errors, "lenient query parse dropped clauses");
        }

        let mut clauses: Vec<(Occur, Box<dyn Query>)> =
            vec![(Occur::Should, bm25_query)];
        if self.fuzzy {
            for word in crate::text_util::words(query_str) {
                if word.chars().count() >= FUZZY_MIN_LEN {
                    let term = Term::from_field_text(f.text, &word.to_lowercase());
                    clauses.push((
                        Occur::Should,
                        Box::new(FuzzyTermQuery::new(term, 1, true)),
                    ));
                }
            }
        }
        let query = BooleanQuery::new(clauses);

        let top_docs = searcher.search(&query, &TopDocs::with_limit(limit))?;

        let mut seen = HashSet::new();
        let mut results = Vec::with_capacity(top_docs.len());
        for (score, address) in top_docs {
            let doc: TantivyDocument = searcher.doc(address)?;
            let id = extract_u64(&doc, f.passage_id);
            if seen.insert(id) {
                results.push((id, score));
            }
        }
        Ok(results)
    }

    /// Read back a stored passage.
    pub fn passage(&self, passage_id: u64) -> Result<Option<StoredPassage>> {
        let f = self.fields;
        self.reader.reload()?;
        let searcher = self.reader.searcher();

        let query = TermQuery::new(
            Term::from_field_u64(f.passage_id, passage_id),
            IndexRecordOption::Basic,
        );
        let top = searcher.search(&query, &TopDocs::with_limit(1))?;
        let Some((_, address)) = top.into_iter().next() else {
            return Ok(None);
        };
        let doc: TantivyDocument = searcher.doc(address)?;
        Ok(Some(StoredPassage {
            passage_id,
            doc_num_id: extract_u64(&doc, f.doc_num_id),
            source: extract_text(&doc, f.source),
            chunk_index: extract_u64(&doc, f.chunk_index),
            start: extract_u64(&doc, f.start),
            end: extract_u64(&doc, f.end),
            text: extract_text(&doc, f.text),
        }))
    }

    /// Ids of all passages indexed for a document.
    pub fn passage_ids_for_document(&self, doc_num_id: u64) -> Result<Vec<u64>> {
        let f = self.fields;
        self.reader.reload()?;
        let searcher = self.reader.searcher();

        let query = TermQuery::new(
            Term::from_field_u64(f.doc_num_id, doc_num_id),
            IndexRecordOption::Basic,
        );
        let mut ids = Vec::new();
        for address in searcher.search(&query, &DocSetCollector)? {
            let doc: TantivyDocument = searcher.doc(address)?;
            ids.push(extract_u64(&doc, f.passage_id));
        }
        ids.sort_unstable();
        Ok(ids)
    }

    pub fn num_passages(&self) -> Result<u64> {
        self.reader.reload()?;
        Ok(self.reader.searcher().num_docs())
    }
}

impl std::fmt::Debug for LexicalIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LexicalIndex").finish_non_exhaustive()
    }
}

fn extract_text(doc: &TantivyDocument, field: Field) -> String {
    doc.get_first(field)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

fn extract_u64(doc: &TantivyDocument, field: Field) -> u64 {
    doc.get_first(field).and_then(|v| v.as_u64()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passage(id: u64, doc: u64, index: u64, text: &str) -> StoredPassage {
        StoredPassage {
            passage_id: id,
            doc_num_id: doc,
            source: format!("/docs/{doc}.md"),
            chunk_index: index,
            start: 0,
            end: text.chars().count() as u64,
            text: text.to_string(),
        }
    }

    fn index_with(passages: &[StoredPassage]) -> LexicalIndex {
        let idx = LexicalIndex::open_in_ram(&LexicalSettings::default()).unwrap();
        let mut writer = idx.writer(15_000_000).unwrap();
        idx.upsert(&writer, passages).unwrap();
        writer.commit().unwrap();
        idx
    }

    #[test]
    fn create_and_search() {
        let idx = index_with(&[
            passage(1, 10, 0, "TechCorp was founded in 2015 in Paris"),
            passage(2, 20, 0, "Rust is a systems programming language"),
        ]);

        let results = idx.query("when was techcorp founded", 10).unwrap();
        assert_eq!(results[0].0, 1);
        assert_eq!(idx.num_passages().unwrap(), 2);
    }

    #[test]
    fn passage_roundtrips_stored_fields() {
        let p = passage(7, 70, 3, "stored text");
        let idx = index_with(&[p.clone()]);
        assert_eq!(idx.passage(7).unwrap(), Some(p));
        assert_eq!(idx.passage(8).unwrap(), None);
    }

    #[test]
    fn upsert_replaces_same_passage_id() {
        let idx = index_with(&[passage(1, 10, 0, "old content")]);
        let mut writer = idx.writer(15_000_000).unwrap();
        idx.upsert(&writer, &[passage(1, 10, 0, "new content")]).unwrap();
        writer.commit().unwrap();

        assert_eq!(idx.num_passages().unwrap(), 1);
        assert_eq!(idx.passage(1).unwrap().unwrap().text, "new content");
        assert!(idx.query("old", 10).unwrap().is_empty());
    }

    #[test]
    fn delete_passages_and_documents() {
        let idx = index_with(&[
            passage(1, 10, 0, "hello one"),
            passage(2, 10, 1, "hello two"),
            passage(3, 30, 0, "hello three"),
        ]);
        assert_eq!(idx.passage_ids_for_document(10).unwrap(), vec![1, 2]);

        let mut writer = idx.writer(15_000_000).unwrap();
        idx.delete_passages(&writer, &[3]);
        writer.commit().unwrap();
        assert_eq!(idx.query("hello", 10).unwrap().len(), 2);

        idx.delete_document(&writer, 10);
        writer.commit().unwrap();
        assert!(idx.query("hello", 10).unwrap().is_empty());
    }

    #[test]
    fn clear_removes_everything() {
        let idx = index_with(&[passage(1, 10, 0, "hello")]);
        let mut writer = idx.writer(15_000_000).unwrap();
        idx.clear(&writer).unwrap();
        writer.commit().unwrap();
        assert_eq!(idx.num_passages().unwrap(), 0);
    }

    #[test]
    fn stemming_works() {
        let idx = index_with(&[passage(1, 10, 0, "the runners were running quickly")]);
        assert!(!idx.query("run", 10).unwrap().is_empty());
    }

    #[test]
    fn fuzzy_matches_misspelling() {
        let idx = index_with(&[passage(1, 10, 0, "quarterly revenue report")]);
        assert_eq!(idx.query("revenu", 10).unwrap()[0].0, 1);

        let strict = LexicalIndex::open_in_ram(&LexicalSettings {
            fuzzy: false,
            ..Default::default()
        })
        .unwrap();
        let mut writer = strict.writer(15_000_000).unwrap();
        strict
            .upsert(&writer, &[passage(1, 10, 0, "quarterly revenue report")])
            .unwrap();
        writer.commit().unwrap();
        assert!(strict.query("revinue", 10).unwrap().is_empty());
    }

    #[test]
    fn french_stemming() {
        let settings = LexicalSettings {
            language: StemLanguage::French,
            ..Default::default()
        };
        let idx = LexicalIndex::open_in_ram(&settings).unwrap();
        let mut writer = idx.writer(15_000_000).unwrap();
        idx.upsert(&writer, &[passage(1, 10, 0, "les entreprises françaises")])
            .unwrap();
        writer.commit().unwrap();
        assert!(!idx.query("entreprise", 10).unwrap().is_empty());
    }

    #[test]
    fn empty_query_returns_nothing() {
        let idx = index_with(&[passage(1, 10, 0, "hello")]);
        assert!(idx.query("   ", 10).unwrap().is_empty());
    }

    #[test]
    fn disk_persistence() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("tantivy");

        {
            let idx = LexicalIndex::open(&dir, &LexicalSettings::default()).unwrap();
            let mut writer = idx.writer(15_000_000).unwrap();
            idx.upsert(&writer, &[passage(1, 10, 0, "persistent data")]).unwrap();
            writer.commit().unwrap();
        }

        {
            let idx = LexicalIndex::open(&dir, &LexicalSettings::default()).unwrap();
            let results = idx.query("persistent", 10).unwrap();
            assert_eq!(results, vec![(1, results[0].1)]);
        }
    }
}
