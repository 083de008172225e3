//! docrag - hybrid passage retrieval for a local document folder.
//!
//! Documents are chunked into overlapping passages and indexed twice: as
//! dense vectors in an HNSW graph and as stemmed text in a
//! [Tantivy](https://github.com/quickwit-oss/tantivy) BM25 index. A query is
//! spell-corrected and expanded into variations, searched against both
//! indexes, merged with reciprocal rank fusion and finally reranked with a
//! [ColBERT](https://github.com/stanford-futuredata/ColBERT) late-interaction
//! model so only passages that clear a relevance floor are returned.
//!
//! # Quick start
//!
//! ```no_run
//! use docrag::{DataDir, Pipeline, Settings, model_manager};
//!
//! let data_dir = DataDir::resolve(None).unwrap();
//! let settings = Settings::load(&data_dir.settings_file()).unwrap();
//! let (embedder, scorer) = model_manager::load_models(&settings.model);
//! let root = std::env::current_dir().unwrap();
//! let pipeline = Pipeline::open(&data_dir, settings, root, embedder, scorer).unwrap();
//!
//! pipeline.reindex(false).unwrap();
//! let retrieval = pipeline.retrieve_passages("When was TechCorp founded?").unwrap();
//! for p in retrieval.passages() {
//!     println!("{} (relevance: {:.3})", p.source, p.relevance);
//! }
//! ```

pub mod cache;
pub mod catalog;
pub mod chunking;
pub mod data_dir;
pub mod dense_index;
pub mod doc_id;
pub mod embedding_db;
pub mod error;
pub mod fusion;
pub mod incremental;
pub mod ingestion;
pub mod mcp;
pub mod model;
pub mod model_manager;
pub mod output;
pub mod pipeline;
pub mod query_enhancer;
pub mod reranker;
pub mod settings;
pub mod tantivy_index;
pub mod text_util;
pub mod walker;

pub use data_dir::DataDir;
pub use doc_id::DocumentId;
pub use embedding_db::EmbeddingDb;
pub use error::{Error, Result};
pub use model::{Embedder, ModelError, Scorer};
pub use pipeline::{Outcome, Pipeline, Retrieval};
pub use settings::Settings;
