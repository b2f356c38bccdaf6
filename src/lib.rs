//! Cross-modal conversion engine for knowledge graphs.
//!
//! KGAS converts a knowledge graph between three analytical views and keeps track of how much
//! each derived value can be trusted:
//!
//! | Conversion | Output | Scales by |
//! |------------|--------|-----------|
//! | graph → table | node/edge rows with degree, PageRank, betweenness | bounded PageRank, sampled betweenness |
//! | table → vector | one embedding per row, failures marked per row | batching + bounded retries |
//! | vector → graph | cosine similarity graph | LSH candidate search |
//!
//! Every result carries a scaling mode (`exact`, `approximate`, `sampled`) and a confidence
//! summary. Confidence scores only decrease along a derivation chain.
//!
//! # Architecture
//!
//! - **Engine**: [`convert::ConversionEngine`], with a content-addressed LRU [`cache`]
//! - **Embeddings**: local ONNX Runtime (all-MiniLM-L6-v2) or deterministic feature hashing
//! - **Storage**: SQLite graph store with [sqlite-vec](https://github.com/asg017/sqlite-vec) vectors
//! - **Transport**: MCP over stdio (primary) or Streamable HTTP
//!
//! # Modules
//!
//! - [`config`]: TOML + environment configuration
//! - [`confidence`]: scores, provenance and propagation rules
//! - [`convert`]: the conversion engine, scaling policy and algorithms
//! - [`cache`]: fingerprinted result cache
//! - [`embedding`]: embedding backends
//! - [`db`]: SQLite graph store
//! - [`error`]: request error taxonomy

pub mod cache;
pub mod confidence;
pub mod config;
pub mod convert;
pub mod db;
pub mod embedding;
pub mod error;

pub use error::{Error, ErrorKind};
