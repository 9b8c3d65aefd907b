//! # Help Chat
//!
//! Incremental document indexing and retrieval-augmented chat over a local
//! folder.
//!
//! A reindex pass walks the document root, converts every new or changed
//! file to text, writes a markdown snapshot of it, embeds it, and stores
//! one vector per file in SQLite. Chat requests retrieve the most similar
//! files, quote excerpts of their snapshots into the prompt, and send it to
//! an OpenAI-compatible endpoint.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌────────────┐   ┌──────────┐
//! │   Scan   │──▶│ Conversion │──▶│ Embedding  │──▶│  SQLite  │
//! │ + hashes │   │    pool    │   │    pool    │   │ vectors  │
//! └──────────┘   └─────┬──────┘   └────────────┘   └────┬─────┘
//!                      ▼                                 │
//!               ┌────────────┐         ┌──────────┐      │
//!               │ _markdown/ │────────▶│ Retriever│◀─────┘
//!               │ snapshots  │         └────┬─────┘
//!               └────────────┘              ▼
//!                                     ┌──────────┐
//!                                     │   Chat   │
//!                                     └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! help-chat --config-file help.json validate
//! help-chat --config-file help.json reindex
//! help-chat --config-file help.json search "install on linux"
//! help-chat --config-file help.json make-request --prompt-file question.txt
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | JSON/TOML configuration parsing and validation |
//! | [`models`] | Core data types |
//! | [`error`] | Fatal and per-file error kinds |
//! | [`hasher`] | SHA-256 content hashing |
//! | [`extensions`] | Supported-extension filter |
//! | [`scan`] | Directory walk |
//! | [`workspace`] | Temp directory ownership and cleanup |
//! | [`snapshot`] | Markdown snapshot tree |
//! | [`extract`] | File-to-text conversion |
//! | [`embedding`] | Embedding providers and vector helpers |
//! | [`pool`] | Worker pool state machine |
//! | [`worker`] | Conversion/embedding workers and their line protocol |
//! | [`store`] | Vector store |
//! | [`indexer`] | Reindex orchestration |
//! | [`progress`] | Reindex progress reporting |
//! | [`retrieve`] | Similarity search and prompt augmentation |
//! | [`chat`] | OpenAI-compatible chat client |
//! | [`logging`] | Tracing setup |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chat;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extensions;
pub mod extract;
pub mod hasher;
pub mod indexer;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod pool;
pub mod progress;
pub mod retrieve;
pub mod scan;
pub mod snapshot;
pub mod store;
pub mod worker;
pub mod workspace;
