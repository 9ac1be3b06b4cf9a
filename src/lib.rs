//! # Code Harness
//!
//! A local-first code graph indexer for AI tools.
//!
//! Code Harness walks a project, hands each supported file to a language
//! parser, and stores the resulting components and relationships in a code
//! store. Tasks, notes and rules live in a separate metadata store. A
//! background pipeline embeds everything, and a hybrid search engine ranks
//! results from both stores and from attached documentation bundles.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌────────────────┐
//! │  Walker  │──▶│ FileIndexer  │──▶│ code.sqlite    │
//! │ (ignore) │   │ parse+reduce │   │ components/rels│
//! └──────────┘   └──────┬───────┘   └───────┬────────┘
//!                       │ events            │
//!                       ▼                   ▼
//!               ┌──────────────┐     ┌──────────────┐
//!               │  Embedding   │     │ SearchEngine │◀── meta.sqlite
//!               │  Pipeline    │     │  + rerank    │    tasks/notes/rules
//!               └──────────────┘     └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! chx init                       # create both stores
//! chx index .                    # index the project
//! chx reconcile src              # pick up changes on disk
//! chx embed                      # backfill embeddings
//! chx search "parse config" --type component
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`storage`] | Store handles and serialized write queues |
//! | [`registry`] | Directory to storage coordinator registry |
//! | [`repository`] | Typed reads and writes per entity |
//! | [`parser`] | Parser contract and per-extension registry |
//! | [`walker`] | Ignore-aware directory walk |
//! | [`indexer`] | Per-file indexing pipeline |
//! | [`coordinator`] | Programmatic API over everything above |
//! | [`embedding`] | Embedding backends and background pipeline |
//! | [`search`] | Hybrid search and reranking |
//! | [`docs`] | Documentation bundles |
//! | [`patterns`] | Design pattern detection and graph metrics |
//! | [`maintenance`] | Scheduled tag degradation |

pub mod config;
pub mod coordinator;
pub mod db;
pub mod docs;
pub mod embedding;
pub mod error;
pub mod indexer;
pub mod maintenance;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod parser;
pub mod patterns;
pub mod progress;
pub mod registry;
pub mod repository;
pub mod search;
pub mod stats;
pub mod storage;
pub mod walker;
