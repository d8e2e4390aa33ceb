//! # zsetdb
//!
//! A persistent Z-Set storage core for an embedded, incremental,
//! DBSP-style database engine. A Z-Set is a multiset with signed integer
//! weights: adding a `(pk, payload)` pair sums its weight into whatever is
//! already there, and a pair whose net weight lands on zero is as if it
//! had never existed — the "Ghost Property" that both the MemTable and the
//! compactor preserve.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                         Engine                            │
//! │  ┌────────────┐   seal    ┌───────────────┐   compact    │
//! │  │  Active     │ ────────► │  Shard files  │◄────────────┤
//! │  │  MemTable   │           │  (immutable)  │              │
//! │  │  + WAL      │           └──────┬────────┘              │
//! │  └─────┬───────┘                  │                       │
//! │        │ ingest                   │ registry/refcounter   │
//! │        ▼                          ▼                       │
//! │  ┌──────────────────────────────────────────────────────┐ │
//! │  │                Manifest (single-file, atomic swap)   │ │
//! │  └──────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`arena`] | Bump-pointer monotonic allocator backing the MemTable's SkipList and blob heap |
//! | [`buffer`] | Bounds-checked little-endian reads over a byte slice |
//! | [`checksum`] | XXH3-64 checksums and VarInt encoding shared by every on-disk format |
//! | [`schema`] | Column types, primary keys, German strings, and payload codecs |
//! | [`memtable`] | In-memory Z-Set ordered by `(pk, payload)`, backed by a SkipList |
//! | [`wal`] | Write-ahead log of LSN-ordered batch blocks |
//! | [`shard`] | Immutable, mmap-friendly columnar shard format |
//! | [`tournament`] | Min-heap N-way merge over shard cursors |
//! | [`manifest`] | Atomic single-file catalog of a table's active shard set |
//! | [`registry`] | In-memory projection of the manifest; overlap tracking |
//! | [`refcounter`] | Process-local shard lifetime tracking |
//! | [`compaction`] | Pure Z-Set merge compaction: sum weights, drop zero-sum groups |
//! | [`engine`] | Coordinator tying the above into one table's storage lifecycle |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use zsetdb::engine::{Engine, EngineConfig, IngestBatch};
//! use zsetdb::schema::{ColumnDef, ColumnType, ColumnValue, PkVariant, PrimaryKey, TableSchema};
//!
//! let schema = Arc::new(TableSchema::new(
//!     1,
//!     PkVariant::U64,
//!     vec![ColumnDef::new("amount", ColumnType::I64)],
//!     0,
//! ));
//!
//! let engine = Engine::open("/tmp/zsetdb-quickstart", schema.clone(), EngineConfig::default()).unwrap();
//! let batch = IngestBatch::new(schema.schema_hash(), vec![(PrimaryKey::U64(1), vec![ColumnValue::I64(100)], 1)]);
//! engine.ingest(&batch).unwrap();
//! assert_eq!(engine.weight_of(PrimaryKey::U64(1), &[ColumnValue::I64(100)]).unwrap(), 1);
//! engine.close().unwrap();
//! ```

#![allow(dead_code)]

pub mod arena;
pub mod buffer;
pub mod checksum;
pub mod compaction;
pub mod engine;
pub mod manifest;
pub mod memtable;
pub mod refcounter;
pub mod registry;
pub mod schema;
pub mod shard;
pub mod tournament;
pub mod wal;
