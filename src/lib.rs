//! # basalt - Revisioned B-tree Table Storage
//!
//! basalt is the persistent table store of a search-engine database: an
//! on-disk B-tree mapping variable-length byte keys to variable-length byte
//! values ("tags"), committed atomically at revision boundaries. One writer
//! builds the next revision while any number of readers consume older ones,
//! with no locking below the file system.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │   Public API (Table / Cursor)        │
//! ├──────────────────────────────────────┤
//! │   Mutation engine (search, split,    │
//! │   merge-free delete, enter_key)      │
//! ├───────────────────┬──────────────────┤
//! │  Item/key codec   │  Tag chunking +  │
//! │  block layout     │  raw deflate     │
//! ├───────────────────┴──────────────────┤
//! │  Copy-on-write allocator (dual       │
//! │  bitmap) + dual-base commit          │
//! ├──────────────────────────────────────┤
//! │  Positional block I/O                │
//! └──────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! Each table is three files in its directory:
//!
//! ```text
//! dir/
//! ├── <name>DB      # fixed-size blocks (2 KiB - 64 KiB, power of two)
//! ├── <name>baseA   # base: root, level, item count, bitmap, CRC
//! ├── <name>baseB   # the other base; the newer revision is authoritative
//! └── <name>tmp     # transient during commit
//! ```
//!
//! ## Revisions and Snapshots
//!
//! Modified blocks are always written to block numbers that were free when
//! the transaction started, so the previous revision stays intact until its
//! base file is retired. A reader that opened revision R sees exactly the
//! snapshot committed at R; if the writer has since discarded that
//! revision, the reader gets [`TableError::Modified`] and reopens.
//!
//! ## Quick Start
//!
//! ```no_run
//! use basalt::Table;
//!
//! # fn main() -> eyre::Result<()> {
//! let mut table = Table::new("./data", "postlist", false);
//! table.create_and_open(8192)?;
//! table.add(b"hello", b"world", false)?;
//! table.commit(1)?;
//!
//! let mut tag = Vec::new();
//! assert!(table.get_exact_entry(b"hello", &mut tag)?);
//! assert_eq!(tag, b"world");
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Overview
//!
//! - [`table`]: the table proper: search, mutation, commit/cancel
//! - [`cursor`]: read-only ordered traversal and tag reassembly
//! - [`block`]: block header, slot directory, compaction
//! - [`item`]: item/key codec and key ordering
//! - [`bitmap`]: dual-state copy-on-write block allocator
//! - [`base`]: base-file records with CRC32 integrity
//! - [`compress`]: reusable raw-deflate streams for long tags
//! - [`io`]: positional block I/O and atomic base renames
//! - [`encoding`]: varints for the exported changes stream

#[macro_use]
mod macros;

pub mod base;
pub mod bitmap;
pub mod block;
pub mod compress;
pub mod cursor;
pub mod encoding;
pub mod error;
pub mod io;
pub mod item;
pub mod table;

pub use compress::{CompressStrategy, COMPRESS_MIN};
pub use cursor::Cursor;
pub use error::TableError;
pub use item::MAX_KEY_LEN;
pub use table::Table;
