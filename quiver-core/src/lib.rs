//! # Quiver Core
//!
//! A content-addressed, version-controlled value store.
//!
//! Values (primitives, lists, maps, sets and structs) are encoded canonically
//! and stored as chunks addressed by their hash. Large collections become
//! prolly trees: balanced trees whose node boundaries are picked by content,
//! so equal collections always produce identical trees and a small edit
//! rewrites only the path from the edit to the root. On top of that sit
//! commits with parents, named datasets moved by compare-and-swap, a diff
//! that skips shared subtrees, a three-way merge that reports conflicts as
//! data, and a pull that copies only the chunks another store lacks.
//!
//! ```ignore
//! use quiver_core::{CommitMeta, CommitOptions, Database, MapEdit, Value};
//!
//! let db = Database::in_memory();
//! let users = db.new_map(vec![(Value::from("ada"), Value::from(36))])?;
//! let users = db.edit_map(&users, vec![MapEdit::Insert(Value::from("bob"), Value::from(41))])?;
//! let head = db.commit(
//!     "main",
//!     &db.read_value(&users)?,
//!     CommitOptions::new(CommitMeta::now("ada", "add bob")),
//! )?;
//! ```

pub mod chunker;
pub mod codec;
pub mod collection;
pub mod commit;
pub mod config;
pub mod cursor;
pub mod dataset;
pub mod db;
pub mod diff;
pub mod error;
pub mod gc;
pub mod graph;
pub mod hash;
pub mod merge;
pub mod node;
pub mod pull;
pub mod stats;
pub mod store;
pub mod tree;
pub mod value;
pub mod value_store;

// Re-export commonly used types
pub use collection::{CollectionEdits, ListEdit, MapEdit, SetEdit};
pub use commit::{Commit, CommitMeta};
pub use config::{ChunkConfig, Config};
pub use dataset::{DatasetStore, FileDatasetStore, MemoryDatasetStore};
pub use db::{CommitOptions, Database, Dataset};
pub use diff::{
    ChangeKey, ChangeKind, DiffEvent, DiffIterator, DiffResume, DiffStats, ListDiff, Splice, ValueChange, ValueDiff,
};
pub use error::{Error, Result};
pub use gc::GcStats;
pub use hash::{Chunk, Ref};
pub use merge::{Conflict, ConflictKind, ConflictPolicy, MergeResult, PathSegment};
pub use node::{Item, Node};
pub use pull::{pull, PullStats};
pub use store::{CachedChunkStore, ChunkStore, FileSystemChunkStore, MemoryChunkStore};
pub use tree::{Edit, ListSplice, ProllyTree};
pub use value::{Kind, List, Map, Number, Sequence, Set, Struct, Value};
pub use value_store::ValueStore;
