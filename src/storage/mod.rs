//! # Storage Backends
//!
//! A uniform `Table` interface over two backends: an in-memory hash set
//! and a SQLite-backed table. Only this trait is contracted — callers
//! never match on the concrete backend.

pub mod memory;
pub mod sqlite;

use crate::error::Result;
use crate::value::Tuple;

pub use memory::MemTable;
pub use sqlite::{SqliteShared, SqliteTable};

/// A cursor over a table scan. Backends hand out whatever state they need
/// to resume iteration; `Table::scan_next` advances it.
pub enum Cursor {
    Memory(memory::MemCursor),
    Sqlite(sqlite::SqliteCursor),
}

/// Storage backend for one table. `insert` reports whether the tuple was
/// newly added (`true`) or a duplicate (`false`) — this return value is
/// what terminates fixpoint evaluation (at-most-once insertion per fixpoint).
pub trait Table: Send {
    fn insert(&mut self, tuple: Tuple) -> Result<bool>;
    fn delete(&mut self, tuple: &Tuple) -> Result<bool>;
    fn scan_first(&self) -> Result<(Cursor, Option<Tuple>)>;
    fn scan_next(&self, cursor: &mut Cursor) -> Result<Option<Tuple>>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn cleanup(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Storage kind a `TableDef` was declared with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Memory,
    Sqlite,
}
