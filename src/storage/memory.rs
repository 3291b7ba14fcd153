//! In-memory `Table` backend: a hash set keyed by content-hash+equal over
//! tuples (both derived from `Tuple`'s `Hash`/`Eq` impls, which compare
//! datum-by-datum).

use std::collections::HashSet;

use super::Cursor;
use crate::error::Result;
use crate::value::Tuple;

pub struct MemTable {
    rows: HashSet<Tuple>,
}

impl MemTable {
    pub fn new() -> Self {
        MemTable { rows: HashSet::new() }
    }
}

impl Default for MemTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of the rows at scan-start, iterated by index. Mutating the
/// table mid-scan (an insert triggered by an operator further down the
/// chain) never invalidates an in-flight scan, matching the router's
/// single-threaded, scan-then-route discipline.
pub struct MemCursor {
    rows: Vec<Tuple>,
    pos: usize,
}

impl super::Table for MemTable {
    fn insert(&mut self, tuple: Tuple) -> Result<bool> {
        Ok(self.rows.insert(tuple))
    }

    fn delete(&mut self, tuple: &Tuple) -> Result<bool> {
        Ok(self.rows.remove(tuple))
    }

    fn scan_first(&self) -> Result<(Cursor, Option<Tuple>)> {
        let rows: Vec<Tuple> = self.rows.iter().cloned().collect();
        let mut cursor = MemCursor { rows, pos: 0 };
        let first = advance(&mut cursor);
        Ok((Cursor::Memory(cursor), first))
    }

    fn scan_next(&self, cursor: &mut Cursor) -> Result<Option<Tuple>> {
        match cursor {
            Cursor::Memory(c) => Ok(advance(c)),
            Cursor::Sqlite(_) => unreachable!("cursor kind mismatch"),
        }
    }

    fn len(&self) -> usize {
        self.rows.len()
    }
}

fn advance(cursor: &mut MemCursor) -> Option<Tuple> {
    let row = cursor.rows.get(cursor.pos).cloned();
    cursor.pos += 1;
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Table;
    use crate::value::{DataType, Datum, Schema};
    use std::sync::Arc;

    fn schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![DataType::I8], None))
    }

    #[test]
    fn insert_reports_duplicate() {
        let mut t = MemTable::new();
        let a = Tuple::make(schema(), vec![Datum::I8(1)]);
        let b = Tuple::make(schema(), vec![Datum::I8(1)]);
        assert!(t.insert(a).unwrap());
        assert!(!t.insert(b).unwrap());
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn scan_yields_every_row_once() {
        let mut t = MemTable::new();
        for i in 0..5 {
            t.insert(Tuple::make(schema(), vec![Datum::I8(i)])).unwrap();
        }
        let (mut cursor, first) = t.scan_first().unwrap();
        let mut seen = first.into_iter().count();
        while let Some(_) = t.scan_next(&mut cursor).unwrap() {
            seen += 1;
        }
        assert_eq!(seen, 5);
    }

    #[test]
    fn delete_removes_row() {
        let mut t = MemTable::new();
        let a = Tuple::make(schema(), vec![Datum::I8(1)]);
        t.insert(a.clone()).unwrap();
        assert!(t.delete(&a).unwrap());
        assert_eq!(t.len(), 0);
    }
}
