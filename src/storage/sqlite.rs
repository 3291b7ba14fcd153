//! SQLite-backed `Table` implementation. Maintains one parameterized SQL
//! row per tuple in a `UNIQUE`-constrained table, using `INSERT OR IGNORE`
//! plus `Connection::changes()` to get the same "true = newly inserted"
//! signal the in-memory backend gets for free from `HashSet::insert`.
//!
//! Every `sql`-declared table in one `Client` shares a single on-disk
//! connection ([`SqliteShared`]) rather than opening its own: one
//! `sqlite.db` per client, with a write lazily opening a transaction on
//! first use and the router committing it once per fixpoint rather than
//! once per statement.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};

use super::Cursor;
use crate::error::Result;
use crate::value::{DataType, Datum, Schema, Tuple};

/// One shared SQLite connection plus single-writer transaction state: at
/// most one transaction open at a time, begun lazily by the first write
/// within a fixpoint and committed by the router once the fixpoint drains.
pub struct SqliteShared {
    conn: Mutex<Connection>,
    xact_open: AtomicBool,
}

impl SqliteShared {
    /// Opens (creating if absent) the on-disk database at `path`.
    pub fn open(path: &Path) -> Result<Arc<Self>> {
        let conn = Connection::open(path)?;
        Ok(Arc::new(SqliteShared { conn: Mutex::new(conn), xact_open: AtomicBool::new(false) }))
    }

    /// An in-memory connection, for tests that want SQLite's storage
    /// semantics without touching the filesystem.
    pub fn open_in_memory() -> Result<Arc<Self>> {
        let conn = Connection::open_in_memory()?;
        Ok(Arc::new(SqliteShared { conn: Mutex::new(conn), xact_open: AtomicBool::new(false) }))
    }

    fn begin_if_needed(&self, conn: &Connection) -> Result<()> {
        if !self.xact_open.swap(true, Ordering::AcqRel) {
            conn.execute_batch("BEGIN;")?;
        }
        Ok(())
    }

    /// Called once per fixpoint, after the route buffer drains. A no-op
    /// if no write opened a transaction this fixpoint.
    pub fn commit_if_open(&self) -> Result<()> {
        if self.xact_open.swap(false, Ordering::AcqRel) {
            self.conn.lock().execute_batch("COMMIT;")?;
        }
        Ok(())
    }
}

pub struct SqliteTable {
    shared: Arc<SqliteShared>,
    table_name: String,
    schema: Arc<Schema>,
}

impl SqliteTable {
    pub fn open(shared: Arc<SqliteShared>, table_name: &str, schema: Arc<Schema>) -> Result<Self> {
        let cols: Vec<String> = schema
            .columns()
            .iter()
            .enumerate()
            .map(|(i, ty)| format!("c{i} {}", sql_type(*ty)))
            .collect();
        let unique_cols: Vec<String> = (0..schema.arity()).map(|i| format!("c{i}")).collect();
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS \"{table_name}\" ({}, UNIQUE({}))",
            cols.join(", "),
            unique_cols.join(", "),
        );
        shared.conn.lock().execute(&ddl, [])?;
        Ok(SqliteTable { shared, table_name: table_name.to_string(), schema })
    }

    fn column_list(&self) -> String {
        (0..self.schema.arity()).map(|i| format!("c{i}")).collect::<Vec<_>>().join(", ")
    }

    fn placeholder_list(&self) -> String {
        (1..=self.schema.arity()).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", ")
    }

    fn where_clause(&self) -> String {
        (1..=self.schema.arity()).map(|i| format!("c{i} = ?{i}", i = i)).collect::<Vec<_>>().join(" AND ")
    }
}

fn sql_type(ty: DataType) -> &'static str {
    match ty {
        DataType::Bool | DataType::Char | DataType::I2 | DataType::I4 | DataType::I8 => "INTEGER",
        DataType::F64 => "REAL",
        DataType::String => "TEXT",
    }
}

fn datum_to_sql(d: &Datum) -> SqlValue {
    match d {
        Datum::Bool(v) => SqlValue::Integer(i64::from(*v)),
        Datum::Char(v) => SqlValue::Integer(i64::from(*v)),
        Datum::I2(v) => SqlValue::Integer(i64::from(*v)),
        Datum::I4(v) => SqlValue::Integer(i64::from(*v)),
        Datum::I8(v) => SqlValue::Integer(*v),
        Datum::F64(v) => SqlValue::Real(*v),
        Datum::String(v) => SqlValue::Text(v.to_string()),
    }
}

fn sql_to_datum(ty: DataType, v: &SqlValue) -> Datum {
    match (ty, v) {
        (DataType::Bool, SqlValue::Integer(i)) => Datum::Bool(*i != 0),
        (DataType::Char, SqlValue::Integer(i)) => Datum::Char(*i as u8),
        (DataType::I2, SqlValue::Integer(i)) => Datum::I2(*i as i16),
        (DataType::I4, SqlValue::Integer(i)) => Datum::I4(*i as i32),
        (DataType::I8, SqlValue::Integer(i)) => Datum::I8(*i),
        (DataType::F64, SqlValue::Real(f)) => Datum::F64(*f),
        (DataType::String, SqlValue::Text(s)) => Datum::String(Arc::from(s.as_str())),
        (ty, v) => unreachable!("sqlite/schema type mismatch decoding column: {ty:?} vs {v:?}"),
    }
}

/// Rows are materialized eagerly into an owned snapshot at scan-start:
/// a streaming `rusqlite::Rows` cursor would self-reference its owning
/// `Statement`/`Connection`, which doesn't fit this crate's cursor-as-value
/// shape. Eager snapshot keeps scan semantics identical to `MemCursor`.
pub struct SqliteCursor {
    rows: Vec<Tuple>,
    pos: usize,
}

impl super::Table for SqliteTable {
    fn insert(&mut self, tuple: Tuple) -> Result<bool> {
        let conn = self.shared.conn.lock();
        self.shared.begin_if_needed(&conn)?;
        let sql = format!(
            "INSERT OR IGNORE INTO \"{}\" ({}) VALUES ({})",
            self.table_name,
            self.column_list(),
            self.placeholder_list(),
        );
        let values: Vec<SqlValue> = tuple.values().iter().map(datum_to_sql).collect();
        conn.execute(&sql, params_from_iter(values))?;
        Ok(conn.changes() > 0)
    }

    fn delete(&mut self, tuple: &Tuple) -> Result<bool> {
        let conn = self.shared.conn.lock();
        self.shared.begin_if_needed(&conn)?;
        let sql = format!("DELETE FROM \"{}\" WHERE {}", self.table_name, self.where_clause());
        let values: Vec<SqlValue> = tuple.values().iter().map(datum_to_sql).collect();
        conn.execute(&sql, params_from_iter(values))?;
        Ok(conn.changes() > 0)
    }

    fn scan_first(&self) -> Result<(Cursor, Option<Tuple>)> {
        let conn = self.shared.conn.lock();
        let sql = format!("SELECT {} FROM \"{}\"", self.column_list(), self.table_name);
        let mut stmt = conn.prepare(&sql)?;
        let arity = self.schema.arity();
        let schema = self.schema.clone();
        let rows = stmt.query_map([], move |row| {
            let mut values = Vec::with_capacity(arity);
            for i in 0..arity {
                let v: SqlValue = row.get(i)?;
                values.push(sql_to_datum(schema.column_type(i), &v));
            }
            Ok(Tuple::make(schema.clone(), values))
        })?;
        let rows: Vec<Tuple> = rows.collect::<std::result::Result<_, _>>()?;
        let mut cursor = SqliteCursor { rows, pos: 0 };
        let first = advance(&mut cursor);
        Ok((Cursor::Sqlite(cursor), first))
    }

    fn scan_next(&self, cursor: &mut Cursor) -> Result<Option<Tuple>> {
        match cursor {
            Cursor::Sqlite(c) => Ok(advance(c)),
            Cursor::Memory(_) => unreachable!("cursor kind mismatch"),
        }
    }

    fn len(&self) -> usize {
        let sql = format!("SELECT COUNT(*) FROM \"{}\"", self.table_name);
        self.shared.conn.lock().query_row(&sql, [], |row| row.get::<_, i64>(0)).unwrap_or(0) as usize
    }
}

fn advance(cursor: &mut SqliteCursor) -> Option<Tuple> {
    let row = cursor.rows.get(cursor.pos).cloned();
    cursor.pos += 1;
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Table;
    use crate::value::DataType;

    fn schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![DataType::I8, DataType::String], None))
    }

    #[test]
    fn insert_reports_duplicate_via_changes() {
        let shared = SqliteShared::open_in_memory().unwrap();
        let mut t = SqliteTable::open(shared, "t", schema()).unwrap();
        let a = Tuple::make(schema(), vec![Datum::I8(1), Datum::String(Arc::from("x"))]);
        let b = Tuple::make(schema(), vec![Datum::I8(1), Datum::String(Arc::from("x"))]);
        assert!(t.insert(a).unwrap());
        assert!(!t.insert(b).unwrap());
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn scan_round_trips_values() {
        let shared = SqliteShared::open_in_memory().unwrap();
        let mut t = SqliteTable::open(shared, "t", schema()).unwrap();
        let a = Tuple::make(schema(), vec![Datum::I8(7), Datum::String(Arc::from("hi"))]);
        t.insert(a.clone()).unwrap();
        let (_cursor, first) = t.scan_first().unwrap();
        assert_eq!(first, Some(a));
    }

    #[test]
    fn write_opens_and_commit_closes_the_shared_transaction() {
        let shared = SqliteShared::open_in_memory().unwrap();
        let mut t = SqliteTable::open(shared.clone(), "t", schema()).unwrap();
        assert!(!shared.xact_open.load(Ordering::Acquire));
        t.insert(Tuple::make(schema(), vec![Datum::I8(1), Datum::String(Arc::from("x"))])).unwrap();
        assert!(shared.xact_open.load(Ordering::Acquire));
        shared.commit_if_open().unwrap();
        assert!(!shared.xact_open.load(Ordering::Acquire));
    }

    #[test]
    fn two_tables_share_one_connection() {
        let shared = SqliteShared::open_in_memory().unwrap();
        let schema_b = Arc::new(Schema::new(vec![DataType::I8], None));
        let mut a = SqliteTable::open(shared.clone(), "a", schema()).unwrap();
        let mut b = SqliteTable::open(shared, "b", schema_b.clone()).unwrap();
        a.insert(Tuple::make(schema(), vec![Datum::I8(1), Datum::String(Arc::from("x"))])).unwrap();
        b.insert(Tuple::make(schema_b, vec![Datum::I8(9)])).unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }
}
