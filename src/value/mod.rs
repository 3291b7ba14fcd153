//! # Value Type System
//!
//! The tagged value union (`Datum`), the column-type tag (`DataType`), row
//! schemas, and the refcounted, pooled row type (`Tuple`). Everything above
//! the storage layer speaks in terms of these four types.

mod schema;
mod tuple;

pub use schema::Schema;
pub use tuple::{Tuple, TuplePool, TuplePoolMgr};

use std::cmp::Ordering;
use std::sync::Arc;

/// Column type tag, one of the fixed set of column types a schema can
/// describe. Absence is `Option<DataType>` at call sites that need it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Bool,
    Char,
    I2,
    I4,
    I8,
    F64,
    String,
}

impl DataType {
    /// Parses a schema element type name as it appears in `{type, ...}`
    /// table-definition syntax.
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "bool" => DataType::Bool,
            "char" => DataType::Char,
            "int2" => DataType::I2,
            "int4" => DataType::I4,
            "int8" => DataType::I8,
            "double" | "float8" => DataType::F64,
            "string" | "text" => DataType::String,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            DataType::Bool => "bool",
            DataType::Char => "char",
            DataType::I2 => "int2",
            DataType::I4 => "int4",
            DataType::I8 => "int8",
            DataType::F64 => "double",
            DataType::String => "string",
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            DataType::Char | DataType::I2 | DataType::I4 | DataType::I8 | DataType::F64
        )
    }
}

/// A tagged value. Non-string variants are copy-by-value; `String` is
/// heap-allocated, length-prefixed on the wire, and shared by value via
/// `Arc` (the refcounted `C4String` of the source).
#[derive(Debug, Clone)]
pub enum Datum {
    Bool(bool),
    Char(u8),
    I2(i16),
    I4(i32),
    I8(i64),
    F64(f64),
    String(Arc<str>),
}

impl Datum {
    pub fn data_type(&self) -> DataType {
        match self {
            Datum::Bool(_) => DataType::Bool,
            Datum::Char(_) => DataType::Char,
            Datum::I2(_) => DataType::I2,
            Datum::I4(_) => DataType::I4,
            Datum::I8(_) => DataType::I8,
            Datum::F64(_) => DataType::F64,
            Datum::String(_) => DataType::String,
        }
    }

    pub fn as_i8(&self) -> Option<i64> {
        match *self {
            Datum::Char(v) => Some(v as i64),
            Datum::I2(v) => Some(v as i64),
            Datum::I4(v) => Some(v as i64),
            Datum::I8(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Datum::F64(v) => Some(v),
            _ => self.as_i8().map(|v| v as f64),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Datum::String(s) => Some(s),
            _ => None,
        }
    }
}

/// Generic equality dispatcher. Panics on type mismatch: callers are
/// expected to have already checked schema compatibility (an
/// `InvariantViolation` surface, not a `UsageError` one, if it ever fires).
pub fn datum_equal(a: &Datum, b: &Datum) -> bool {
    match (a, b) {
        (Datum::Bool(x), Datum::Bool(y)) => x == y,
        (Datum::Char(x), Datum::Char(y)) => x == y,
        (Datum::I2(x), Datum::I2(y)) => x == y,
        (Datum::I4(x), Datum::I4(y)) => x == y,
        (Datum::I8(x), Datum::I8(y)) => x == y,
        (Datum::F64(x), Datum::F64(y)) => x == y,
        (Datum::String(x), Datum::String(y)) => x == y,
        _ => panic!("datum_equal: type mismatch {:?} vs {:?}", a.data_type(), b.data_type()),
    }
}

/// Generic ordering dispatcher, used by the expression runtime's single
/// comparison evaluator (`<`, `<=`, `>`, `>=` all funnel through this and
/// interpret the sign).
pub fn datum_cmp(a: &Datum, b: &Datum) -> Ordering {
    match (a, b) {
        (Datum::Bool(x), Datum::Bool(y)) => x.cmp(y),
        (Datum::Char(x), Datum::Char(y)) => x.cmp(y),
        (Datum::I2(x), Datum::I2(y)) => x.cmp(y),
        (Datum::I4(x), Datum::I4(y)) => x.cmp(y),
        (Datum::I8(x), Datum::I8(y)) => x.cmp(y),
        (Datum::F64(x), Datum::F64(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (Datum::String(x), Datum::String(y)) => x.cmp(y),
        _ => panic!("datum_cmp: type mismatch {:?} vs {:?}", a.data_type(), b.data_type()),
    }
}

pub fn datum_hash<H: std::hash::Hasher>(d: &Datum, state: &mut H) {
    use std::hash::Hash;
    match d {
        Datum::Bool(v) => v.hash(state),
        Datum::Char(v) => v.hash(state),
        Datum::I2(v) => v.hash(state),
        Datum::I4(v) => v.hash(state),
        Datum::I8(v) => v.hash(state),
        Datum::F64(v) => v.to_bits().hash(state),
        Datum::String(v) => v.hash(state),
    }
}
