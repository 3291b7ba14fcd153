//! Crate-wide error taxonomy. Four kinds, matching the design's error
//! taxonomy: `Usage` (abort the offending install, runtime continues),
//! `Io` (log + destroy peer, or fatal if catastrophic), `Invariant` (a bug,
//! abort the runtime thread), `TransportDrop` (log + teardown peer, never
//! propagated upstream).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("usage error: {0}")]
    Usage(#[from] UsageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("transport drop: {0}")]
    TransportDrop(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UsageError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("duplicate table definition: {0}")]
    DuplicateTable(String),

    #[error("unknown type name: {0}")]
    UnknownType(String),

    #[error("key column index {0} out of range for arity {1}")]
    KeyOutOfRange(usize, usize),

    #[error("duplicate key column index {0}")]
    DuplicateKeyColumn(usize),

    #[error("at most one location-specifier column is allowed, found columns {0:?}")]
    MultipleLocSpecColumns(Vec<usize>),

    #[error("location-specifier column {0} must have type string")]
    LocSpecNotString(usize),

    #[error("timer period must be positive and fit in 63-bit microseconds: {0}")]
    InvalidTimerPeriod(i64),

    #[error("aggregate expression used outside top-level head column in rule {0}")]
    AggregateNotAtTopLevel(String),

    #[error("aggregate expression used in rule body of rule {0}")]
    AggregateInBody(String),

    #[error("qualifier in rule {0} does not evaluate to bool")]
    QualifierNotBool(String),

    #[error("operand type mismatch in rule {0}: {1} vs {2}")]
    OperandTypeMismatch(String, String, String),

    #[error("don't-care variable '_' used outside a join clause in rule {0}")]
    DontCareMisuse(String),

    #[error("more than one distinct location specifier in body of rule {0}")]
    MultipleBodyLocSpecs(String),

    #[error("head variable '{1}' in rule {0} is not safe: not derived from any non-negated join")]
    UnsafeHeadVariable(String, String),

    #[error("rule {0} body has no non-negated join")]
    NoNonNegatedJoin(String),

    #[error("unsatisfiable qualifier set in rule {0}: free variables never bound")]
    UnsatisfiableQualifiers(String),

    #[error("unknown table referenced: {0}")]
    UnknownTable(String),

    #[error("arity mismatch for table {0}: expected {1}, got {2}")]
    ArityMismatch(String, usize, usize),

    #[error("rule name '{0}' is already in use")]
    DuplicateRuleName(String),

    #[error("file error reading {0}: {1}")]
    FileError(String, String),

    #[error("table '{0}' declared with sql storage but no home directory is configured for this client")]
    SqliteUnavailable(String),
}

pub type Result<T> = std::result::Result<T, Error>;
