//! # c4
//!
//! An embedded deductive-database runtime: incremental Datalog evaluation
//! over a semi-naive fixpoint loop, with location-specifier columns
//! routing derived tuples between peer instances over TCP.
//!
//! ## Pipeline
//!
//! ```text
//! program source
//!     |
//!     v
//! [parser]      -> ast::Program
//!     |
//!     v
//! [analyzer]    -> analyzer::AnalyzedProgram  (safety, stratification, typing)
//!     |
//!     v
//! [plan]        -> plan::ProgramPlan          (per-rule OpChainPlans)
//!     |
//!     v
//! [ops]         -> ops::OpChain               (runtime operator trees)
//!     |
//!     v
//! [router]      -> fixpoint loop, routing tuples through installed chains
//!     |
//!     v
//! [network]     -> ships tuples whose location specifier names a peer
//! ```
//!
//! [`client::Client`] is the embedder's entry point: it owns the runtime
//! thread every other module above runs on.

pub mod ast;
pub mod parser;

pub mod value;

pub mod error;

pub mod storage;

pub mod catalog;

pub mod analyzer;
pub mod expr;
pub mod plan;

pub mod ops;
pub mod router;

pub mod wire;

pub mod network;

pub mod config;

pub mod client;

pub use catalog::{Callback, Catalog, TableDef};
pub use client::{Client, ClientBuilder, ClientConfig};
pub use config::Config;
pub use error::{Error, Result, UsageError};
pub use value::{DataType, Datum, Schema, Tuple};
