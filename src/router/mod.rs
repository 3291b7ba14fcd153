//! # Router & Fixpoint Loop
//!
//! [`RouterState`] is the mutable state every operator reaches into:
//! the catalog, the pending-tuple work list (`route_buf`), and the
//! "deleting" flag Insert/Agg consult. [`Router`] pairs that state with
//! the installed chains and drives the fixpoint loop; splitting the two
//! into disjoint struct fields is what lets
//! `self.chains[idx].invoke(&mut self.state, tuple)` borrow-check —
//! `state` and `chains` are distinct fields, so Rust sees the borrows as
//! non-overlapping even though conceptually a chain is "part of" the
//! router.
//!
//! The event loop wiring (work queue, timers, network hookup) lives at
//! the bottom of this module; `crate::network` owns the sockets and
//! hands completed inbound tuples back as [`WorkItem::Tuple`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tokio::sync::mpsc;

use crate::analyzer::{self, TableShape};
use crate::ast::ColumnRef;
use crate::catalog::{Callback, Catalog, TableDef};
use crate::error::{Error, Result, UsageError};
use crate::expr;
use crate::ops::OpChain;
use crate::parser;
use crate::plan;
use crate::storage::{MemTable, StorageKind};
use crate::value::{DataType, Datum, Schema, Tuple};

/// One pending routing step: a tuple that landed (or was retracted) on
/// `table` and still needs to flow through that table's OpChainList.
struct RouteEntry {
    table: String,
    tuple: Tuple,
    is_delete: bool,
}

/// A tuple destined for a peer whose location specifier doesn't match
/// this instance, queued for `crate::network` to actually ship.
pub struct NetOutbound {
    pub peer_addr: String,
    pub table: String,
    pub tuple: Tuple,
}

/// Everything an operator needs to route tuples: the catalog, the
/// pending work list, and which direction (insert/delete) is currently
/// in flight.
pub struct RouterState {
    catalog: Catalog,
    route_buf: VecDeque<RouteEntry>,
    deleting: bool,
    local_addr: Option<String>,
    fixpoint_count: u64,
    fixpoint_soft_limit: u64,
    net_out: Option<mpsc::UnboundedSender<NetOutbound>>,
    /// The shared SQLite connection backing every `sql`-declared table in
    /// this instance's catalog (one `sqlite.db` per client), or `None`
    /// when no home directory was configured — in which case a `sql`
    /// table definition is rejected.
    sqlite: Option<Arc<crate::storage::SqliteShared>>,
}

impl RouterState {
    pub fn new(local_addr: Option<String>, fixpoint_soft_limit: u64) -> Self {
        RouterState {
            catalog: Catalog::new(),
            route_buf: VecDeque::new(),
            deleting: false,
            local_addr,
            fixpoint_count: 0,
            fixpoint_soft_limit,
            net_out: None,
            sqlite: None,
        }
    }

    /// A state with no network identity and an effectively unbounded
    /// soft limit, for operator unit tests that only care about local
    /// fixpoint behavior.
    #[cfg(test)]
    pub fn for_test(catalog: Catalog) -> Self {
        RouterState {
            catalog,
            route_buf: VecDeque::new(),
            deleting: false,
            local_addr: None,
            fixpoint_count: 0,
            fixpoint_soft_limit: u64::MAX,
            net_out: None,
            sqlite: None,
        }
    }

    pub fn set_net_out(&mut self, tx: mpsc::UnboundedSender<NetOutbound>) {
        self.net_out = Some(tx);
    }

    pub fn set_sqlite(&mut self, sqlite: Arc<crate::storage::SqliteShared>) {
        self.sqlite = Some(sqlite);
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn is_deleting(&self) -> bool {
        self.deleting
    }

    pub fn table_schema(&self, table: &str) -> Result<Arc<Schema>> {
        self.catalog
            .get(table)
            .map(|d| d.schema.clone())
            .ok_or_else(|| Error::Usage(UsageError::UnknownTable(table.to_string())))
    }

    /// Eagerly collects every row currently in `table`. Table cursors
    /// already snapshot at scan-start (see `storage::memory`/`storage::sqlite`),
    /// so this just walks one to completion.
    pub fn scan_table_snapshot(&self, table: &str) -> Result<Vec<Tuple>> {
        let def = self
            .catalog
            .get(table)
            .ok_or_else(|| Error::Usage(UsageError::UnknownTable(table.to_string())))?;
        let (mut cursor, first) = def.table.scan_first()?;
        let mut out = Vec::with_capacity(def.table.len());
        out.extend(first);
        while let Some(t) = def.table.scan_next(&mut cursor)? {
            out.push(t);
        }
        Ok(out)
    }

    /// A non-local destination for `tuple`, if its schema carries a
    /// location-specifier column and that column's value isn't this
    /// instance's own address.
    fn remote_destination(&self, tuple: &Tuple) -> Option<String> {
        let loc = tuple.loc_spec()?;
        match &self.local_addr {
            Some(local) if local == loc => None,
            _ => Some(loc.to_string()),
        }
    }

    /// Inserts `tuple` into `table`. When `check_remote` is set and the
    /// tuple's location specifier names a peer, the tuple is diverted to
    /// the network buffer instead of touching local storage.
    pub fn insert_tuple(&mut self, table: &str, tuple: Tuple, check_remote: bool) -> Result<bool> {
        if check_remote {
            if let Some(dest) = self.remote_destination(&tuple) {
                if let Some(tx) = &self.net_out {
                    let _ = tx.send(NetOutbound { peer_addr: dest, table: table.to_string(), tuple });
                }
                return Ok(false);
            }
        }
        let def = self
            .catalog
            .get_mut(table)
            .ok_or_else(|| Error::Usage(UsageError::UnknownTable(table.to_string())))?;
        let newly = def.table.insert(tuple.clone())?;
        if newly {
            def.fire_callbacks(&tuple);
            if def.op_chain_list.is_some() {
                self.route_buf.push_back(RouteEntry { table: table.to_string(), tuple, is_delete: false });
            }
        }
        Ok(newly)
    }

    pub fn delete_tuple(&mut self, table: &str, tuple: &Tuple) -> Result<bool> {
        let def = self
            .catalog
            .get_mut(table)
            .ok_or_else(|| Error::Usage(UsageError::UnknownTable(table.to_string())))?;
        let removed = def.table.delete(tuple)?;
        if removed && def.op_chain_list.is_some() {
            self.route_buf.push_back(RouteEntry { table: table.to_string(), tuple: tuple.clone(), is_delete: true });
        }
        Ok(removed)
    }
}

/// Pairs [`RouterState`] with the installed OpChains and drives the
/// fixpoint loop. `chain_lists[i]` is the list of chain indices sharing
/// delta table whose `TableDef::op_chain_list == Some(i)` — a slab
/// indirection that breaks the TableDef↔OpChainList cycle.
pub struct Router {
    pub state: RouterState,
    chains: Vec<OpChain>,
    chain_lists: Vec<Vec<usize>>,
}

impl Router {
    pub fn new(local_addr: Option<String>, fixpoint_soft_limit: u64) -> Self {
        Router { state: RouterState::new(local_addr, fixpoint_soft_limit), chains: Vec::new(), chain_lists: Vec::new() }
    }

    /// Routes one externally-produced tuple and runs it to fixpoint.
    pub fn install_tuple(&mut self, table: &str, tuple: Tuple, check_remote: bool) -> Result<()> {
        self.state.insert_tuple(table, tuple, check_remote)?;
        self.run_fixpoint()
    }

    /// Parses, analyzes, plans, and installs `src` against the current
    /// catalog: defines land immediately, rules become OpChains
    /// registered under their delta table, timers get a
    /// `tokio::time::interval` task feeding `work_tx`, and facts route
    /// through `install_tuple(check_remote=true)`. Returns the
    /// analyzer's unused-variable warnings. Aborts (returns `Err`)
    /// before installing anything on the first failure — this function
    /// does not partially install.
    pub fn install_program(&mut self, src: &str, work_tx: &mpsc::Sender<WorkItem>) -> Result<Vec<String>> {
        let program = parser::parse_program(src)?;
        let analyzed = analyzer::analyze(&program, &self.state.catalog)?;

        let mut shapes: HashMap<String, TableShape> = HashMap::new();
        for (name, def) in self.state.catalog.iter() {
            shapes.insert(name.clone(), TableShape { schema: def.schema.clone(), keys: def.keys.clone() });
        }
        for d in &analyzed.defines {
            shapes.insert(d.name.clone(), TableShape { schema: d.schema.clone(), keys: d.keys.clone() });
        }
        let planned = plan::plan_program(&analyzed, &shapes)?;

        for d in &analyzed.defines {
            let table: Box<dyn crate::storage::Table> = match d.storage {
                StorageKind::Memory => Box::new(MemTable::new()),
                StorageKind::Sqlite => {
                    let shared = self.state.sqlite.clone().ok_or_else(|| {
                        Error::Usage(UsageError::SqliteUnavailable(d.name.clone()))
                    })?;
                    Box::new(crate::storage::SqliteTable::open(shared, &d.name, d.schema.clone())?)
                }
            };
            self.state.catalog.define_table(TableDef::new(d.name.clone(), d.storage, d.schema.clone(), d.keys.clone(), table))?;
        }

        for rule_plan in &planned.rules {
            for chain_plan in &rule_plan.chains {
                let chain = OpChain::from_plan(chain_plan);
                let chain_idx = self.chains.len();
                self.chains.push(chain);

                let delta = chain_plan.delta_table.clone();
                let existing_list = self.state.catalog.get(&delta).and_then(|d| d.op_chain_list);
                let list_idx = match existing_list {
                    Some(idx) => idx,
                    None => {
                        let idx = self.chain_lists.len();
                        self.chain_lists.push(Vec::new());
                        self.state.catalog.set_op_chain_list(&delta, idx);
                        idx
                    }
                };
                self.chain_lists[list_idx].push(chain_idx);
            }
        }

        for t in &analyzed.timers {
            let tx = work_tx.clone();
            let name = t.name.clone();
            let period = std::time::Duration::from_millis(t.period_ms.max(1) as u64);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                let schema = Arc::new(Schema::new(vec![DataType::I8], None));
                let mut tick: i64 = 0;
                loop {
                    interval.tick().await;
                    tick += 1;
                    let tuple = Tuple::make(schema.clone(), vec![Datum::I8(tick)]);
                    if tx.send(WorkItem::Tuple { table: name.clone(), tuple }).await.is_err() {
                        break;
                    }
                }
            });
        }

        for f in &analyzed.facts {
            let schema = self.state.table_schema(&f.table.name)?;
            let values: Vec<Datum> = f
                .table
                .columns
                .iter()
                .map(|c| match c {
                    ColumnRef::Const(c) => Ok(expr::const_to_datum(c)),
                    _ => Err(Error::Invariant(format!(
                        "fact column in table '{}' is not a literal constant",
                        f.table.name
                    ))),
                })
                .collect::<Result<_>>()?;
            let tuple = Tuple::make(schema, values);
            self.install_tuple(&f.table.name, tuple, true)?;
        }

        let warnings = analyzed.rules.iter().flat_map(|r| r.warnings.clone()).collect();
        Ok(warnings)
    }

    pub fn register_callback(&mut self, table: &str, callback: Callback) -> Result<()> {
        let def = self
            .state
            .catalog
            .get_mut(table)
            .ok_or_else(|| Error::Usage(UsageError::UnknownTable(table.to_string())))?;
        def.register_callback(callback);
        Ok(())
    }

    /// Drains `route_buf` until empty, invoking every chain registered
    /// under each dequeued tuple's table. Chains themselves push derived
    /// tuples back onto `route_buf` via `RouterState::insert_tuple`/
    /// `delete_tuple`, so this loop is the entire incremental-evaluation
    /// engine: it terminates because `Table::insert` returns `false` on
    /// a duplicate (§4.6 "at-most-once per fixpoint").
    fn run_fixpoint(&mut self) -> Result<()> {
        while let Some(entry) = self.state.route_buf.pop_front() {
            self.state.deleting = entry.is_delete;
            let list_idx = self.state.catalog.get(&entry.table).and_then(|d| d.op_chain_list);
            if let Some(list_idx) = list_idx {
                let chain_idxs = self.chain_lists[list_idx].clone();
                for idx in chain_idxs {
                    self.chains[idx].invoke(&mut self.state, &entry.tuple)?;
                }
            }
            self.state.fixpoint_count += 1;
            if self.state.fixpoint_count > self.state.fixpoint_soft_limit {
                self.state.route_buf.clear();
                self.state.fixpoint_count = 0;
                return Err(Error::Invariant(format!(
                    "fixpoint soft limit of {} routed tuples exceeded",
                    self.state.fixpoint_soft_limit
                )));
            }
        }
        self.state.fixpoint_count = 0;
        if let Some(sqlite) = &self.state.sqlite {
            sqlite.commit_if_open()?;
        }
        Ok(())
    }
}

/// Blocking rendezvous for `dump_table`: the runtime thread calls
/// [`fulfill`](DumpResult::fulfill), the client thread blocks in
/// [`wait`](DumpResult::wait) until it does.
pub struct DumpResult {
    inner: Mutex<Option<std::result::Result<Vec<Tuple>, String>>>,
    cv: Condvar,
}

impl DumpResult {
    pub fn new() -> Arc<Self> {
        Arc::new(DumpResult { inner: Mutex::new(None), cv: Condvar::new() })
    }

    pub fn fulfill(&self, rows: std::result::Result<Vec<Tuple>, String>) {
        let mut guard = self.inner.lock();
        *guard = Some(rows);
        self.cv.notify_one();
    }

    pub fn wait(&self) -> std::result::Result<Vec<Tuple>, String> {
        let mut guard = self.inner.lock();
        while guard.is_none() {
            self.cv.wait(&mut guard);
        }
        guard.take().expect("condvar only wakes after fulfill sets Some")
    }
}

/// One item on the runtime thread's work queue (§4.6). `Tuple` covers
/// both timer ticks and tuples delivered by a peer (routed with
/// `check_remote=false` either way); facts route through
/// `install_program`'s direct call instead of the queue.
pub enum WorkItem {
    Tuple { table: String, tuple: Tuple },
    /// An undecoded tuple body straight off a peer socket — decoded here
    /// (rather than in `crate::network`) because decoding needs the
    /// target table's schema, which only the router's catalog knows.
    RawTuple { table: String, body: Vec<u8> },
    Program { src: String, reply: std::sync::mpsc::Sender<Result<Vec<String>>> },
    DumpTable { table: String, result: Arc<DumpResult> },
    RegisterCallback { table: String, callback: Callback, reply: std::sync::mpsc::Sender<Result<()>> },
    Shutdown,
}

/// The runtime thread's event loop: drains `work_rx`, and forwards
/// anything destined for a remote peer to `net_rx`'s counterpart sender
/// (installed onto `router.state` by the caller before this runs).
/// Network I/O itself — accept loop, per-peer readers/writers — runs as
/// independent tasks spawned by `crate::network`, feeding this same
/// `work_tx`/`net_tx` pair: a single manual poll loop's worth of work
/// spread across tokio's task scheduler instead.
pub async fn run_event_loop(mut router: Router, mut work_rx: mpsc::Receiver<WorkItem>, work_tx: mpsc::Sender<WorkItem>) {
    loop {
        let Some(item) = work_rx.recv().await else { break };
        match item {
            WorkItem::Shutdown => break,
            WorkItem::Tuple { table, tuple } => {
                if let Err(e) = router.install_tuple(&table, tuple, false) {
                    tracing::warn!(error = %e, table = %table, "dropping tuple: routing failed");
                }
            }
            WorkItem::RawTuple { table, body } => match router.state.table_schema(&table) {
                Ok(schema) => match crate::wire::decode_tuple_body(schema, &body) {
                    Ok(tuple) => {
                        if let Err(e) = router.install_tuple(&table, tuple, false) {
                            tracing::warn!(error = %e, table = %table, "dropping peer tuple: routing failed");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, table = %table, "dropping malformed peer tuple"),
                },
                Err(e) => tracing::warn!(error = %e, table = %table, "peer tuple for unknown table"),
            },
            WorkItem::Program { src, reply } => {
                let result = router.install_program(&src, &work_tx);
                let _ = reply.send(result);
            }
            WorkItem::DumpTable { table, result } => {
                let rows = router.state.scan_table_snapshot(&table).map_err(|e| e.to_string());
                result.fulfill(rows);
            }
            WorkItem::RegisterCallback { table, callback, reply } => {
                let _ = reply.send(router.register_callback(&table, callback));
            }
        }
    }
    tracing::info!("router event loop exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemTable;
    use crate::value::{DataType, Schema};

    fn define(state: &mut RouterState, name: &str) {
        let schema = Arc::new(Schema::new(vec![DataType::I8], None));
        state
            .catalog
            .define_table(TableDef::new(name.to_string(), StorageKind::Memory, schema, vec![0], Box::new(MemTable::new())))
            .unwrap();
    }

    #[test]
    fn duplicate_insert_does_not_requeue() {
        let mut state = RouterState::for_test(Catalog::new());
        define(&mut state, "t");
        let schema = Arc::new(Schema::new(vec![DataType::I8], None));
        let tuple = Tuple::make(schema, vec![Datum::I8(1)]);
        assert!(state.insert_tuple("t", tuple.clone(), false).unwrap());
        assert!(!state.insert_tuple("t", tuple, false).unwrap());
    }

    #[test]
    fn remote_destination_diverts_non_local_loc_spec() {
        let mut state = RouterState::for_test(Catalog::new());
        let schema = Arc::new(Schema::new(vec![DataType::String], Some(0)));
        state
            .catalog
            .define_table(TableDef::new("ping".into(), StorageKind::Memory, schema.clone(), vec![], Box::new(MemTable::new())))
            .unwrap();
        state.local_addr = Some("tcp:127.0.0.1:9000".to_string());
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.set_net_out(tx);
        let tuple = Tuple::make(schema, vec![Datum::String("tcp:10.0.0.1:9000".into())]);
        let newly = state.insert_tuple("ping", tuple, true).unwrap();
        assert!(!newly);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn sql_storage_define_installs_and_routes_through_sqlite() {
        let mut router = Router::new(None, u64::MAX);
        router.state.set_sqlite(crate::storage::SqliteShared::open_in_memory().unwrap());
        let (work_tx, _work_rx) = mpsc::channel(8);
        router.install_program("sql edge(int8,int8) keys(0,1); edge(1,2);", &work_tx).unwrap();
        let rows = router.state.scan_table_snapshot("edge").unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn sql_storage_without_sqlite_handle_is_a_usage_error() {
        let mut router = Router::new(None, u64::MAX);
        let (work_tx, _work_rx) = mpsc::channel(8);
        let err = router.install_program("sql edge(int8,int8) keys(0,1);", &work_tx).unwrap_err();
        assert!(matches!(err, Error::Usage(UsageError::SqliteUnavailable(_))));
    }

    #[test]
    fn fixpoint_soft_limit_surfaces_invariant_error() {
        let mut router = Router::new(None, 0);
        let schema = Arc::new(Schema::new(vec![DataType::I8], None));
        router
            .state
            .catalog
            .define_table(TableDef::new("t".into(), StorageKind::Memory, schema.clone(), vec![0], Box::new(MemTable::new())))
            .unwrap();
        router.state.route_buf.push_back(RouteEntry {
            table: "t".to_string(),
            tuple: Tuple::make(schema, vec![Datum::I8(1)]),
            is_delete: false,
        });
        let err = router.run_fixpoint().unwrap_err();
        assert!(matches!(err, Error::Invariant(_)));
    }
}
