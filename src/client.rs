//! # Client API
//!
//! [`Client`] is the embedder-facing handle onto one running instance: a
//! dedicated OS thread owns a single-threaded tokio runtime, the
//! [`crate::router::Router`], and the peer connection table; every public
//! method here is a synchronous call that marshals a request onto that
//! thread's work queue and blocks for the reply. Nothing in this module
//! ever runs on the runtime thread itself.

use std::path::Path;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::mpsc;

use crate::catalog::Callback;
use crate::config::Config;
use crate::error::{Error, Result, UsageError};
use crate::network::{self, PeerRegistry};
use crate::router::{DumpResult, Router, WorkItem};
use crate::value::Tuple;

/// The runtime-tuning subset of [`Config`] a [`ClientBuilder`] can
/// override without pulling in file/env loading.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub fixpoint_soft_limit: u64,
    pub work_queue_capacity: usize,
    pub home_dir: Option<std::path::PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig::from(&Config::default())
    }
}

impl From<&Config> for ClientConfig {
    fn from(config: &Config) -> Self {
        ClientConfig {
            fixpoint_soft_limit: config.fixpoint_soft_limit,
            work_queue_capacity: config.work_queue_capacity,
            home_dir: config.home_dir.clone(),
        }
    }
}

/// Builder for a [`Client`] with non-default tuning; see
/// [`Client::builder`].
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    pub fn fixpoint_soft_limit(mut self, limit: u64) -> Self {
        self.config.fixpoint_soft_limit = limit;
        self
    }

    pub fn work_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.work_queue_capacity = capacity;
        self
    }

    /// Overrides the base directory under which this client's
    /// `c4_home/tcp_<port>/sqlite.db` is created. Mainly useful for tests
    /// that want an isolated temp directory instead of the real user
    /// home.
    pub fn home_dir(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.config.home_dir = Some(dir.into());
        self
    }

    pub fn make(self, port: u16) -> Result<Client> {
        Client::make_with_config(port, self.config)
    }
}

/// A running runtime instance. Dropping a `Client` that was never
/// explicitly [`destroy`](Client::destroy)d shuts the runtime thread down
/// anyway — the `JoinHandle` is only ever taken once, by whichever of
/// `drop`/`destroy` runs first.
pub struct Client {
    port: u16,
    work_tx: mpsc::Sender<WorkItem>,
    runtime_thread: Option<JoinHandle<()>>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder { config: ClientConfig::default() }
    }

    /// Starts a runtime instance listening on `port` (0 binds an
    /// ephemeral port, discoverable afterward via [`Client::get_port`])
    /// with default tuning.
    pub fn make(port: u16) -> Result<Client> {
        Client::make_with_config(port, ClientConfig::default())
    }

    fn make_with_config(port: u16, config: ClientConfig) -> Result<Client> {
        let (work_tx, work_rx) = mpsc::channel::<WorkItem>(config.work_queue_capacity);
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<u16>>();

        let thread_work_tx = work_tx.clone();
        let runtime_thread = std::thread::Builder::new()
            .name("c4-runtime".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(Error::Io(e)));
                        return;
                    }
                };
                runtime.block_on(run_runtime(port, config, thread_work_tx, work_rx, ready_tx));
            })
            .expect("failed to spawn c4 runtime thread");

        let bound_port = ready_rx
            .recv()
            .map_err(|_| Error::Invariant("runtime thread exited before reporting its bound port".to_string()))??;

        Ok(Client { port: bound_port, work_tx, runtime_thread: Some(runtime_thread) })
    }

    /// The port actually bound — only interesting when `make` was called
    /// with `0`.
    pub fn get_port(&self) -> u16 {
        self.port
    }

    /// Reads `path` and installs it via [`Client::install_str`].
    pub fn install_file(&self, path: impl AsRef<Path>) -> Result<Vec<String>> {
        let src = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Usage(UsageError::FileError(path.as_ref().display().to_string(), e.to_string())))?;
        self.install_str(&src)
    }

    /// Parses, analyzes, plans, and installs a program against the
    /// running catalog. Returns the analyzer's unused-variable warnings;
    /// a failure at any pipeline stage installs nothing.
    pub fn install_str(&self, src: &str) -> Result<Vec<String>> {
        let (reply_tx, reply_rx) = std_mpsc::channel();
        self.work_tx
            .blocking_send(WorkItem::Program { src: src.to_string(), reply: reply_tx })
            .map_err(|_| Error::Invariant("runtime thread is gone".to_string()))?;
        reply_rx.recv().map_err(|_| Error::Invariant("runtime thread dropped the reply channel".to_string()))?
    }

    /// Registers `callback` to run on the runtime thread after every
    /// non-duplicate insert into `table`.
    pub fn register_callback(&self, table: &str, callback: Callback) -> Result<()> {
        let (reply_tx, reply_rx) = std_mpsc::channel();
        self.work_tx
            .blocking_send(WorkItem::RegisterCallback { table: table.to_string(), callback, reply: reply_tx })
            .map_err(|_| Error::Invariant("runtime thread is gone".to_string()))?;
        reply_rx.recv().map_err(|_| Error::Invariant("runtime thread dropped the reply channel".to_string()))?
    }

    /// Blocks until the runtime thread has snapshotted every row
    /// currently in `table`.
    pub fn dump_table(&self, table: &str) -> Result<Vec<Tuple>> {
        let result = DumpResult::new();
        self.work_tx
            .blocking_send(WorkItem::DumpTable { table: table.to_string(), result: Arc::clone(&result) })
            .map_err(|_| Error::Invariant("runtime thread is gone".to_string()))?;
        result.wait().map_err(Error::Invariant)
    }

    /// Signals the runtime thread to exit and joins it. Equivalent to
    /// dropping the `Client`, spelled out for callers who want to observe
    /// shutdown completing.
    pub fn destroy(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        if let Some(handle) = self.runtime_thread.take() {
            let _ = self.work_tx.blocking_send(WorkItem::Shutdown);
            let _ = handle.join();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

/// Binds the listener, wires `Router` to the network transport, reports
/// the bound port back to the spawning thread, then runs the event loop
/// until `WorkItem::Shutdown`.
async fn run_runtime(
    port: u16,
    config: ClientConfig,
    work_tx: mpsc::Sender<WorkItem>,
    work_rx: mpsc::Receiver<WorkItem>,
    ready_tx: std_mpsc::Sender<Result<u16>>,
) {
    let listener = match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(e) => {
            let _ = ready_tx.send(Err(Error::Io(e)));
            return;
        }
    };
    let bound_port = match listener.local_addr() {
        Ok(addr) => addr.port(),
        Err(e) => {
            let _ = ready_tx.send(Err(Error::Io(e)));
            return;
        }
    };
    let local_addr = format!("tcp:127.0.0.1:{bound_port}");

    let mut router = Router::new(Some(local_addr), config.fixpoint_soft_limit);
    let (net_tx, net_rx) = mpsc::unbounded_channel();
    router.state.set_net_out(net_tx);

    // Every client gets a `<home>/c4_home/tcp_<port>/sqlite.db`,
    // opened eagerly at startup regardless of whether the installed
    // program ever declares a `sql`-backed table.
    let full_config = Config { home_dir: config.home_dir.clone(), ..Config::default() };
    match full_config.base_dir(bound_port) {
        Ok(base_dir) => match crate::storage::SqliteShared::open(&base_dir.join("sqlite.db")) {
            Ok(sqlite) => router.state.set_sqlite(sqlite),
            Err(e) => tracing::warn!(error = %e, "failed to open sqlite.db; sql-storage tables will be unavailable"),
        },
        Err(e) => tracing::warn!(error = %e, port = bound_port, "failed to create c4_home directory; sql-storage tables will be unavailable"),
    }

    let registry = PeerRegistry::new(work_tx.clone());
    tokio::spawn(network::run_accept_loop(listener, Arc::clone(&registry)));
    tokio::spawn(network::run_outbound_loop(net_rx, registry));

    let _ = ready_tx.send(Ok(bound_port));

    crate::router::run_event_loop(router, work_rx, work_tx).await;
}
