use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::compactor;
use crate::directory::Directory;
use crate::engine::Engine;
use crate::limits::*;
use crate::store::{EventStore, Store};

/// Manages per-tenant engines. Each tenant gets its own store + WAL + compactor.
/// Tenant = database name from the pgwire connection. All tenants share one
/// identity directory.
pub struct TenantManager {
    /// A cell per known tenant. Connections to a tenant whose WAL is still
    /// replaying wait on the cell instead of holding a map shard.
    engines: DashMap<String, Arc<OnceCell<Engine>>>,
    reserved: AtomicUsize,
    data_dir: PathBuf,
    compact_threshold: u64,
    directory: Arc<dyn Directory>,
    max_tenants: usize,
    shutdown: CancellationToken,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, directory: Arc<dyn Directory>) -> Self {
        Self {
            engines: DashMap::new(),
            reserved: AtomicUsize::new(0),
            data_dir,
            compact_threshold,
            directory,
            max_tenants: MAX_TENANTS,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_tenant_limit(mut self, max_tenants: usize) -> Self {
        self.max_tenants = max_tenants.min(MAX_TENANTS);
        self
    }

    /// Get or lazily create an engine for the given tenant.
    ///
    /// Engines are keyed by the sanitized name, so names that map to the same
    /// WAL file share one engine.
    pub async fn get_or_create(&self, tenant: &str) -> io::Result<Engine> {
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }

        // Sanitize tenant name to prevent path traversal
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        let known = self.engines.get(&safe_name).map(|e| e.value().clone());
        let cell = match known {
            Some(cell) => cell,
            None => self.reserve(&safe_name)?,
        };
        // Two connections may race to open the same tenant; only one WAL handle may exist.
        let engine = cell.get_or_try_init(|| self.open_tenant(&safe_name)).await?;
        Ok(engine.clone())
    }

    /// Claim a tenant slot and register an empty cell for `name`. The count
    /// is checked and bumped while the entry's shard is locked.
    fn reserve(&self, name: &str) -> io::Result<Arc<OnceCell<Engine>>> {
        match self.engines.entry(name.to_string()) {
            Entry::Occupied(existing) => Ok(existing.get().clone()),
            Entry::Vacant(vacant) => {
                self.reserved
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                        (n < self.max_tenants).then_some(n + 1)
                    })
                    .map_err(|_| io::Error::other("too many tenants"))?;
                Ok(vacant.insert(Arc::new(OnceCell::new())).clone())
            }
        }
    }

    /// Replay the tenant's WAL off the async workers and start its compactor.
    async fn open_tenant(&self, name: &str) -> io::Result<Engine> {
        let wal_path = self.data_dir.join(format!("{name}.wal"));
        let path = wal_path.clone();
        let store = tokio::task::spawn_blocking(move || EventStore::open(&path))
            .await
            .map_err(io::Error::other)??;
        let store: Arc<dyn Store> = Arc::new(store);
        let engine = Engine::with_system_clock(store.clone(), self.directory.clone());

        tokio::spawn(compactor::run_compactor(
            store,
            self.compact_threshold,
            compactor::CHECK_INTERVAL,
            self.shutdown.child_token(),
        ));

        info!("opened tenant {name} at {}", wal_path.display());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE)
            .set(self.reserved.load(Ordering::SeqCst) as f64);
        Ok(engine)
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// Stop every tenant's background work.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for TenantManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
