use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

mod catalog;
mod executor;
mod storage;

pub use catalog::{
    CatalogColumn, CatalogTable, MappingOp, SchemaSnapshot, INTERNAL_PREFIX, SCHEMA_TABLE,
    VIEW_INFORMATION_SCHEMA_COLUMNS, VIEW_INFORMATION_SCHEMA_TABLES, VIEW_PG_NAMESPACE,
    VIEW_PG_TABLES, VIEW_PG_TYPE,
};
pub use executor::{execute, CreateTableJob, Job, Outcome, ReturningJob, ReturningKind};
pub use storage::{quote_ident, ExecResult, ProbeColumn, StorageHandle, StorageTarget};

use crate::config::Config;
use crate::error::{PgError, PgResult};

/// A storage handle checked out by one session.
pub type HandleRef = Arc<Mutex<StorageHandle>>;

/// Owner of the SQLite database and every handle opened on it.
///
/// The Engine hands each session its own [`StorageHandle`] and runs all
/// SQLite work on tokio's blocking pool.
///
/// ## Architecture
///
/// ```text
/// ┌──────────┐  ┌──────────┐  ┌──────────┐
/// │ session  │  │ session  │  │ session  │
/// └────┬─────┘  └────┬─────┘  └────┬─────┘
///      │ handle      │ handle      │ handle
///      └─────────────┼─────────────┘
///            ┌───────▼────────┐
///            │     Engine     │  idle pool
///            └───────┬────────┘
///            ┌───────▼────────┐
///            │  SQLite file   │  (or a scratch file)
///            └────────────────┘
/// ```
///
/// ## Visibility
/// A commit on one handle becomes visible to later sessions through two
/// refresh points: a passive WAL checkpoint right after the commit, and an
/// empty read transaction on every handle as it is checked out.
///
/// ## Writers
/// SQLite's write lock allows one writer transaction at a time; other
/// writers wait up to `busy_timeout` and then fail with `55P03`. The engine
/// adds no lock of its own, so nothing is held across wire messages.
pub struct Engine {
    config: Config,
    idle: Mutex<Vec<HandleRef>>,
    /// Dropped after `idle` so pooled handles close before a scratch
    /// directory is removed.
    target: StorageTarget,
}

impl Engine {
    /// Opens the database and prepares the handle pool.
    ///
    /// The shadow schema table is created if missing. With `in_memory` the
    /// database lives in a scratch directory that is removed with the engine.
    ///
    /// ## Returns
    /// * `Ok(Engine)` - ready to hand out handles
    /// * `Err(_)` - the database could not be opened or configured
    ///
    /// ## Example
    /// ```ignore
    /// let engine = Arc::new(Engine::open(Config::in_memory()).await?);
    /// ```
    pub async fn open(config: Config) -> PgResult<Self> {
        let target = if config.in_memory {
            StorageTarget::scratch()?
        } else {
            StorageTarget::File(config.database.clone())
        };

        let open_target = target.clone();
        let open_config = config.clone();
        let first = tokio::task::spawn_blocking(move || StorageHandle::open(&open_target, &open_config))
            .await
            .map_err(|e| PgError::internal(format!("engine open task failed: {e}")))??;
        info!(
            storage = ?target,
            journal_mode = first.journal_mode(),
            "database opened"
        );

        Ok(Self {
            config,
            idle: Mutex::new(vec![Arc::new(Mutex::new(first))]),
            target,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn target(&self) -> &StorageTarget {
        &self.target
    }

    /// Checks out a handle for a session: a pooled one if available,
    /// otherwise a fresh one. Either way it is refreshed before use.
    pub async fn acquire(self: &Arc<Self>) -> PgResult<HandleRef> {
        let pooled = self.idle.lock().pop();
        let engine = Arc::clone(self);
        let handle = tokio::task::spawn_blocking(move || -> PgResult<HandleRef> {
            let handle = match pooled {
                Some(handle) => handle,
                None => {
                    debug!("opening new storage handle");
                    Arc::new(Mutex::new(StorageHandle::open(&engine.target, &engine.config)?))
                }
            };
            handle.lock().refresh()?;
            Ok(handle)
        })
        .await
        .map_err(|e| PgError::internal(format!("acquire task failed: {e}")))??;
        Ok(handle)
    }

    /// Returns a handle to the pool after rolling back anything it left
    /// open. Handles beyond the pool size are closed.
    pub async fn release(self: &Arc<Self>, handle: HandleRef) {
        let engine = Arc::clone(self);
        let result = tokio::task::spawn_blocking(move || {
            let rolled_back = {
                let guard = handle.lock();
                let pending = !guard.is_autocommit();
                if let Err(e) = guard.rollback() {
                    warn!(error = %e, "rollback on release failed; discarding handle");
                    return pending;
                }
                pending
            };
            let mut idle = engine.idle.lock();
            if idle.len() < engine.config.pool_size {
                idle.push(handle);
            }
            rolled_back
        })
        .await;
        match result {
            Ok(true) => info!("rolled back uncommitted transaction on release"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "release task failed"),
        }
    }

    /// Runs `f` against a session's handle on the blocking pool.
    ///
    /// ## Arguments
    /// * `handle` - the session's checked-out handle
    /// * `f` - the work to run; receives the locked handle
    pub async fn call<T, F>(&self, handle: &HandleRef, f: F) -> PgResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&StorageHandle) -> PgResult<T> + Send + 'static,
    {
        let handle = Arc::clone(handle);
        tokio::task::spawn_blocking(move || {
            let guard = handle.lock();
            f(&guard)
        })
        .await
        .map_err(|e| PgError::internal(format!("engine task failed: {e}")))?
    }

    pub fn idle_handles(&self) -> usize {
        self.idle.lock().len()
    }
}
