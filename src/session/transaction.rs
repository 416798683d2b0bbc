use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::engine::{Engine, HandleRef};
use crate::error::{sqlstate, PgError, PgResult};

/// Transaction status as reported in ReadyForQuery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxState {
    Idle,
    InTransaction,
    /// An error occurred inside a transaction block; only `ROLLBACK` (or a
    /// `COMMIT`, which rolls back) is accepted until it ends.
    Failed,
}

impl TxState {
    pub fn status_byte(self) -> u8 {
        match self {
            TxState::Idle => b'I',
            TxState::InTransaction => b'T',
            TxState::Failed => b'E',
        }
    }
}

/// Maps one session's transaction statements onto its SQLite handle.
///
/// ```text
///            BEGIN               COMMIT / ROLLBACK
///   Idle ───────────▶ InTransaction ───────────▶ Idle
///                        │    ▲
///                  error │    │ ROLLBACK TO
///                        ▼    │
///                       Failed ──ROLLBACK/COMMIT──▶ Idle
/// ```
///
/// An implicit transaction wraps a multi-statement simple query. It behaves
/// like an explicit one except that an error rolls it back at once instead
/// of leaving it failed.
///
/// Commits go through [`StorageHandle::commit`](crate::engine::StorageHandle::commit),
/// which checkpoints so that sessions opened afterwards see the write.
pub struct TransactionCoordinator {
    session: i32,
    state: TxState,
    implicit: bool,
    savepoints: Vec<String>,
}

impl TransactionCoordinator {
    pub fn new(session: i32) -> Self {
        Self {
            session,
            state: TxState::Idle,
            implicit: false,
            savepoints: Vec::new(),
        }
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn is_implicit(&self) -> bool {
        self.implicit
    }

    /// Rejects work while the transaction is failed. `ends_transaction` is
    /// true for the statements that are still accepted.
    pub fn admit(&self, ends_transaction: bool) -> PgResult<()> {
        if self.state == TxState::Failed && !ends_transaction {
            return Err(PgError::aborted_transaction());
        }
        Ok(())
    }

    /// Explicit `BEGIN`. Inside an implicit transaction this turns it into an
    /// explicit one; inside an explicit one it is a no-op.
    pub async fn begin(&mut self, engine: &Arc<Engine>, handle: &HandleRef) -> PgResult<()> {
        match self.state {
            TxState::Idle => {
                engine.call(handle, |h| h.begin()).await?;
                self.state = TxState::InTransaction;
                self.implicit = false;
                debug!(session = self.session, "transaction started");
            }
            _ if self.implicit => self.implicit = false,
            _ => debug!(session = self.session, "BEGIN inside a transaction block ignored"),
        }
        Ok(())
    }

    /// Opens the implicit transaction of a multi-statement query. Does
    /// nothing when a transaction is already open.
    pub async fn begin_implicit(&mut self, engine: &Arc<Engine>, handle: &HandleRef) -> PgResult<()> {
        if self.state == TxState::Idle {
            engine.call(handle, |h| h.begin()).await?;
            self.state = TxState::InTransaction;
            self.implicit = true;
        }
        Ok(())
    }

    /// `COMMIT`. Returns the command tag: a failed transaction is rolled
    /// back and reported as `ROLLBACK`.
    ///
    /// A commit SQLite refuses (typically `55P03` under contention) rolls the
    /// transaction back before the error is returned.
    pub async fn commit(&mut self, engine: &Arc<Engine>, handle: &HandleRef) -> PgResult<&'static str> {
        match self.state {
            TxState::Idle => {
                debug!(session = self.session, "COMMIT without a transaction");
                Ok("COMMIT")
            }
            TxState::Failed => {
                self.rollback(engine, handle).await?;
                Ok("ROLLBACK")
            }
            TxState::InTransaction => {
                let committed = engine.call(handle, |h| h.commit()).await;
                if let Err(err) = &committed {
                    warn!(session = self.session, error = %err, "commit failed; rolling back");
                    if let Err(undo) = engine.call(handle, |h| h.rollback()).await {
                        warn!(session = self.session, error = %undo, "rollback after failed commit failed");
                    }
                }
                self.reset();
                committed?;
                debug!(session = self.session, "transaction committed");
                Ok("COMMIT")
            }
        }
    }

    pub async fn rollback(&mut self, engine: &Arc<Engine>, handle: &HandleRef) -> PgResult<()> {
        if self.state == TxState::Idle {
            debug!(session = self.session, "ROLLBACK without a transaction");
            return Ok(());
        }
        let result = engine.call(handle, |h| h.rollback()).await;
        self.reset();
        debug!(session = self.session, "transaction rolled back");
        result
    }

    pub async fn savepoint(&mut self, engine: &Arc<Engine>, handle: &HandleRef, name: &str) -> PgResult<()> {
        self.require_block("SAVEPOINT")?;
        let owned = name.to_string();
        engine.call(handle, move |h| h.savepoint(&owned)).await?;
        self.savepoints.push(name.to_string());
        Ok(())
    }

    pub async fn release(&mut self, engine: &Arc<Engine>, handle: &HandleRef, name: &str) -> PgResult<()> {
        self.require_block("RELEASE SAVEPOINT")?;
        let depth = self.find_savepoint(name)?;
        let owned = name.to_string();
        engine.call(handle, move |h| h.release(&owned)).await?;
        self.savepoints.truncate(depth);
        Ok(())
    }

    /// `ROLLBACK TO SAVEPOINT`. Also recovers a failed transaction.
    pub async fn rollback_to(&mut self, engine: &Arc<Engine>, handle: &HandleRef, name: &str) -> PgResult<()> {
        self.require_block("ROLLBACK TO SAVEPOINT")?;
        let depth = self.find_savepoint(name)?;
        let owned = name.to_string();
        engine.call(handle, move |h| h.rollback_to(&owned)).await?;
        self.savepoints.truncate(depth + 1);
        self.state = TxState::InTransaction;
        Ok(())
    }

    /// Records a statement error. An explicit transaction becomes failed; an
    /// implicit one is rolled back.
    pub async fn fail(&mut self, engine: &Arc<Engine>, handle: &HandleRef) {
        match self.state {
            TxState::Idle => {}
            _ if self.implicit => {
                if let Err(err) = self.rollback(engine, handle).await {
                    warn!(session = self.session, error = %err, "rollback of implicit transaction failed");
                }
            }
            _ => self.state = TxState::Failed,
        }
    }

    /// Commits the implicit transaction at the end of a simple query, if it
    /// is still open.
    pub async fn finish_implicit(&mut self, engine: &Arc<Engine>, handle: &HandleRef) -> PgResult<()> {
        if self.implicit && self.state == TxState::InTransaction {
            self.commit(engine, handle).await?;
        }
        Ok(())
    }

    /// Rolls back whatever is left open when the session ends.
    pub async fn end_session(&mut self, engine: &Arc<Engine>, handle: &HandleRef) {
        if self.state != TxState::Idle {
            info!(session = self.session, "rolling back open transaction at disconnect");
            if let Err(err) = self.rollback(engine, handle).await {
                warn!(session = self.session, error = %err, "rollback at disconnect failed");
            }
        }
    }

    fn reset(&mut self) {
        self.state = TxState::Idle;
        self.implicit = false;
        self.savepoints.clear();
    }

    fn require_block(&self, statement: &str) -> PgResult<()> {
        if self.state == TxState::Idle {
            return Err(PgError::new(
                sqlstate::NO_ACTIVE_SQL_TRANSACTION,
                format!("{statement} can only be used in transaction blocks"),
            ));
        }
        Ok(())
    }

    fn find_savepoint(&self, name: &str) -> PgResult<usize> {
        self.savepoints.iter().rposition(|s| s == name).ok_or_else(|| {
            PgError::new(
                sqlstate::INVALID_SAVEPOINT_SPECIFICATION,
                format!("savepoint \"{name}\" does not exist"),
            )
        })
    }
}
