//! Scoped store transaction.

use super::{ConfigStore, TxId, writev};
use xenlite_shared::errors::XenliteResult;

/// An open store transaction.
///
/// Discarded automatically when dropped without [`Transaction::commit`].
pub struct Transaction<'a> {
    store: &'a dyn ConfigStore,
    id: TxId,
    finished: bool,
}

impl<'a> Transaction<'a> {
    pub fn start(store: &'a dyn ConfigStore) -> XenliteResult<Self> {
        let id = store.transaction_start()?;
        tracing::trace!(tx = id, "store transaction started");
        Ok(Self {
            store,
            id,
            finished: false,
        })
    }

    pub fn id(&self) -> TxId {
        self.id
    }

    pub fn writev(&self, base: &str, entries: &[(String, String)]) -> XenliteResult<()> {
        writev(self.store, self.id, base, entries)
    }

    /// Commit. A lost race surfaces as `XenliteError::Conflict`.
    pub fn commit(mut self) -> XenliteResult<()> {
        self.finished = true;
        self.store.transaction_end(self.id, false)
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!(tx = self.id, "discarding uncommitted store transaction");
            if let Err(e) = self.store.transaction_end(self.id, true) {
                tracing::warn!(tx = self.id, error = %e, "failed to abort store transaction");
            }
        }
    }
}
