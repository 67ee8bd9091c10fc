//! Hierarchical config store client interface.
//!
//! The store is a path-addressed key/value tree with transactions and
//! watches. Its wire protocol lives outside this crate; the core only relies
//! on the operations of [`ConfigStore`].

mod transaction;

use std::time::Duration;

use crate::hypervisor::{DomId, EvtchnPort, Mfn};
use xenlite_shared::constants::store;
use xenlite_shared::errors::XenliteResult;

pub use transaction::Transaction;

/// Transaction identifier.
pub type TxId = u32;

/// The "no transaction" identifier.
pub const XBT_NULL: TxId = 0;

/// A fired watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: String,
    pub token: String,
}

/// Client side of the config store.
pub trait ConfigStore: Send + Sync {
    /// Read a key. `Ok(None)` when it does not exist.
    fn read(&self, tx: TxId, path: &str) -> XenliteResult<Option<String>>;

    fn write(&self, tx: TxId, path: &str, value: &str) -> XenliteResult<()>;

    fn transaction_start(&self) -> XenliteResult<TxId>;

    /// Commit (`abort == false`) or discard a transaction.
    ///
    /// A commit that lost a concurrent-modification race returns
    /// [`XenliteError::Conflict`](xenlite_shared::XenliteError::Conflict).
    fn transaction_end(&self, tx: TxId, abort: bool) -> XenliteResult<()>;

    fn watch(&self, path: &str, token: &str) -> XenliteResult<()>;

    fn unwatch(&self, path: &str, token: &str) -> XenliteResult<()>;

    /// Block until a watch fires or `timeout` elapses (`Ok(None)`).
    fn read_watch(&self, timeout: Duration) -> XenliteResult<Option<WatchEvent>>;

    /// Announce a domain's store ring to the store daemon.
    fn introduce_domain(&self, domid: DomId, mfn: Mfn, port: EvtchnPort) -> XenliteResult<()>;

    fn get_domain_path(&self, domid: DomId) -> XenliteResult<String> {
        Ok(store::domain_path(domid))
    }
}

/// Join a relative key onto a base path.
pub fn join(base: &str, key: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), key.trim_start_matches('/'))
}

/// Write every `(key, value)` pair under `base` within `tx`.
pub fn writev(
    store: &dyn ConfigStore,
    tx: TxId,
    base: &str,
    entries: &[(String, String)],
) -> XenliteResult<()> {
    for (key, value) in entries {
        store.write(tx, &join(base, key), value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join() {
        assert_eq!(join("/local/domain/1", "memory/target"), "/local/domain/1/memory/target");
        assert_eq!(join("/vm/abc/", "/name"), "/vm/abc/name");
    }
}
