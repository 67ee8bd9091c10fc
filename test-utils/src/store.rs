//! In-memory config store.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use xenlite::hypervisor::{DomId, EvtchnPort, Mfn};
use xenlite::xenstore::{ConfigStore, TxId, WatchEvent, XBT_NULL};
use xenlite_shared::{XenliteError, XenliteResult};

/// One recorded write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub tx: TxId,
    pub path: String,
    pub value: String,
}

/// When `path` is written with `value`, also set `then_path` to `then_value`.
#[derive(Debug, Clone)]
struct Responder {
    path: String,
    value: String,
    then_path: String,
    then_value: String,
}

#[derive(Default)]
struct StoreState {
    committed: BTreeMap<String, String>,
    pending: HashMap<TxId, BTreeMap<String, String>>,
    next_tx: TxId,
    conflicts_left: u32,
    commits: u32,
    aborts: u32,
    conflicts: u32,
    journal: Vec<JournalEntry>,
    watches: Vec<(String, String)>,
    events: VecDeque<WatchEvent>,
    responders: Vec<Responder>,
    introduced: Vec<(DomId, Mfn, EvtchnPort)>,
}

impl StoreState {
    fn apply(&mut self, path: &str, value: &str) {
        self.committed.insert(path.to_string(), value.to_string());
        for (watched, token) in &self.watches {
            if path == watched || path.starts_with(&format!("{watched}/")) {
                self.events.push_back(WatchEvent {
                    path: path.to_string(),
                    token: token.clone(),
                });
            }
        }
        let triggered: Vec<(String, String)> = self
            .responders
            .iter()
            .filter(|r| r.path == path && r.value == value)
            .map(|r| (r.then_path.clone(), r.then_value.clone()))
            .collect();
        for (then_path, then_value) in triggered {
            self.apply(&then_path, &then_value);
        }
    }
}

/// Config store kept in a map, with conflict injection and a write journal.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a key without journaling it.
    pub fn set(&self, path: &str, value: &str) {
        self.state
            .lock()
            .committed
            .insert(path.to_string(), value.to_string());
    }

    /// Committed value of a key.
    pub fn get(&self, path: &str) -> Option<String> {
        self.state.lock().committed.get(path).cloned()
    }

    /// Make the next `n` commits fail with a conflict.
    pub fn inject_conflicts(&self, n: u32) {
        self.state.lock().conflicts_left = n;
    }

    /// Whenever `path` is written with `value`, set `then_path` to
    /// `then_value` as if a collaborator reacted to it.
    pub fn respond(&self, path: &str, value: &str, then_path: &str, then_value: &str) {
        self.state.lock().responders.push(Responder {
            path: path.to_string(),
            value: value.to_string(),
            then_path: then_path.to_string(),
            then_value: then_value.to_string(),
        });
    }

    pub fn journal(&self) -> Vec<JournalEntry> {
        self.state.lock().journal.clone()
    }

    /// Values written to `path`, in order, committed or not.
    pub fn writes_to(&self, path: &str) -> Vec<String> {
        self.state
            .lock()
            .journal
            .iter()
            .filter(|e| e.path == path)
            .map(|e| e.value.clone())
            .collect()
    }

    pub fn commits(&self) -> u32 {
        self.state.lock().commits
    }

    pub fn aborts(&self) -> u32 {
        self.state.lock().aborts
    }

    /// Commits rejected by injected conflicts.
    pub fn conflicts(&self) -> u32 {
        self.state.lock().conflicts
    }

    /// Transactions started and not yet ended.
    pub fn open_transactions(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn active_watches(&self) -> usize {
        self.state.lock().watches.len()
    }

    pub fn introduced(&self) -> Vec<(DomId, Mfn, EvtchnPort)> {
        self.state.lock().introduced.clone()
    }
}

impl ConfigStore for MemoryStore {
    fn read(&self, tx: TxId, path: &str) -> XenliteResult<Option<String>> {
        let state = self.state.lock();
        if tx != XBT_NULL {
            let pending = state
                .pending
                .get(&tx)
                .ok_or_else(|| XenliteError::Store(format!("unknown transaction {tx}")))?;
            if let Some(value) = pending.get(path) {
                return Ok(Some(value.clone()));
            }
        }
        Ok(state.committed.get(path).cloned())
    }

    fn write(&self, tx: TxId, path: &str, value: &str) -> XenliteResult<()> {
        let mut state = self.state.lock();
        state.journal.push(JournalEntry {
            tx,
            path: path.to_string(),
            value: value.to_string(),
        });
        if tx == XBT_NULL {
            state.apply(path, value);
            return Ok(());
        }
        state
            .pending
            .get_mut(&tx)
            .ok_or_else(|| XenliteError::Store(format!("unknown transaction {tx}")))?
            .insert(path.to_string(), value.to_string());
        Ok(())
    }

    fn transaction_start(&self) -> XenliteResult<TxId> {
        let mut state = self.state.lock();
        state.next_tx += 1;
        let tx = state.next_tx;
        state.pending.insert(tx, BTreeMap::new());
        Ok(tx)
    }

    fn transaction_end(&self, tx: TxId, abort: bool) -> XenliteResult<()> {
        let mut state = self.state.lock();
        let writes = state
            .pending
            .remove(&tx)
            .ok_or_else(|| XenliteError::Store(format!("unknown transaction {tx}")))?;
        if abort {
            state.aborts += 1;
            return Ok(());
        }
        if state.conflicts_left > 0 {
            state.conflicts_left -= 1;
            state.conflicts += 1;
            return Err(XenliteError::Conflict);
        }
        for (path, value) in &writes {
            state.apply(path, value);
        }
        state.commits += 1;
        Ok(())
    }

    fn watch(&self, path: &str, token: &str) -> XenliteResult<()> {
        let mut state = self.state.lock();
        state.watches.push((path.to_string(), token.to_string()));
        // A new watch fires once straight away.
        state.events.push_back(WatchEvent {
            path: path.to_string(),
            token: token.to_string(),
        });
        Ok(())
    }

    fn unwatch(&self, path: &str, token: &str) -> XenliteResult<()> {
        let mut state = self.state.lock();
        let before = state.watches.len();
        state.watches.retain(|(p, t)| !(p == path && t == token));
        if state.watches.len() == before {
            return Err(XenliteError::NotFound(format!("watch {path} ({token})")));
        }
        state.events.retain(|e| e.token != token);
        Ok(())
    }

    fn read_watch(&self, timeout: Duration) -> XenliteResult<Option<WatchEvent>> {
        if let Some(event) = self.state.lock().events.pop_front() {
            return Ok(Some(event));
        }
        std::thread::sleep(timeout.min(Duration::from_millis(5)));
        Ok(self.state.lock().events.pop_front())
    }

    fn introduce_domain(&self, domid: DomId, mfn: Mfn, port: EvtchnPort) -> XenliteResult<()> {
        self.state.lock().introduced.push((domid, mfn, port));
        Ok(())
    }
}
