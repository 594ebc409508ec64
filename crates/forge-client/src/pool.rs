//! Idle outbound-connection sweep (§3 added), grounded in `gazette::Router`'s
//! dial-state map and its `sweep()` pass: track one logical entry per
//! endpoint host with a use counter reset on every sweep, and drop entries
//! that sat unused across the preceding interval.
//!
//! `reqwest::Client` already pools the underlying TCP/TLS connections for a
//! given host, so this isn't re-implementing HTTP keep-alive. What's missing
//! is an idle-eviction *policy* for a long-lived client that drifts across a
//! shifting set of endpoints over time; `ConnectionPool` supplies that
//! bookkeeping and leaves the actual socket lifecycle to `reqwest`.

use std::collections::HashMap;
use std::sync::Mutex;

struct HostState {
    uses: usize,
}

/// Tracks per-host usage since the last [`ConnectionPool::sweep`].
pub struct ConnectionPool {
    hosts: Mutex<HashMap<String, HostState>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        ConnectionPool { hosts: Mutex::new(HashMap::new()) }
    }

    /// Records a dispatch to `host`, creating its entry on first sight.
    pub fn touch(&self, host: &str) {
        let mut hosts = self.hosts.lock().unwrap();
        hosts.entry(host.to_string()).or_insert(HostState { uses: 0 }).uses += 1;
    }

    /// Drops hosts untouched since the preceding sweep and resets the
    /// counter on the rest, mirroring `gazette::Router::sweep`'s
    /// retain-and-reset pass.
    pub fn sweep(&self) {
        let mut hosts = self.hosts.lock().unwrap();
        hosts.retain(|host, state| {
            if state.uses == 0 {
                tracing::debug!(%host, "dropping idle endpoint from the connection pool");
                return false;
            }
            state.uses = 0;
            true
        });
    }

    pub fn active_hosts(&self) -> usize {
        self.hosts.lock().unwrap().len()
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}
