//! Installed intercepts, shared by every tunnel the agent serves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use kubetun_core::InterceptKey;
use kubetun_tunnel::Transport;

struct Entry {
    intercept_id: String,
    /// Tunnel that installed the intercept.
    owner: u64,
    transport: Transport,
}

#[derive(Default)]
pub(crate) struct Registry {
    entries: Mutex<HashMap<InterceptKey, Entry>>,
    next_id: AtomicU64,
}

impl Registry {
    /// Install `key` for tunnel `owner`. Reinstalling from the same tunnel
    /// returns the existing ID; another tunnel holding the key is a conflict.
    pub(crate) fn install(&self, key: InterceptKey, owner: u64, transport: &Transport) -> Result<String, String> {
        let mut entries = self.lock();
        if let Some(existing) = entries.get(&key) {
            if existing.owner == owner {
                return Ok(existing.intercept_id.clone());
            }
            if existing.transport.is_open() {
                return Err(format!("{key} is intercepted by another session"));
            }
        }
        let id = format!("icpt-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        entries.insert(
            key,
            Entry {
                intercept_id: id.clone(),
                owner,
                transport: transport.clone(),
            },
        );
        Ok(id)
    }

    /// Remove `key` if `owner` installed it. Unknown keys are fine.
    pub(crate) fn uninstall(&self, key: &InterceptKey, owner: u64) -> bool {
        let mut entries = self.lock();
        match entries.get(key) {
            Some(e) if e.owner == owner => entries.remove(key).is_some(),
            _ => false,
        }
    }

    /// Tunnel to send traffic for `key` through, while it is up.
    pub(crate) fn route(&self, key: &InterceptKey) -> Option<Transport> {
        self.lock()
            .get(key)
            .map(|e| e.transport.clone())
            .filter(|t| t.is_open())
    }

    /// Drop everything a tunnel installed. Returns how many were removed.
    pub(crate) fn remove_owner(&self, owner: u64) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, e| e.owner != owner);
        before - entries.len()
    }

    pub(crate) fn keys(&self) -> Vec<InterceptKey> {
        let mut keys: Vec<_> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<InterceptKey, Entry>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }
}
