use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use devwatch_protocol::SessionId;
use std::net::TcpListener;
use tracing::debug;

use crate::config::PortConfig;
use crate::error::{DevwatchError, Result};

/// Tracks which ports are reserved by which session.
///
/// A port is only handed out after an OS-level bind probe succeeds, and the
/// probe runs while the table entry for that port is locked, so two callers
/// can never both observe the same port as free.
pub struct PortAllocator {
    config: PortConfig,
    held: DashMap<u16, SessionId>,
}

impl PortAllocator {
    pub fn new(config: PortConfig) -> Self {
        Self {
            config,
            held: DashMap::new(),
        }
    }

    /// Reserve `preferred` if given, otherwise the first free port in range.
    pub fn allocate(&self, owner: &str, preferred: Option<u16>) -> Result<u16> {
        if let Some(port) = preferred {
            return if self.try_reserve(port, owner) {
                Ok(port)
            } else {
                Err(DevwatchError::PortInUse(port))
            };
        }

        let (start, end) = (self.config.range_start, self.config.range_end);
        if start <= end {
            for port in start..=end {
                if self.try_reserve(port, owner) {
                    return Ok(port);
                }
            }
        }
        Err(DevwatchError::NoFreePort { start, end })
    }

    /// Record a port as held without probing it. Used for orphaned processes
    /// found alive on registry reload, which are bound to the port already.
    pub fn reserve_existing(&self, port: u16, owner: &str) -> bool {
        match self.held.entry(port) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(owner.to_string());
                true
            }
        }
    }

    pub fn release(&self, port: u16) {
        if let Some((_, owner)) = self.held.remove(&port) {
            debug!(port, owner = %owner, "port released");
        }
    }

    pub fn is_held(&self, port: u16) -> bool {
        self.held.contains_key(&port)
    }

    pub fn holder(&self, port: u16) -> Option<SessionId> {
        self.held.get(&port).map(|owner| owner.value().clone())
    }

    pub fn held_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.held.iter().map(|entry| *entry.key()).collect();
        ports.sort_unstable();
        ports
    }

    fn try_reserve(&self, port: u16, owner: &str) -> bool {
        match self.held.entry(port) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                if !self.is_bindable(port) {
                    debug!(port, "port occupied outside the allocator");
                    return false;
                }
                slot.insert(owner.to_string());
                debug!(port, owner, "port reserved");
                true
            }
        }
    }

    fn is_bindable(&self, port: u16) -> bool {
        TcpListener::bind((self.config.probe_host.as_str(), port)).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn free_range(len: u16) -> PortConfig {
        // Find a run of ports the OS currently lets us bind.
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let base = listener.local_addr().unwrap().port();
        drop(listener);
        let start = if base > u16::MAX - len { base - len } else { base };
        PortConfig {
            range_start: start,
            range_end: start + len - 1,
            probe_host: "127.0.0.1".to_string(),
        }
    }

    #[test]
    fn allocate_release_cycle() {
        let cfg = free_range(8);
        let allocator = PortAllocator::new(cfg);
        let port = allocator.allocate("web", None).unwrap();
        assert!(allocator.is_held(port));
        assert_eq!(allocator.holder(port).as_deref(), Some("web"));

        allocator.release(port);
        assert!(!allocator.is_held(port));
    }

    #[test]
    fn preferred_port_held_is_rejected() {
        let cfg = free_range(8);
        let port = cfg.range_start;
        let allocator = PortAllocator::new(cfg);
        assert!(!allocator.is_held(port));
        if allocator.allocate("a", Some(port)).is_err() {
            // Something else grabbed the port between probe and test.
            return;
        }
        let err = allocator.allocate("b", Some(port)).unwrap_err();
        assert!(matches!(err, DevwatchError::PortInUse(p) if p == port));
        assert_eq!(allocator.holder(port).as_deref(), Some("a"));
    }

    #[test]
    fn externally_bound_port_is_skipped() {
        let blocker = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let busy = blocker.local_addr().unwrap().port();
        let allocator = PortAllocator::new(PortConfig {
            range_start: busy,
            range_end: busy,
            probe_host: "127.0.0.1".to_string(),
        });

        assert!(matches!(
            allocator.allocate("web", Some(busy)),
            Err(DevwatchError::PortInUse(_))
        ));
        assert!(matches!(
            allocator.allocate("web", None),
            Err(DevwatchError::NoFreePort { .. })
        ));
        assert!(!allocator.is_held(busy));
    }

    #[test]
    fn concurrent_allocations_never_share_a_port() {
        let allocator = Arc::new(PortAllocator::new(free_range(32)));
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let allocator = Arc::clone(&allocator);
                std::thread::spawn(move || allocator.allocate(&format!("s{i}"), None).ok())
            })
            .collect();

        let mut ports: Vec<u16> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        let total = ports.len();
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), total);
        assert_eq!(allocator.held_ports(), ports);
    }
}
