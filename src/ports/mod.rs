//! Port Detector & Allocation (Component E). Samples the kernel's TCP
//! listener table and drives `port:opened`/`port:closed` events; also hands
//! out disjoint `$PORT` allocations to worktrees.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::events::{EventBus, EventKind};

const LISTEN_STATE: &str = "0A";
const GRACE_SAMPLES: u32 = 3;
const SAMPLE_INTERVAL: Duration = Duration::from_millis(800);

#[derive(Debug, Clone, Serialize)]
pub struct PortMapping {
    pub port: u16,
    pub service_label: Option<String>,
    pub protocol: &'static str,
    pub status: &'static str,
    pub first_seen: u64,
    pub worktree_id: Option<String>,
}

struct TrackedPort {
    service_label: Option<String>,
    first_seen: u64,
    missing_samples: u32,
}

pub struct PortDetector {
    bus: Arc<EventBus>,
    seen: Mutex<HashMap<u16, TrackedPort>>,
    labels: Mutex<HashMap<u16, String>>,
    allocations: Mutex<HashMap<String, u16>>,
    next_candidate: AtomicU32,
    pool_start: u16,
    pool_end: u16,
    start: Instant,
}

impl PortDetector {
    pub fn new(bus: Arc<EventBus>, pool_start: u16, pool_end: u16) -> Arc<PortDetector> {
        Arc::new(PortDetector {
            bus,
            seen: Mutex::new(HashMap::new()),
            labels: Mutex::new(HashMap::new()),
            allocations: Mutex::new(HashMap::new()),
            next_candidate: AtomicU32::new(pool_start as u32),
            pool_start,
            pool_end,
            start: Instant::now(),
        })
    }

    /// Allocates a port from the reserved pool for `worktree_id`, reusing any
    /// existing allocation. Linear probe bounded by the pool size; the pool
    /// is sized generously enough in practice that collisions are rare.
    pub fn allocate(&self, worktree_id: &str) -> Option<u16> {
        let mut allocations = self.allocations.lock();
        if let Some(&port) = allocations.get(worktree_id) {
            return Some(port);
        }

        let taken: std::collections::HashSet<u16> = allocations.values().copied().collect();
        let span = (self.pool_end - self.pool_start) as u32 + 1;

        for offset in 0..span {
            let candidate = self.pool_start as u32
                + (self.next_candidate.fetch_add(1, Ordering::SeqCst) + offset) % span;
            let candidate = candidate as u16;
            if !taken.contains(&candidate) {
                allocations.insert(worktree_id.to_string(), candidate);
                return Some(candidate);
            }
        }
        None
    }

    pub fn release(&self, worktree_id: &str) {
        self.allocations.lock().remove(worktree_id);
    }

    pub fn set_service_label(&self, port: u16, label: String) {
        self.labels.lock().insert(port, label);
    }

    pub fn list(&self) -> Vec<PortMapping> {
        let seen = self.seen.lock();
        seen.iter()
            .map(|(&port, tracked)| PortMapping {
                port,
                service_label: tracked.service_label.clone(),
                protocol: "tcp",
                status: "open",
                first_seen: tracked.first_seen,
                worktree_id: None,
            })
            .collect()
    }

    /// Spawns the periodic `/proc/net/tcp[6]` sampling loop. No-ops off Linux
    /// (sampling source unavailable); the allocator still functions.
    pub fn spawn_sampler(self: &Arc<Self>) {
        let detector = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                detector.sample_once();
                tokio::time::sleep(SAMPLE_INTERVAL).await;
            }
        });
    }

    fn sample_once(&self) {
        let mut listening = listening_ports("/proc/net/tcp");
        listening.extend(listening_ports("/proc/net/tcp6"));

        let mut seen = self.seen.lock();
        let now = self.start.elapsed().as_secs();

        for &port in &listening {
            if !seen.contains_key(&port) {
                let label = self.labels.lock().get(&port).cloned().or_else(|| resolve_service_label(port));
                seen.insert(
                    port,
                    TrackedPort {
                        service_label: label.clone(),
                        first_seen: now,
                        missing_samples: 0,
                    },
                );
                self.bus.publish(EventKind::PortOpened { port, service_label: label });
            } else if let Some(tracked) = seen.get_mut(&port) {
                tracked.missing_samples = 0;
            }
        }

        let mut closed = Vec::new();
        for (&port, tracked) in seen.iter_mut() {
            if !listening.contains(&port) {
                tracked.missing_samples += 1;
                if tracked.missing_samples >= GRACE_SAMPLES {
                    closed.push(port);
                }
            }
        }
        for port in closed {
            seen.remove(&port);
            self.bus.publish(EventKind::PortClosed { port });
        }
    }
}

fn listening_ports(path: &str) -> std::collections::HashSet<u16> {
    let mut ports = std::collections::HashSet::new();
    let Ok(contents) = std::fs::read_to_string(path) else {
        return ports;
    };

    for line in contents.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // Columns: sl, local_address, rem_address, st, ...
        let (Some(&local_address), Some(&state)) = (fields.get(1), fields.get(3)) else { continue };
        if state != LISTEN_STATE {
            continue;
        }
        let Some((_, port_hex)) = local_address.rsplit_once(':') else { continue };
        if let Ok(port) = u16::from_str_radix(port_hex, 16) {
            ports.insert(port);
        }
    }
    ports
}

/// Best-effort: resolves a listening port's owning process's command line by
/// walking every `/proc/<pid>/fd` looking for a socket inode matching the
/// port. Returns `None` on any failure; this is advisory UI metadata only.
fn resolve_service_label(port: u16) -> Option<String> {
    let inode = find_socket_inode(port)?;
    let proc_dir = std::fs::read_dir("/proc").ok()?;

    for entry in proc_dir.flatten() {
        let pid = entry.file_name().to_str()?.parse::<u32>().ok();
        let Some(pid) = pid else { continue };

        let fd_dir = format!("/proc/{pid}/fd");
        let Ok(fds) = std::fs::read_dir(&fd_dir) else { continue };

        for fd in fds.flatten() {
            let Ok(link) = std::fs::read_link(fd.path()) else { continue };
            let Some(link_str) = link.to_str() else { continue };
            if link_str == format!("socket:[{inode}]") {
                let cmdline = std::fs::read_to_string(format!("/proc/{pid}/cmdline")).ok()?;
                let label = cmdline.split('\0').next().unwrap_or_default();
                if !label.is_empty() {
                    return Some(label.to_string());
                }
            }
        }
    }
    None
}

fn find_socket_inode(port: u16) -> Option<u64> {
    for path in ["/proc/net/tcp", "/proc/net/tcp6"] {
        let contents = std::fs::read_to_string(path).ok()?;
        for line in contents.lines().skip(1) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            // Columns: sl, local_address, rem_address, st, tx:rx, tr:tm, retrnsmt, uid, timeout, inode.
            let Some(&local_address) = fields.get(1) else { continue };
            let inode = fields.get(9);
            let Some((_, port_hex)) = local_address.rsplit_once(':') else { continue };
            if u16::from_str_radix(port_hex, 16) == Ok(port) {
                return inode.and_then(|i| i.parse().ok());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_is_stable_for_same_worktree() {
        let detector = PortDetector::new(EventBus::new(), 20000, 20010);
        let a = detector.allocate("w1").unwrap();
        let b = detector.allocate("w1").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn allocate_assigns_disjoint_ports() {
        let detector = PortDetector::new(EventBus::new(), 20000, 20010);
        let a = detector.allocate("w1").unwrap();
        let b = detector.allocate("w2").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn release_frees_allocation_for_reuse() {
        let detector = PortDetector::new(EventBus::new(), 20000, 20001);
        let a = detector.allocate("w1").unwrap();
        detector.release("w1");
        assert!(detector.allocations.lock().is_empty());
        let b = detector.allocate("w2").unwrap();
        assert_eq!(a, b);
    }
}
