//! Wires every component together behind a single cloneable handle.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::activity::ActivityMonitor;
use crate::config::Config;
use crate::events::EventBus;
use crate::ports::PortDetector;
use crate::proxy::ReverseProxy;
use crate::pty::PtyRegistry;
use crate::repo::RepoStore;
use crate::worktree::WorktreeManager;

const HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

#[derive(Clone)]
pub struct Daemon(Arc<Inner>);

struct Inner {
    config: Config,
    bus: Arc<EventBus>,
    repo_store: Arc<RepoStore>,
    worktrees: Arc<WorktreeManager>,
    ptys: Arc<PtyRegistry>,
    activity: Arc<ActivityMonitor>,
    ports: Arc<PortDetector>,
    proxy: Arc<ReverseProxy>,
}

impl Daemon {
    pub async fn start(config: Config) -> anyhow::Result<Daemon> {
        let config = Arc::new(config);
        let bus = EventBus::new();
        let repo_store = Arc::new(RepoStore::new(Arc::clone(&config)));
        let worktrees = WorktreeManager::new(Arc::clone(&config), Arc::clone(&repo_store), Arc::clone(&bus));
        let ptys = PtyRegistry::new(Arc::clone(&worktrees));
        let activity = ActivityMonitor::new(Arc::clone(&bus));
        let ports = PortDetector::new(Arc::clone(&bus), config.port_pool_start, config.port_pool_end);
        let proxy = Arc::new(ReverseProxy::new());

        ports.spawn_sampler();
        spawn_heartbeat(Arc::clone(&bus));

        for worktree in worktrees.list().await {
            if let Some(dir) = crate::activity::transcript_dir_for(&worktree.path) {
                activity.ensure_transcript_fallback(crate::id::WorktreeId(worktree.id.clone()), dir);
            }
        }

        Ok(Daemon(Arc::new(Inner {
            config: (*config).clone(),
            bus,
            repo_store,
            worktrees,
            ptys,
            activity,
            ports,
            proxy,
        })))
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.0.config.bind_address, self.0.config.port)
    }

    pub fn config(&self) -> &Config {
        &self.0.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.0.bus
    }

    pub fn repos(&self) -> &Arc<RepoStore> {
        &self.0.repo_store
    }

    pub fn worktrees(&self) -> &Arc<WorktreeManager> {
        &self.0.worktrees
    }

    pub fn ptys(&self) -> &Arc<PtyRegistry> {
        &self.0.ptys
    }

    pub fn activity(&self) -> &Arc<ActivityMonitor> {
        &self.0.activity
    }

    pub fn ports(&self) -> &Arc<PortDetector> {
        &self.0.ports
    }

    pub fn proxy(&self) -> &Arc<ReverseProxy> {
        &self.0.proxy
    }
}

fn spawn_heartbeat(bus: Arc<EventBus>) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(HEARTBEAT_INTERVAL).await;
            bus.publish(crate::events::EventKind::Heartbeat { uptime_secs: bus.uptime_secs() });
        }
    });
}
