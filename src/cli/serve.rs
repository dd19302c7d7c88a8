use std::net::IpAddr;

use clap::Parser;

use crate::config::Config;
use crate::logging;
use crate::state::Daemon;
use crate::web::LiveServer;

use super::{ColorChoice, GlobalOptions};

/// Run the Catnip daemon: expose the repo store, worktree manager, PTY
/// registry, and reverse proxy over HTTP on the configured port.
#[derive(Debug, Parser)]
pub struct ServeCommand {
    /// Address to bind the public HTTP listener on. Overrides config/env.
    #[clap(long)]
    pub address: Option<IpAddr>,

    /// Port to bind the public HTTP listener on. Overrides config/env/`$PORT`.
    #[clap(long)]
    pub port: Option<u16>,
}

impl Default for ServeCommand {
    fn default() -> Self {
        ServeCommand {
            address: None,
            port: None,
        }
    }
}

impl ServeCommand {
    pub fn run(self) -> anyhow::Result<()> {
        self.run_with_global(GlobalOptions {
            verbosity: 0,
            color: ColorChoice::Auto,
        })
    }

    pub fn run_with_global(self, global: GlobalOptions) -> anyhow::Result<()> {
        let config = Config::resolve(self.address, self.port)?;
        config.ensure_dirs()?;

        let _log_guard = logging::init_logging(global.verbosity, global.color, Some(&config.logs_dir()));

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;

        runtime.block_on(async move {
            let daemon = Daemon::start(config).await?;
            let addr = daemon.bind_addr();
            tracing::info!(%addr, "catnipd listening");

            let server = LiveServer::new(daemon.clone());
            server.serve(addr).await
        })
    }
}
