//! Command-line surface. The original diagnostic tool took no
//! arguments at all (it was driven entirely through its GUI); a
//! headless gateway needs the config path and log verbosity
//! configurable without editing the environment.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "opcua-cloud-gateway",
    about = "Bridges on-premise OPC UA servers to a cloud message sink",
    version
)]
pub struct Cli {
    /// Path to the node configuration file. Defaults to
    /// `publishednodes.json` in the working directory, or the value of
    /// the `_GW_PNFP` environment variable if set.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Directory to write rolling log files into.
    #[arg(long, value_name = "DIR", default_value = ".")]
    pub log_dir: PathBuf,

    /// Increase log verbosity; repeat for more (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// When persisting the node configuration, downgrade every resolved
    /// `ExpandedNodeId` entry back to the bare `NodeId` form instead of
    /// preserving whichever form the operator originally configured.
    #[arg(long)]
    pub force_node_id_on_persist: bool,
}

impl Cli {
    pub fn resolved_config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(crate::config::file::config_path)
    }

    pub fn default_log_level(&self) -> tracing::Level {
        match self.verbose {
            0 => tracing::Level::WARN,
            1 => tracing::Level::INFO,
            2 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        }
    }
}
