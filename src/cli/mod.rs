//! The `gpupgrade` command line.

pub mod commands;
pub mod step;
pub mod text;
pub mod ui;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::grpc::idl::Step as Phase;
use text::{substep_help, GLOBAL_HELP};

pub use commands::run;

#[derive(Parser, Debug)]
#[command(name = "gpupgrade", version, about = "Major-version upgrades of Greenplum clusters")]
#[command(long_about = GLOBAL_HELP)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Prepare the system for upgrade
    #[command(after_long_help = substep_help(Phase::Initialize))]
    Initialize(InitializeArgs),

    /// Upgrade the master and primary segments
    #[command(after_long_help = substep_help(Phase::Execute))]
    Execute(PhaseArgs),

    /// Finish the upgrade; there is no reverting afterwards
    #[command(after_long_help = substep_help(Phase::Finalize))]
    Finalize(PhaseArgs),

    /// Return the cluster to its original state
    #[command(after_long_help = substep_help(Phase::Revert))]
    Revert(PhaseArgs),

    /// Print the gpupgrade version
    Version,

    /// Show or change settings used by subsequent commands
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Start the hub if needed and restart any agent that is down
    RestartServices,

    /// Stop the hub and every agent
    KillServices,

    /// Run the hub daemon
    #[command(hide = true)]
    Hub(HubArgs),

    /// Run the agent daemon
    #[command(hide = true)]
    Agent(AgentArgs),
}

#[derive(Args, Debug, Default, Clone)]
pub struct InitializeArgs {
    /// The configuration file to use
    #[arg(short = 'f', long)]
    pub file: Option<PathBuf>,

    /// Do not prompt for confirmation to proceed
    #[arg(short = 'a', long, alias = "non-interactive")]
    pub automatic: bool,

    /// Print the output stream from all substeps
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Path of the source Greenplum installation
    #[arg(long)]
    pub source_gphome: Option<PathBuf>,

    /// Path of the target Greenplum installation
    #[arg(long)]
    pub target_gphome: Option<PathBuf>,

    /// Master port of the source cluster
    #[arg(long)]
    pub source_master_port: Option<i32>,

    /// Upgrade in copy or link mode [default: copy]
    #[arg(long)]
    pub mode: Option<String>,

    /// Fraction of disk space that must stay free, from 0.0 to 1.0
    /// [default: 0.2 in link mode, 0.6 in copy mode]
    #[arg(long)]
    pub disk_free_ratio: Option<f64>,

    /// Use hostnames rather than addresses in pg_hba.conf
    #[arg(long)]
    pub use_hba_hostnames: bool,

    /// dynamic_library_path for the target cluster, to find extensions
    /// installed outside their default location
    #[arg(long)]
    pub dynamic_library_path: Option<String>,

    /// Ports the target cluster may use, e.g. 50432-65535 or 6000,6002-6010
    #[arg(long)]
    pub temp_port_range: Option<String>,

    /// Port the hub listens on [default: 7527]
    #[arg(long)]
    pub hub_port: Option<u16>,

    /// Port the agents listen on [default: 6416]
    #[arg(long)]
    pub agent_port: Option<u16>,

    /// Stop after the pre-creation substeps
    #[arg(long, hide = true)]
    pub stop_before_cluster_creation: bool,
}

#[derive(Args, Debug, Default, Clone)]
pub struct PhaseArgs {
    /// Print the output stream from all substeps
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Do not prompt for confirmation to proceed
    #[arg(short = 'a', long, alias = "non-interactive")]
    pub automatic: bool,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Show configuration settings
    Show(ConfigShowArgs),
    /// Change configuration settings
    Set(ConfigSetArgs),
}

#[derive(Args, Debug, Default, Clone)]
pub struct ConfigShowArgs {
    /// Show the upgrade identifier
    #[arg(long)]
    pub id: bool,
    /// Show the source Greenplum installation
    #[arg(long)]
    pub source_gphome: bool,
    /// Show the target Greenplum installation
    #[arg(long)]
    pub target_gphome: bool,
    /// Show the target cluster's temporary master data directory
    #[arg(long)]
    pub target_datadir: bool,
    /// Show the target cluster's temporary master port
    #[arg(long)]
    pub target_port: bool,
    /// Show the upgrade mode
    #[arg(long)]
    pub mode: bool,
}

impl ConfigShowArgs {
    /// Keys to show, in display order. No flag means every key.
    pub fn keys(&self) -> Vec<&'static str> {
        let requested: Vec<&'static str> = [
            (self.id, "id"),
            (self.source_gphome, "source-gphome"),
            (self.target_gphome, "target-gphome"),
            (self.target_datadir, "target-datadir"),
            (self.target_port, "target-port"),
            (self.mode, "mode"),
        ]
        .into_iter()
        .filter_map(|(set, key)| set.then_some(key))
        .collect();

        if requested.is_empty() {
            crate::config::CONFIG_KEYS.to_vec()
        } else {
            requested
        }
    }
}

#[derive(Args, Debug, Default, Clone)]
pub struct ConfigSetArgs {
    /// New path of the source Greenplum installation
    #[arg(long)]
    pub source_gphome: Option<PathBuf>,
    /// New path of the target Greenplum installation
    #[arg(long)]
    pub target_gphome: Option<PathBuf>,
}

#[derive(Args, Debug, Default, Clone)]
pub struct DaemonArgs {
    /// Start in the background
    #[arg(long)]
    pub daemonize: bool,

    /// Disconnect standard streams once listening (internal; use --daemonize)
    #[arg(long, hide = true)]
    pub daemon: bool,
}

#[derive(Args, Debug, Default, Clone)]
pub struct HubArgs {
    /// The port to listen for commands on
    #[arg(long)]
    pub port: Option<u16>,

    #[command(flatten)]
    pub daemon: DaemonArgs,
}

#[derive(Args, Debug, Default, Clone)]
pub struct AgentArgs {
    /// The port to listen for the hub on
    #[arg(long, default_value_t = crate::env::DEFAULT_AGENT_PORT)]
    pub port: u16,

    /// Agent state directory
    #[arg(long)]
    pub state_directory: Option<PathBuf>,

    #[command(flatten)]
    pub daemon: DaemonArgs,
}
