//! Handlers behind each `gpupgrade` subcommand.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::CommandFactory;
use log::{debug, info};
use tonic::transport::Channel;
use tonic::Streaming;

use super::step::{Prompt, Step};
use super::text::{self, InitializeSummary};
use super::ui::{target_info, ui_loop};
use super::{AgentArgs, Cli, Command, ConfigCommand, ConfigSetArgs, ConfigShowArgs, HubArgs, InitializeArgs, PhaseArgs};
use crate::config::file::parse_config;
use crate::config::ports::parse_ports;
use crate::config::{HubConfig, Mode, DEFAULT_TEMP_PORT_RANGE};
use crate::daemon;
use crate::disk::LocalDisk;
use crate::env::{Env, DEFAULT_AGENT_PORT};
use crate::error::{Error, Result};
use crate::exec::{self, CommandRunner, ShellRunner};
use crate::grpc::idl::cli_to_hub_client::CliToHubClient;
use crate::grpc::idl::{self, Message, Status, Step as Phase, Substep};
use crate::grpc::{connect_channel, connect_hub};
use crate::hub::{self, Hub};
use crate::logging::build_logger;
use crate::step::stream::{OutStreams, StdStreams};
use crate::step::substeps::format_status;
use crate::upgrade::{delete_directories, hostname, STATE_DIRECTORY_FILES};

type HubClient = CliToHubClient<Channel>;

/// Parameters accepted by `initialize --file`, as flag names.
const FILE_PARAMETERS: &[&str] = &[
    "source-gphome",
    "target-gphome",
    "source-master-port",
    "mode",
    "disk-free-ratio",
    "use-hba-hostnames",
    "dynamic-library-path",
    "temp-port-range",
    "hub-port",
    "agent-port",
    "stop-before-cluster-creation",
];

pub async fn run(cli: Cli) -> Result<()> {
    let env = Env::from_env()?;

    match cli.command {
        Command::Initialize(args) => initialize(env, args).await,
        Command::Execute(args) => execute(env, args).await,
        Command::Finalize(args) => finalize(env, args).await,
        Command::Revert(args) => revert(env, args).await,
        Command::Version => {
            println!("Version: {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Config(ConfigCommand::Show(args)) => config_show(env, args).await,
        Command::Config(ConfigCommand::Set(args)) => config_set(env, args).await,
        Command::RestartServices => restart_services(env).await,
        Command::KillServices => kill_services(env).await,
        Command::Hub(args) => run_hub(env, args).await,
        Command::Agent(args) => run_agent(env, args).await,
    }
}

fn console() -> Arc<dyn OutStreams> {
    Arc::new(StdStreams)
}

/// `env` pointed at the hub port recorded by initialize, when there is one.
fn hub_env(env: Env) -> Result<Env> {
    let path = env.config_path();
    if !path.exists() {
        return Ok(env);
    }
    let port = HubConfig::load(&path)?.hub_port;
    Ok(env.with_hub_port(port))
}

async fn hub_is_running(env: &Env) -> bool {
    connect_channel(&env.hub_address(), env.connection_timeout)
        .await
        .is_ok()
}

/// Starts the hub in the background through `gpupgrade hub --daemonize`.
async fn start_hub(env: &Env, streams: Option<&dyn OutStreams>) -> Result<()> {
    let exe = std::env::current_exe().map_err(|e| Error::io("locating the gpupgrade executable", e))?;
    let cmd = exec::Command::new(exe.display().to_string()).args([
        "hub".to_string(),
        daemon::DAEMONIZE_FLAG.to_string(),
        "--port".to_string(),
        env.hub_port.to_string(),
    ]);

    debug!("starting hub: {}", cmd);
    ShellRunner.run(&cmd, streams).await?;
    Ok(())
}

/// Asks the hub to stop itself and every agent. A hub that hangs up while
/// shutting down has done what was asked.
async fn stop_services(env: &Env) -> Result<()> {
    let mut client = connect_hub(env).await?;
    match client.stop_services(idl::StopServicesRequest {}).await {
        Ok(_) => Ok(()),
        Err(status) if status.code() == tonic::Code::Unavailable => Ok(()),
        Err(status) => Err(status.into()),
    }
}

/// Runs one streaming phase RPC and renders it, returning the hub's
/// response data.
async fn stream_phase<F, Fut>(env: &Env, verbose: bool, console: &dyn OutStreams, rpc: F) -> Result<HashMap<String, String>>
where
    F: FnOnce(HubClient) -> Fut,
    Fut: Future<Output = std::result::Result<tonic::Response<Streaming<Message>>, tonic::Status>>,
{
    let client = connect_hub(env).await?;
    let stream = rpc(client).await?.into_inner();

    let (data, result) = ui_loop(Box::pin(stream), verbose, console).await;
    result?;
    Ok(data)
}

fn new_step(phase: Phase, env: &Env, args: &PhaseArgs, prompt_text: String) -> Result<Step> {
    if args.automatic {
        return Step::new(phase, env, console(), args.verbose, None);
    }

    let stdin = std::io::stdin();
    let mut input = stdin.lock();
    let prompt = Prompt {
        text: prompt_text,
        input: &mut input,
    };
    Step::new(phase, env, console(), args.verbose, Some(prompt))
}

/// Fully resolved `initialize` parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct InitializeParams {
    /// Where the values came from, for the confirmation summary.
    pub source: String,
    pub source_gphome: PathBuf,
    pub target_gphome: PathBuf,
    pub source_port: i32,
    pub mode: Mode,
    pub disk_free_ratio: f64,
    pub use_hba_hostnames: bool,
    pub dynamic_library_path: String,
    pub temp_port_range: String,
    pub ports: Vec<u16>,
    pub hub_port: u16,
    pub agent_port: u16,
    pub stop_before_cluster_creation: bool,
}

fn has_parameter_flags(args: &InitializeArgs) -> bool {
    args.source_gphome.is_some()
        || args.target_gphome.is_some()
        || args.source_master_port.is_some()
        || args.mode.is_some()
        || args.disk_free_ratio.is_some()
        || args.use_hba_hostnames
        || args.dynamic_library_path.is_some()
        || args.temp_port_range.is_some()
        || args.hub_port.is_some()
        || args.agent_port.is_some()
        || args.stop_before_cluster_creation
}

fn parse_value<T>(name: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|e| Error::Validation(format!("set {:?} to {:?}: {}", name, value, e)))
}

/// Applies one `--file` parameter to `args` as if it had been given as a
/// flag.
fn apply_parameter(args: &mut InitializeArgs, name: &str, value: &str) -> Result<()> {
    match name {
        "source-gphome" => args.source_gphome = Some(PathBuf::from(value)),
        "target-gphome" => args.target_gphome = Some(PathBuf::from(value)),
        "source-master-port" => args.source_master_port = Some(parse_value(name, value)?),
        "mode" => args.mode = Some(value.to_string()),
        "disk-free-ratio" => args.disk_free_ratio = Some(parse_value(name, value)?),
        "use-hba-hostnames" => args.use_hba_hostnames = parse_value(name, value)?,
        "dynamic-library-path" => args.dynamic_library_path = Some(value.to_string()),
        "temp-port-range" => args.temp_port_range = Some(value.to_string()),
        "hub-port" => args.hub_port = Some(parse_value(name, value)?),
        "agent-port" => args.agent_port = Some(parse_value(name, value)?),
        "stop-before-cluster-creation" => args.stop_before_cluster_creation = parse_value(name, value)?,
        _ => {
            return Err(Error::Validation(format!(
                "The configuration parameter {:?} was not found in the list of supported parameters: {}",
                name,
                FILE_PARAMETERS.join(", ")
            )))
        }
    }
    Ok(())
}

/// Merges flags with the `--file` parameters and fills in defaults.
/// Returns `None` when neither a file nor any parameter flag was given.
pub fn resolve_initialize(mut args: InitializeArgs, default_hub_port: u16) -> Result<Option<InitializeParams>> {
    let source = match args.file.clone() {
        Some(file) => {
            if has_parameter_flags(&args) {
                return Err(Error::Validation(
                    "The file flag cannot be used with any other flag except verbose and automatic.".to_string(),
                ));
            }

            let text = std::fs::read_to_string(&file)
                .map_err(|e| Error::io(format!("in file {:?}", file.display().to_string()), e))?;
            let params = parse_config(&text).map_err(|e| e.context(format!("in file {:?}", file.display().to_string())))?;
            for (name, value) in &params {
                apply_parameter(&mut args, name, value)?;
            }
            file.display().to_string()
        }
        None if !has_parameter_flags(&args) => return Ok(None),
        None => "the command line".to_string(),
    };

    let missing: Vec<String> = [
        ("source-gphome", args.source_gphome.is_none()),
        ("target-gphome", args.target_gphome.is_none()),
        ("source-master-port", args.source_master_port.is_none()),
    ]
    .into_iter()
    .filter(|(_, missing)| *missing)
    .map(|(name, _)| format!("{:?}", name))
    .collect();
    if !missing.is_empty() {
        return Err(Error::Validation(format!("required flag(s) {} not set", missing.join(", "))));
    }

    let mode = match &args.mode {
        Some(mode) => Mode::parse(mode)?,
        None => Mode::default(),
    };

    let disk_free_ratio = args.disk_free_ratio.unwrap_or_else(|| mode.default_disk_free_ratio());
    if !(0.0..=1.0).contains(&disk_free_ratio) {
        return Err(Error::Validation(format!(
            "invalid argument {} for \"--disk-free-ratio\" flag: value must be between 0.0 and 1.0",
            disk_free_ratio
        )));
    }

    let temp_port_range = args
        .temp_port_range
        .unwrap_or_else(|| DEFAULT_TEMP_PORT_RANGE.to_string());
    let ports = parse_ports(&temp_port_range)?;

    Ok(Some(InitializeParams {
        source,
        source_gphome: args.source_gphome.unwrap_or_default(),
        target_gphome: args.target_gphome.unwrap_or_default(),
        source_port: args.source_master_port.unwrap_or_default(),
        mode,
        disk_free_ratio,
        use_hba_hostnames: args.use_hba_hostnames,
        dynamic_library_path: args.dynamic_library_path.unwrap_or_default(),
        temp_port_range,
        ports,
        hub_port: args.hub_port.unwrap_or(default_hub_port),
        agent_port: args.agent_port.unwrap_or(DEFAULT_AGENT_PORT),
        stop_before_cluster_creation: args.stop_before_cluster_creation,
    }))
}

impl InitializeParams {
    fn request(&self) -> idl::InitializeRequest {
        let mode = match self.mode {
            Mode::Copy => idl::Mode::Copy,
            Mode::Link => idl::Mode::Link,
        };

        idl::InitializeRequest {
            source_gphome: self.source_gphome.display().to_string(),
            target_gphome: self.target_gphome.display().to_string(),
            source_port: self.source_port,
            mode: mode as i32,
            disk_free_ratio: self.disk_free_ratio,
            ports: self.ports.iter().map(|&p| u32::from(p)).collect(),
            agent_port: i32::from(self.agent_port),
            use_hba_hostnames: self.use_hba_hostnames,
            dynamic_library_path: self.dynamic_library_path.clone(),
        }
    }

    fn summary<'a>(&'a self, log_dir: &'a Path) -> InitializeSummary<'a> {
        InitializeSummary {
            log_dir,
            source: &self.source,
            source_port: self.source_port,
            source_gphome: &self.source_gphome,
            target_gphome: &self.target_gphome,
            mode: self.mode,
            disk_free_ratio: self.disk_free_ratio,
            use_hba_hostnames: self.use_hba_hostnames,
            dynamic_library_path: &self.dynamic_library_path,
            temp_port_range: &self.temp_port_range,
            hub_port: self.hub_port,
            agent_port: self.agent_port,
        }
    }
}

/// Creates the state directory that holds the step store, reporting it as
/// its own substep since it happens before the phase can be recorded.
fn create_state_directory(env: &Env, console: &dyn OutStreams) -> Result<()> {
    let print = |text: String| console.print(&text).map_err(|e| Error::io("writing to terminal", e));

    print(format_status(Substep::CreatingDirectories, Status::Running))?;
    let result = std::fs::create_dir_all(&env.state_dir)
        .map_err(|e| Error::io(format!("creating state directory {:?}", env.state_dir), e));
    let status = if result.is_ok() { Status::Complete } else { Status::Failed };
    print(format!("\r{}\n", format_status(Substep::CreatingDirectories, status)))?;

    result
}

async fn initialize(env: Env, args: InitializeArgs) -> Result<()> {
    let automatic = args.automatic;
    let verbose = args.verbose;

    let Some(params) = resolve_initialize(args, env.hub_port)? else {
        let mut cmd = Cli::command();
        if let Some(sub) = cmd.find_subcommand_mut("initialize") {
            sub.print_long_help().map_err(|e| Error::io("printing help", e))?;
        }
        return Ok(());
    };

    let console = console();
    create_state_directory(&env, console.as_ref())?;

    let phase_args = PhaseArgs { verbose, automatic };
    let prompt = text::initialize_confirmation(&params.summary(&env.log_dir));
    let mut step = new_step(Phase::Initialize, &env, &phase_args, prompt)?;

    // A hub from an earlier, unfinished initialize keeps its recorded port.
    let config_path = env.config_path();
    let env = if config_path.exists() {
        hub_env(env)?
    } else {
        env.with_hub_port(params.hub_port)
    };

    let path = &config_path;
    let (hub_port, agent_port) = (params.hub_port, params.agent_port);
    step.run_internal_substep(move || async move {
        if path.exists() {
            return Ok(());
        }
        info!("writing initial configuration to {:?}", path);
        HubConfig::default()
            .with_hub_port(hub_port)
            .with_agent_port(agent_port)
            .save(path)
    })
    .await;

    let hub = &env;
    step.run_cli_substep(Substep::StartHub, move |streams| async move {
        if hub_is_running(hub).await {
            return Err(Error::Skip);
        }
        start_hub(hub, Some(streams.as_ref())).await
    })
    .await;

    let request = params.request();
    step.run_hub_substep(move |console| async move {
        stream_phase(hub, verbose, console.as_ref(), |mut client| async move {
            client.initialize(request).await
        })
        .await
        .map(|_| ())
    })
    .await;

    let mut data = HashMap::new();
    let out = &mut data;
    let stop_early = params.stop_before_cluster_creation;
    step.run_hub_substep(move |console| async move {
        if stop_early {
            return Err(Error::Skip);
        }
        *out = stream_phase(hub, verbose, console.as_ref(), |mut client| async move {
            client
                .initialize_create_cluster(idl::InitializeCreateClusterRequest {})
                .await
        })
        .await?;
        Ok(())
    })
    .await;

    let warning = if stop_early { String::new() } else { text::initialize_warning(&data) };
    step.complete(&text::initialize_complete(&warning))
}

async fn execute(env: Env, args: PhaseArgs) -> Result<()> {
    let env = hub_env(env)?;
    let mut step = new_step(Phase::Execute, &env, &args, text::execute_confirmation(&env.log_dir))?;
    let verbose = args.verbose;

    let mut data = HashMap::new();
    let out = &mut data;
    let hub = &env;
    step.run_hub_substep(move |console| async move {
        *out = stream_phase(hub, verbose, console.as_ref(), |mut client| async move {
            client.execute(idl::ExecuteRequest {}).await
        })
        .await?;
        Ok(())
    })
    .await;

    let mut target = (String::new(), String::new());
    let r = &mut target;
    let d = &data;
    step.run_internal_substep(move || async move {
        *r = target_info(d)?;
        Ok(())
    })
    .await;

    step.complete(&text::execute_complete(&target.0, &target.1))
}

/// Shared tail of finalize and revert: with the hub's work done, stop the
/// services and remove the coordinator's state directory.
async fn stop_and_clean_up(step: &mut Step, env: &Env) {
    step.run_cli_substep(Substep::StopHubAndAgents, move |_| async move {
        if !hub_is_running(env).await {
            return Err(Error::Skip);
        }
        stop_services(env).await
    })
    .await;

    if step.err().is_some() {
        return;
    }

    // The step store lives in the directory about to be deleted.
    step.disable_store();

    step.run_cli_substep(Substep::DeleteMasterStatedir, move |streams| async move {
        let host = hostname()?;
        let required: Vec<String> = STATE_DIRECTORY_FILES.iter().map(|f| f.to_string()).collect();
        delete_directories(&[env.state_dir.clone()], &required, &host, streams.as_ref())
    })
    .await;
}

async fn finalize(env: Env, args: PhaseArgs) -> Result<()> {
    let env = hub_env(env)?;
    let mut step = new_step(Phase::Finalize, &env, &args, text::finalize_confirmation(&env.log_dir))?;
    let verbose = args.verbose;

    let mut data = HashMap::new();
    let out = &mut data;
    let hub = &env;
    step.run_hub_substep(move |console| async move {
        *out = stream_phase(hub, verbose, console.as_ref(), |mut client| async move {
            client.finalize(idl::FinalizeRequest {}).await
        })
        .await?;
        Ok(())
    })
    .await;

    stop_and_clean_up(&mut step, &env).await;
    step.complete(&text::finalize_complete(&data))
}

async fn revert(env: Env, args: PhaseArgs) -> Result<()> {
    let env = hub_env(env)?;
    let mut step = new_step(Phase::Revert, &env, &args, text::revert_confirmation(&env.log_dir))?;
    let verbose = args.verbose;

    let mut data = HashMap::new();
    let out = &mut data;
    let hub = &env;
    step.run_hub_substep(move |console| async move {
        *out = stream_phase(hub, verbose, console.as_ref(), |mut client| async move {
            client.revert(idl::RevertRequest {}).await
        })
        .await?;
        Ok(())
    })
    .await;

    stop_and_clean_up(&mut step, &env).await;
    step.complete(&text::revert_complete(&data))
}

async fn config_show(env: Env, args: ConfigShowArgs) -> Result<()> {
    let env = hub_env(env)?;
    let mut client = connect_hub(&env).await?;

    let keys = args.keys();
    for key in &keys {
        let value = client
            .get_config(idl::GetConfigRequest { name: key.to_string() })
            .await?
            .into_inner()
            .value;

        if keys.len() == 1 {
            println!("{}", value);
        } else {
            println!("{} - {}", key, value);
        }
    }
    Ok(())
}

async fn config_set(env: Env, args: ConfigSetArgs) -> Result<()> {
    let changes: Vec<(&str, String)> = [
        ("source-gphome", args.source_gphome),
        ("target-gphome", args.target_gphome),
    ]
    .into_iter()
    .filter_map(|(name, value)| value.map(|v| (name, v.display().to_string())))
    .collect();

    if changes.is_empty() {
        return Err(Error::Validation(
            "the requested operation requires at least one flag".to_string(),
        ));
    }

    let env = hub_env(env)?;
    let mut client = connect_hub(&env).await?;
    for (name, value) in changes {
        client
            .set_config(idl::SetConfigRequest {
                name: name.to_string(),
                value: value.clone(),
            })
            .await?;
        println!("Successfully set {} to {}", name, value);
    }
    Ok(())
}

async fn restart_services(env: Env) -> Result<()> {
    let env = hub_env(env)?;

    if hub_is_running(&env).await {
        println!("Hub already running. Skipping.");
    } else {
        start_hub(&env, None).await?;
        println!("Restarted hub");
    }

    let mut client = connect_hub(&env).await?;
    let hosts = client
        .restart_agents(idl::RestartAgentsRequest {})
        .await?
        .into_inner()
        .agent_hosts;

    if hosts.is_empty() {
        println!("All agents already running. Skipping.");
    } else {
        println!("Restarted agents on: {}", hosts.join(", "));
    }
    Ok(())
}

async fn kill_services(env: Env) -> Result<()> {
    let env = hub_env(env)?;

    // Only the hub knows where the agents run.
    if !hub_is_running(&env).await {
        start_hub(&env, None).await?;
    }

    stop_services(&env).await?;
    println!("Stopped hub and agents");
    Ok(())
}

async fn run_hub(env: Env, args: HubArgs) -> Result<()> {
    if args.daemon.daemonize {
        return daemon::daemonize().await;
    }
    if args.daemon.daemon {
        daemon::check_daemon_flag()?;
    }

    if !env.state_dir.exists() {
        return Err(Error::Validation(format!(
            "gpupgrade state dir ({}) does not exist. Did you run gpupgrade initialize?",
            env.state_dir.display()
        )));
    }

    let logger = build_logger(&env.log_dir, "gpupgrade_hub");

    let mut config = hub::load_config(&env)?;
    if let Some(port) = args.port {
        config.hub_port = port;
    }
    let port = config.hub_port;
    let env = env.with_hub_port(port);

    let hub = Hub::new(env, config, Arc::new(ShellRunner), logger.clone())?;
    let handle = hub::start(SocketAddr::from(([0, 0, 0, 0], port)), hub).await?;

    if args.daemon.daemon {
        daemon::detach()?;
    }
    daemon::serve_until_signal(handle, logger).await
}

async fn run_agent(env: Env, args: AgentArgs) -> Result<()> {
    if args.daemon.daemonize {
        return daemon::daemonize().await;
    }
    if args.daemon.daemon {
        daemon::check_daemon_flag()?;
    }

    let env = match args.state_directory {
        Some(state_dir) => Env { state_dir, ..env },
        None => env,
    };
    let logger = build_logger(&env.log_dir, "gpupgrade_agent");

    let handle = crate::agent::start(
        SocketAddr::from(([0, 0, 0, 0], args.port)),
        env,
        Arc::new(ShellRunner),
        Arc::new(LocalDisk),
        logger.clone(),
    )
    .await?;

    if args.daemon.daemon {
        daemon::detach()?;
    }
    daemon::serve_until_signal(handle, logger).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn flags() -> InitializeArgs {
        InitializeArgs {
            source_gphome: Some("/usr/local/gpdb6".into()),
            target_gphome: Some("/usr/local/gpdb7".into()),
            source_master_port: Some(15432),
            ..Default::default()
        }
    }

    fn write_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_nothing_given_prints_help() {
        let args = InitializeArgs {
            verbose: true,
            automatic: true,
            ..Default::default()
        };
        assert!(resolve_initialize(args, 7527).unwrap().is_none());
    }

    #[test]
    fn test_flag_defaults() {
        let params = resolve_initialize(flags(), 7000).unwrap().unwrap();

        assert_eq!(params.source, "the command line");
        assert_eq!(params.mode, Mode::Copy);
        assert_eq!(params.disk_free_ratio, 0.6);
        assert_eq!(params.temp_port_range, DEFAULT_TEMP_PORT_RANGE);
        assert_eq!(params.ports.first(), Some(&50432));
        assert_eq!(params.hub_port, 7000);
        assert_eq!(params.agent_port, DEFAULT_AGENT_PORT);

        let link = InitializeArgs {
            mode: Some("link".into()),
            ..flags()
        };
        assert_eq!(resolve_initialize(link, 7527).unwrap().unwrap().disk_free_ratio, 0.2);
    }

    #[test]
    fn test_missing_required_flags() {
        let args = InitializeArgs {
            source_gphome: Some("/usr/local/gpdb6".into()),
            ..Default::default()
        };
        let err = resolve_initialize(args, 7527).unwrap_err();
        assert_eq!(
            err.to_string(),
            "required flag(s) \"target-gphome\", \"source-master-port\" not set"
        );
    }

    #[test]
    fn test_disk_free_ratio_bounds() {
        let args = InitializeArgs {
            disk_free_ratio: Some(1.5),
            ..flags()
        };
        let err = resolve_initialize(args, 7527).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid argument 1.5 for \"--disk-free-ratio\" flag: value must be between 0.0 and 1.0"
        );
    }

    #[test]
    fn test_file_parameters() {
        let file = write_file(
            "source_gphome = /usr/local/gpdb6
target_gphome = /usr/local/gpdb7
source_master_port = 15432
mode = link
temp_port_range = 6000-6002
use_hba_hostnames = true
",
        );
        let args = InitializeArgs {
            file: Some(file.path().to_path_buf()),
            verbose: true,
            ..Default::default()
        };

        let params = resolve_initialize(args, 7527).unwrap().unwrap();
        assert_eq!(params.source, file.path().display().to_string());
        assert_eq!(params.source_port, 15432);
        assert_eq!(params.mode, Mode::Link);
        assert_eq!(params.ports, vec![6000, 6001, 6002]);
        assert!(params.use_hba_hostnames);

        let request = params.request();
        assert_eq!(request.mode, idl::Mode::Link as i32);
        assert_eq!(request.ports, vec![6000, 6001, 6002]);
        assert_eq!(request.agent_port, i32::from(DEFAULT_AGENT_PORT));
    }

    #[test]
    fn test_file_is_exclusive() {
        let file = write_file("mode = copy\n");
        let args = InitializeArgs {
            file: Some(file.path().to_path_buf()),
            mode: Some("link".into()),
            ..Default::default()
        };
        let err = resolve_initialize(args, 7527).unwrap_err();
        assert_eq!(
            err.to_string(),
            "The file flag cannot be used with any other flag except verbose and automatic."
        );
    }

    #[test]
    fn test_file_errors() {
        let unknown = write_file("source_gphome = /a\nbogus_setting = 1\n");
        let err = resolve_initialize(
            InitializeArgs {
                file: Some(unknown.path().to_path_buf()),
                ..Default::default()
            },
            7527,
        )
        .unwrap_err();
        assert!(err
            .to_string()
            .starts_with("The configuration parameter \"bogus-setting\" was not found in the list of supported parameters: "));

        let bad = write_file("source_master_port = abc\n");
        let err = resolve_initialize(
            InitializeArgs {
                file: Some(bad.path().to_path_buf()),
                ..Default::default()
            },
            7527,
        )
        .unwrap_err();
        assert!(err.to_string().starts_with("set \"source-master-port\" to \"abc\": "));

        let malformed = write_file("source_gphome\n");
        let err = resolve_initialize(
            InitializeArgs {
                file: Some(malformed.path().to_path_buf()),
                ..Default::default()
            },
            7527,
        )
        .unwrap_err();
        assert!(err.to_string().starts_with("in file "));
    }

    #[test]
    fn test_hub_env_reads_recorded_port() {
        let dir = tempfile::tempdir().unwrap();
        let env = Env::with_state_dir(dir.path()).with_hub_port(7527);
        assert_eq!(hub_env(env.clone()).unwrap().hub_port, 7527);

        HubConfig::default()
            .with_hub_port(9123)
            .save(&env.config_path())
            .unwrap();
        assert_eq!(hub_env(env).unwrap().hub_port, 9123);
    }

    #[test]
    fn test_create_state_directory_reports_substep() {
        let dir = tempfile::tempdir().unwrap();
        let env = Env::with_state_dir(dir.path().join("state"));
        let console = crate::step::stream::BufferedStreams::new();

        create_state_directory(&env, &console).unwrap();
        assert!(env.state_dir.is_dir());

        let out = String::from_utf8(console.take_stdout()).unwrap();
        assert_eq!(
            out,
            format!(
                "{}\r{}\n",
                format_status(Substep::CreatingDirectories, Status::Running),
                format_status(Substep::CreatingDirectories, Status::Complete)
            )
        );
    }

    #[tokio::test]
    async fn test_stop_services_without_hub() {
        let dir = tempfile::tempdir().unwrap();
        let port = port_check::free_local_port().unwrap();
        let env = Env::with_state_dir(dir.path()).with_hub_port(port);

        assert!(!hub_is_running(&env).await);
        assert!(stop_services(&env).await.is_err());
    }
}
