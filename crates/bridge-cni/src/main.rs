//! bridge-cni entry point.
//!
//! Runs as a CNI plugin when `CNI_COMMAND` is set; otherwise the
//! subcommands drive the same handlers from flags for manual use.

use anyhow::Context;
use bridge_cni::accelerator::{AcceleratorGuard, NoopAccelerator};
use bridge_cni::config::LogSettings;
use bridge_cni::logging::init_logging;
use bridge_cni::skel::{self, CmdArgs, Command, ENV_COMMAND};
use bridge_cni::CniError;
use clap::{Args, CommandFactory, Parser, Subcommand};
use serde_json::Value;
use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{debug, info};

/// Attach container network namespaces to a host bridge
#[derive(Parser, Debug)]
#[command(name = "bridge-cni")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Manual>,
}

#[derive(Subcommand, Debug)]
enum Manual {
    /// Wire a namespace to the bridge
    Add(CallArgs),
    /// Remove the container interface and release its addresses
    Del(CallArgs),
    /// Verify a previous ADD result against the live state
    Check {
        #[command(flatten)]
        call: CallArgs,

        /// File holding the result of the earlier ADD
        #[arg(long)]
        prev_result: Option<PathBuf>,
    },
    /// Print the supported CNI versions
    Version,
}

#[derive(Args, Debug)]
struct CallArgs {
    /// Network namespace path
    #[arg(long, default_value = "")]
    netns: String,

    /// Container ID
    #[arg(long)]
    container_id: String,

    /// Interface name inside the namespace
    #[arg(long = "interface", default_value = "eth0")]
    ifname: String,

    /// Directories searched for the IPAM plugin
    #[arg(long, default_value = "/opt/cni/bin")]
    cni_path: String,

    /// Extra arguments, `K1=V1;K2=V2`
    #[arg(long, default_value = "")]
    args: String,

    /// Network configuration file; read from stdin when omitted
    config: Option<PathBuf>,
}

impl CallArgs {
    fn env(&self, key: &str) -> Option<String> {
        let value = match key {
            skel::ENV_CONTAINER_ID => &self.container_id,
            skel::ENV_NETNS => &self.netns,
            skel::ENV_IFNAME => &self.ifname,
            skel::ENV_ARGS => &self.args,
            skel::ENV_PATH => &self.cni_path,
            _ => return None,
        };
        Some(value.clone())
    }
}

fn read_stdin() -> io::Result<Vec<u8>> {
    let mut stdin = io::stdin();
    let mut buf = Vec::new();
    if !stdin.is_terminal() {
        stdin.read_to_end(&mut buf)?;
    }
    Ok(buf)
}

fn read_config(path: Option<&Path>) -> anyhow::Result<Vec<u8>> {
    match path {
        Some(path) => std::fs::read(path)
            .with_context(|| format!("failed to read network config {}", path.display())),
        None => read_stdin().context("failed to read network config from stdin"),
    }
}

/// Inserts the earlier ADD result as `prevResult`.
fn splice_prev_result(config: &[u8], prev_result: &Path) -> anyhow::Result<Vec<u8>> {
    let prev: Value = serde_json::from_slice(
        &std::fs::read(prev_result)
            .with_context(|| format!("failed to read {}", prev_result.display()))?,
    )
    .context("prevResult is not valid JSON")?;

    let mut conf: Value = serde_json::from_slice(config).context("network config is not valid JSON")?;
    let object = conf
        .as_object_mut()
        .context("network config is not a JSON object")?;
    object.insert("prevResult".to_string(), prev);
    Ok(serde_json::to_vec(&conf)?)
}

/// The command, its payload and its arguments.
type Invocation = (Command, Vec<u8>, Result<CmdArgs, CniError>);

fn from_flags(manual: Manual) -> anyhow::Result<Invocation> {
    let (command, call, prev_result) = match manual {
        Manual::Add(call) => (Command::Add, call, None),
        Manual::Del(call) => (Command::Del, call, None),
        Manual::Check { call, prev_result } => (Command::Check, call, prev_result),
        Manual::Version => return Ok((Command::Version, Vec::new(), Ok(CmdArgs::default()))),
    };

    let mut stdin = read_config(call.config.as_deref())?;
    if let Some(prev) = prev_result {
        stdin = splice_prev_result(&stdin, &prev)?;
    }
    let args = CmdArgs::from_env(command, |key| call.env(key), stdin.clone());
    Ok((command, stdin, args))
}

fn from_env(command: &str) -> anyhow::Result<Invocation> {
    let stdin = read_stdin().context("failed to read stdin")?;
    let args = command
        .parse::<Command>()
        .and_then(|cmd| CmdArgs::from_env(cmd, |key| std::env::var(key).ok(), stdin.clone()).map(|a| (cmd, a)));
    Ok(match args {
        Ok((command, args)) => (command, stdin, Ok(args)),
        Err(e) => (Command::Version, stdin, Err(e)),
    })
}

#[cfg(target_os = "linux")]
fn dispatch(command: Command, args: &CmdArgs) -> bridge_cni::Result<Option<Value>> {
    use bridge_cni::ipam::ExecIpam;
    use bridge_cni::kernel::LinuxKernel;
    use bridge_cni::Plugin;

    let plugin = Plugin::new(LinuxKernel::new(), ExecIpam::new());
    skel::execute(&plugin, command, args)
}

#[cfg(not(target_os = "linux"))]
fn dispatch(command: Command, _args: &CmdArgs) -> bridge_cni::Result<Option<Value>> {
    Err(CniError::config(format!(
        "{command} is only supported on Linux"
    )))
}

fn run() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let (command, stdin, args) = match cli.command {
        Some(manual) => from_flags(manual)?,
        None => match std::env::var(ENV_COMMAND) {
            Ok(command) => from_env(&command)?,
            Err(_) => {
                Cli::command().print_help()?;
                return Ok(ExitCode::from(2));
            }
        },
    };

    if let Err(e) = init_logging(&LogSettings::sniff(&stdin)) {
        eprintln!("bridge-cni: {e:#}");
    }
    info!(%command, "bridge-cni starting");

    let outcome = {
        let _accel = AcceleratorGuard::start(NoopAccelerator);
        args.and_then(|args| dispatch(command, &args))
    };

    let mut stdout = io::stdout().lock();
    let code = skel::write_outcome(&mut stdout, &outcome, &stdin)
        .context("failed to write result")?;
    debug!(code, "bridge-cni finished");
    Ok(ExitCode::from(code as u8))
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("bridge-cni: {e:#}");
            ExitCode::FAILURE
        }
    }
}
