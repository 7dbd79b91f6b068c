//! The CNI invocation contract: environment, stdin and stdout.

use crate::commands::Plugin;
use crate::config::NetConf;
use crate::error::{CniError, Result};
use crate::ipam::IpamDelegate;
use crate::kernel::Kernel;
use cni_types::VersionInfo;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;
use tracing::{debug, error};

pub const ENV_COMMAND: &str = "CNI_COMMAND";
pub const ENV_CONTAINER_ID: &str = "CNI_CONTAINERID";
pub const ENV_NETNS: &str = "CNI_NETNS";
pub const ENV_IFNAME: &str = "CNI_IFNAME";
pub const ENV_ARGS: &str = "CNI_ARGS";
pub const ENV_PATH: &str = "CNI_PATH";

/// Maximum interface name length (`IFNAMSIZ - 1`).
const MAX_IFNAME_LEN: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Add,
    Del,
    Check,
    Version,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Command::Add => "ADD",
            Command::Del => "DEL",
            Command::Check => "CHECK",
            Command::Version => "VERSION",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Command {
    type Err = CniError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ADD" => Ok(Command::Add),
            "DEL" => Ok(Command::Del),
            "CHECK" => Ok(Command::Check),
            "VERSION" => Ok(Command::Version),
            other => Err(CniError::invalid_env(format!("unknown CNI_COMMAND: {other}"))),
        }
    }
}

/// Per-call arguments taken from the environment, plus the stdin payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdArgs {
    pub container_id: String,
    /// Namespace path; may be empty for DEL.
    pub netns: String,
    pub ifname: String,
    pub args: String,
    pub path: String,
    pub stdin: Vec<u8>,
}

impl CmdArgs {
    /// Collects arguments for `command` through `getenv`.
    pub fn from_env<F>(command: Command, getenv: F, stdin: Vec<u8>) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| getenv(key).unwrap_or_default();
        let args = CmdArgs {
            container_id: get(ENV_CONTAINER_ID),
            netns: get(ENV_NETNS),
            ifname: get(ENV_IFNAME),
            args: get(ENV_ARGS),
            path: get(ENV_PATH),
            stdin,
        };
        args.validate(command)?;
        Ok(args)
    }

    fn validate(&self, command: Command) -> Result<()> {
        if command == Command::Version {
            return Ok(());
        }

        let mut missing = Vec::new();
        if self.container_id.is_empty() {
            missing.push(ENV_CONTAINER_ID);
        }
        if self.netns.is_empty() && command != Command::Del {
            missing.push(ENV_NETNS);
        }
        if self.ifname.is_empty() {
            missing.push(ENV_IFNAME);
        }
        if self.path.is_empty() {
            missing.push(ENV_PATH);
        }
        if !missing.is_empty() {
            return Err(CniError::invalid_env(format!(
                "required env variables [{}] missing",
                missing.join(",")
            )));
        }

        validate_container_id(&self.container_id)?;
        validate_ifname(&self.ifname)
    }

    /// Environment for a delegated plugin run as `command`.
    pub fn to_env(&self, command: Command) -> Vec<(String, String)> {
        [
            (ENV_COMMAND, command.to_string()),
            (ENV_CONTAINER_ID, self.container_id.clone()),
            (ENV_NETNS, self.netns.clone()),
            (ENV_IFNAME, self.ifname.clone()),
            (ENV_ARGS, self.args.clone()),
            (ENV_PATH, self.path.clone()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }
}

fn validate_container_id(id: &str) -> Result<()> {
    let mut chars = id.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(CniError::invalid_env(format!("invalid characters in containerID {id:?}")))
    }
}

fn validate_ifname(name: &str) -> Result<()> {
    if name.len() > MAX_IFNAME_LEN {
        return Err(CniError::invalid_env(format!(
            "interface name {name:?} is too long, must be at most {MAX_IFNAME_LEN} characters"
        )));
    }
    if name == "." || name == ".." {
        return Err(CniError::invalid_env(format!("interface name {name:?} is not allowed")));
    }
    if name.chars().any(|c| c == '/' || c == ':' || c.is_whitespace()) {
        return Err(CniError::invalid_env(format!(
            "interface name {name:?} contains / or : or whitespace characters"
        )));
    }
    Ok(())
}

/// Best-effort read of `cniVersion` for error reports and `VERSION`.
pub fn sniff_version(stdin: &[u8]) -> Option<String> {
    #[derive(Deserialize)]
    struct Probe {
        #[serde(rename = "cniVersion", default)]
        cni_version: Option<String>,
    }
    serde_json::from_slice::<Probe>(stdin)
        .ok()
        .and_then(|p| p.cni_version)
}

/// Runs one command and returns the document to print, if any.
pub fn execute<K, I>(plugin: &Plugin<K, I>, command: Command, args: &CmdArgs) -> Result<Option<Value>>
where
    K: Kernel,
    I: IpamDelegate,
{
    if command == Command::Version {
        let info = VersionInfo::for_request(sniff_version(&args.stdin).as_deref());
        return serde_json::to_value(info)
            .map(Some)
            .map_err(|e| CniError::decode("version info", e));
    }

    let conf = NetConf::parse(&args.stdin, &args.args)?;
    debug!(%command, container = %args.container_id, netns = %args.netns, ifname = %args.ifname, "Dispatching");

    match command {
        Command::Add => plugin
            .cmd_add(&conf, args)
            .map(|result| Some(result.to_json(conf.cni_version))),
        Command::Del => plugin.cmd_del(&conf, args).map(|()| None),
        Command::Check => plugin.cmd_check(&conf, args).map(|()| None),
        Command::Version => Ok(None),
    }
}

/// Writes the outcome of [`execute`] and returns the process exit code.
pub fn write_outcome<W: Write>(
    out: &mut W,
    outcome: &Result<Option<Value>>,
    stdin: &[u8],
) -> io::Result<i32> {
    match outcome {
        Ok(Some(doc)) => {
            serde_json::to_writer(&mut *out, doc)?;
            writeln!(out)?;
            Ok(0)
        }
        Ok(None) => Ok(0),
        Err(err) => {
            error!(code = err.code(), error = %err, "Command failed");
            let version = sniff_version(stdin).unwrap_or_default();
            serde_json::to_writer(&mut *out, &err.to_report(&version))?;
            writeln!(out)?;
            Ok(1)
        }
    }
}
