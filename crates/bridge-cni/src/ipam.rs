//! Delegation of address management to an external IPAM plugin.
//!
//! The delegate is an executable named by `ipam.type`, looked up in
//! `CNI_PATH`. It receives the exact configuration payload this plugin was
//! given and the same `CNI_*` environment, with `CNI_COMMAND` overridden.

use crate::config::NetConf;
use crate::error::{CniError, Result};
use crate::skel::{CmdArgs, Command};
use cni_types::{CniResult, ErrorReport};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tracing::{debug, instrument, warn};

/// Address management operations used by the command handlers.
pub trait IpamDelegate {
    /// Allocates addresses and returns the delegate's result document as
    /// printed. Decode it with [`decode_result`] once the allocation is owned.
    fn add(&self, conf: &NetConf, args: &CmdArgs) -> Result<Vec<u8>>;

    /// Releases whatever `add` allocated for this container.
    fn del(&self, conf: &NetConf, args: &CmdArgs) -> Result<()>;

    /// Asks the delegate to verify its own state.
    fn check(&self, conf: &NetConf, args: &CmdArgs) -> Result<()>;
}

/// Output of a finished plugin process.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    /// Exit code, `None` when killed by a signal.
    pub status: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Runs a plugin binary. Split out so tests can script delegate replies.
#[cfg_attr(test, mockall::automock)]
pub trait PluginExec {
    fn exec(&self, plugin: &Path, env: &[(String, String)], stdin: &[u8]) -> io::Result<ExecOutput>;
}

/// [`PluginExec`] that spawns a real process.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemExec;

impl PluginExec for SystemExec {
    fn exec(&self, plugin: &Path, env: &[(String, String)], stdin: &[u8]) -> io::Result<ExecOutput> {
        let mut child = std::process::Command::new(plugin)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(stdin)?;
        }

        let output = child.wait_with_output()?;
        Ok(ExecOutput {
            status: output.status.code(),
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Finds `plugin` in the colon-separated `cni_path`.
pub fn find_plugin(plugin: &str, cni_path: &str) -> Result<PathBuf> {
    if plugin.contains(std::path::MAIN_SEPARATOR) {
        return Err(CniError::ipam(format!(
            "invalid plugin name {plugin:?}: must not contain a path separator"
        )));
    }

    cni_path
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(plugin))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| {
            CniError::ipam(format!("failed to find plugin {plugin:?} in path [{cni_path}]"))
        })
}

/// [`IpamDelegate`] that executes the configured plugin binary.
#[derive(Debug, Default, Clone)]
pub struct ExecIpam<E = SystemExec> {
    exec: E,
}

impl ExecIpam<SystemExec> {
    pub fn new() -> Self {
        Self { exec: SystemExec }
    }
}

impl<E: PluginExec> ExecIpam<E> {
    pub fn with_exec(exec: E) -> Self {
        Self { exec }
    }

    #[instrument(skip(self, conf, args), fields(container = %args.container_id))]
    fn invoke(&self, command: Command, conf: &NetConf, args: &CmdArgs) -> Result<Vec<u8>> {
        let plugin = conf
            .ipam_type()
            .ok_or_else(|| CniError::config("no IPAM type configured"))?;
        let path = find_plugin(plugin, &args.path)?;
        let env = args.to_env(command);

        debug!(plugin, path = %path.display(), "Executing IPAM plugin");
        let output = self
            .exec
            .exec(&path, &env, &conf.raw)
            .map_err(|e| CniError::ipam(format!("failed to execute {plugin:?}: {e}")))?;

        if output.success() {
            return Ok(output.stdout);
        }

        warn!(
            plugin,
            status = ?output.status,
            stderr = %output.stderr,
            "IPAM plugin failed"
        );
        Err(delegate_error(plugin, &output))
    }
}

fn delegate_error(plugin: &str, output: &ExecOutput) -> CniError {
    if output.stdout.iter().all(u8::is_ascii_whitespace) {
        return CniError::ipam(format!(
            "netplugin failed with no error message: {}",
            output.stderr
        ));
    }
    match serde_json::from_slice::<ErrorReport>(&output.stdout) {
        Ok(report) => CniError::Delegate {
            plugin: plugin.to_string(),
            report,
        },
        Err(e) => CniError::ipam(format!(
            "netplugin failed but error parsing its diagnostic message {:?}: {e}",
            String::from_utf8_lossy(&output.stdout)
        )),
    }
}

/// Normalises a delegate ADD result to the current schema.
pub fn decode_result(raw: &[u8]) -> Result<CniResult> {
    CniResult::from_slice(raw)
        .map_err(|e| CniError::ipam(format!("failed to decode IPAM result: {e}")))
}

impl<E: PluginExec> IpamDelegate for ExecIpam<E> {
    fn add(&self, conf: &NetConf, args: &CmdArgs) -> Result<Vec<u8>> {
        self.invoke(Command::Add, conf, args)
    }

    fn del(&self, conf: &NetConf, args: &CmdArgs) -> Result<()> {
        self.invoke(Command::Del, conf, args).map(drop)
    }

    fn check(&self, conf: &NetConf, args: &CmdArgs) -> Result<()> {
        self.invoke(Command::Check, conf, args).map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;

    const CONF: &str = r#"{"cniVersion": "1.0.0", "name": "podnet", "ipam": {"type": "host-local"}}"#;

    fn fixture() -> (tempfile::TempDir, NetConf, CmdArgs) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("host-local"), b"#!/bin/sh\n").unwrap();
        let conf = NetConf::parse(CONF.as_bytes(), "").unwrap();
        let args = CmdArgs {
            container_id: "c0ffee".into(),
            netns: "/var/run/netns/ns1".into(),
            ifname: "eth0".into(),
            args: String::new(),
            path: format!("/nonexistent:{}", dir.path().display()),
            stdin: CONF.as_bytes().to_vec(),
        };
        (dir, conf, args)
    }

    fn output(status: i32, stdout: &str) -> ExecOutput {
        ExecOutput {
            status: Some(status),
            stdout: stdout.as_bytes().to_vec(),
            stderr: String::new(),
        }
    }

    #[test]
    fn test_find_plugin() {
        let (dir, _, args) = fixture();
        assert_eq!(
            find_plugin("host-local", &args.path).unwrap(),
            dir.path().join("host-local")
        );
        assert!(find_plugin("dhcp", &args.path).is_err());
        assert!(find_plugin("../host-local", &args.path).is_err());
    }

    #[test]
    fn test_add_forwards_payload_and_env() {
        let (_dir, conf, args) = fixture();
        let mut exec = MockPluginExec::new();
        exec.expect_exec()
            .withf(|path, env, stdin| {
                path.ends_with("host-local")
                    && env.contains(&("CNI_COMMAND".to_string(), "ADD".to_string()))
                    && env.contains(&("CNI_IFNAME".to_string(), "eth0".to_string()))
                    && stdin == CONF.as_bytes()
            })
            .times(1)
            .returning(|_, _, _| {
                Ok(output(
                    0,
                    r#"{"cniVersion": "1.0.0", "ips": [{"address": "10.244.0.5/24", "gateway": "10.244.0.1"}]}"#,
                ))
            });

        let raw = ExecIpam::with_exec(exec).add(&conf, &args).unwrap();
        let result = decode_result(&raw).unwrap();
        assert_eq!(result.ips.len(), 1);
        assert_eq!(result.ips[0].address.to_string(), "10.244.0.5/24");
    }

    #[test]
    fn test_add_accepts_legacy_result() {
        let (_dir, conf, args) = fixture();
        let mut exec = MockPluginExec::new();
        exec.expect_exec().returning(|_, _, _| {
            Ok(output(0, r#"{"cniVersion": "0.2.0", "ip4": {"ip": "10.1.0.9/16"}}"#))
        });

        let raw = ExecIpam::with_exec(exec).add(&conf, &args).unwrap();
        let result = decode_result(&raw).unwrap();
        assert_eq!(result.ips[0].address.to_string(), "10.1.0.9/16");
    }

    #[test]
    fn test_add_returns_undecodable_result_unchanged() {
        let (_dir, conf, args) = fixture();
        let reply = r#"{"interfaces": [{"name": "x"}], "ips": [{"address": "10.244.0.5/24", "interface": 3}]}"#;
        let mut exec = MockPluginExec::new();
        exec.expect_exec()
            .times(1)
            .returning(move |_, _, _| Ok(output(0, reply)));

        let raw = ExecIpam::with_exec(exec).add(&conf, &args).unwrap();
        assert_eq!(raw, reply.as_bytes());

        let err = decode_result(&raw).unwrap_err();
        assert_eq!(err.code(), 101);
        assert!(err.to_string().starts_with("failed to decode IPAM result"), "{err}");
    }

    #[test]
    fn test_delegate_error_passes_through() {
        let (_dir, conf, args) = fixture();
        let mut exec = MockPluginExec::new();
        exec.expect_exec().returning(|_, _, _| {
            Ok(output(1, r#"{"code": 11, "msg": "no addresses left", "details": "range 10.244.0.0/24"}"#))
        });

        let err = ExecIpam::with_exec(exec).add(&conf, &args).unwrap_err();
        assert_eq!(err.code(), 11);
        assert_eq!(err.to_report("1.0.0").msg, "no addresses left");
    }

    #[test]
    fn test_garbled_failure_is_ipam_error() {
        let (_dir, conf, args) = fixture();
        let mut exec = MockPluginExec::new();
        exec.expect_exec().returning(|_, _, _| Ok(output(1, "segfault")));

        let err = ExecIpam::with_exec(exec).del(&conf, &args).unwrap_err();
        assert_eq!(err.code(), 101);
        assert!(err.to_string().contains("error parsing its diagnostic message"));
    }

    #[test]
    fn test_silent_failure() {
        let (_dir, conf, args) = fixture();
        let mut exec = MockPluginExec::new();
        exec.expect_exec().returning(|_, _, _| {
            Ok(ExecOutput {
                status: Some(2),
                stdout: Vec::new(),
                stderr: "permission denied".into(),
            })
        });

        let err = ExecIpam::with_exec(exec).check(&conf, &args).unwrap_err();
        assert_eq!(
            err.to_string(),
            "netplugin failed with no error message: permission denied"
        );
    }

    #[test]
    fn test_del_ignores_stdout() {
        let (_dir, conf, args) = fixture();
        let mut exec = MockPluginExec::new();
        exec.expect_exec()
            .withf(|_, env, _| env.contains(&("CNI_COMMAND".to_string(), "DEL".to_string())))
            .returning(|_, _, _| Ok(output(0, "")));

        assert!(ExecIpam::with_exec(exec).del(&conf, &args).is_ok());
    }
}
