//! Network configuration loading.
//!
//! The configuration arrives as JSON on stdin; the MAC override arrives
//! separately through `CNI_ARGS`. Both are folded into one immutable
//! [`NetConf`].

use crate::error::{CniError, Result};
use cni_types::{MacAddress, SpecVersion, SUPPORTED_VERSIONS};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::PathBuf;
use tracing::debug;

/// Bridge used when the configuration names none.
pub const DEFAULT_BRIDGE: &str = "cni0";

/// Version assumed when `cniVersion` is absent.
const IMPLICIT_VERSION: &str = "0.1.0";

/// Delegated IPAM descriptor. Everything besides `type` is kept verbatim.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IpamConf {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// Plugin logging settings carried in the network configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogSettings {
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl LogSettings {
    /// Reads just the logging keys, ignoring everything else and any error.
    pub fn sniff(stdin: &[u8]) -> Self {
        serde_json::from_slice(stdin).unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawNetConf {
    #[serde(default)]
    cni_version: Option<String>,
    #[serde(default)]
    name: String,
    #[serde(rename = "type", default)]
    plugin_type: String,
    #[serde(default, alias = "bridge")]
    default_bridge: Option<String>,
    #[serde(default)]
    mtu: u32,
    #[serde(rename = "enabledad", default)]
    enable_dad: bool,
    #[serde(default)]
    ipam: Option<IpamConf>,
    #[serde(default)]
    prev_result: Option<Value>,
    #[serde(flatten)]
    log: LogSettings,
}

/// Parsed network configuration for one invocation.
#[derive(Debug, Clone)]
pub struct NetConf {
    pub cni_version: SpecVersion,
    pub name: String,
    pub plugin_type: String,
    pub bridge: String,
    /// Zero keeps the kernel default.
    pub mtu: u32,
    pub enable_dad: bool,
    /// From `CNI_ARGS`, never from the JSON body.
    pub mac: Option<MacAddress>,
    pub ipam: Option<IpamConf>,
    pub prev_result: Option<Value>,
    pub log: LogSettings,
    /// The exact stdin payload, forwarded to the IPAM delegate.
    pub raw: Vec<u8>,
}

impl NetConf {
    /// Parses the stdin payload and the `CNI_ARGS` string.
    pub fn parse(stdin: &[u8], cni_args: &str) -> Result<Self> {
        let raw: RawNetConf = serde_json::from_slice(stdin)
            .map_err(|e| CniError::config(format!("failed to load netconf: {e}")))?;

        let version_str = raw
            .cni_version
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| IMPLICIT_VERSION.to_string());
        let cni_version = negotiate(&version_str)?;

        let args = CniArgs::parse(cni_args)?;
        let bridge = raw
            .default_bridge
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| DEFAULT_BRIDGE.to_string());

        debug!(
            network = %raw.name,
            bridge = %bridge,
            mtu = raw.mtu,
            version = %cni_version,
            "Loaded network config"
        );

        Ok(Self {
            cni_version,
            name: raw.name,
            plugin_type: raw.plugin_type,
            bridge,
            mtu: raw.mtu,
            enable_dad: raw.enable_dad,
            mac: args.mac,
            ipam: raw.ipam,
            prev_result: raw.prev_result,
            log: raw.log,
            raw: stdin.to_vec(),
        })
    }

    /// The IPAM plugin to delegate to, if address management is configured.
    pub fn ipam_type(&self) -> Option<&str> {
        self.ipam
            .as_ref()
            .map(|ipam| ipam.kind.as_str())
            .filter(|kind| !kind.is_empty())
    }

    /// Layer-3 mode is on iff an IPAM type is configured.
    pub fn is_layer3(&self) -> bool {
        self.ipam_type().is_some()
    }
}

/// Parses and checks a `cniVersion` against the supported set.
pub fn negotiate(version: &str) -> Result<SpecVersion> {
    let incompatible = || {
        CniError::IncompatibleVersion(format!(
            "incompatible CNI versions; config is {version:?}, plugin supports {SUPPORTED_VERSIONS:?}"
        ))
    };
    let parsed: SpecVersion = version.parse().map_err(|_| incompatible())?;
    if !parsed.is_supported() {
        return Err(incompatible());
    }
    Ok(parsed)
}

/// Keys recognised in `CNI_ARGS`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CniArgs {
    pub ignore_unknown: bool,
    pub mac: Option<MacAddress>,
}

impl CniArgs {
    /// Parses `K1=V1;K2=V2`.
    ///
    /// Unknown keys are rejected unless `IgnoreUnknown` is true.
    pub fn parse(args: &str) -> Result<Self> {
        let mut parsed = CniArgs::default();
        if args.is_empty() {
            return Ok(parsed);
        }

        let mut pairs = Vec::new();
        for pair in args.split(';') {
            let (key, value) = pair
                .split_once('=')
                .filter(|(_, v)| !v.contains('='))
                .ok_or_else(|| CniError::config(format!("ARGS: invalid pair {pair:?}")))?;
            pairs.push((key, value));
        }

        if let Some((_, value)) = pairs.iter().find(|(k, _)| *k == "IgnoreUnknown") {
            parsed.ignore_unknown = parse_bool(value).ok_or_else(|| {
                CniError::config(format!("ARGS: error parsing value of pair \"IgnoreUnknown={value}\""))
            })?;
        }

        let mut unknown = Vec::new();
        for (key, value) in pairs {
            match key {
                "IgnoreUnknown" => {}
                "MAC" => {
                    let mac = value.parse::<MacAddress>().map_err(|e| {
                        CniError::config(format!("ARGS: error parsing value of pair \"MAC={value}\": {e}"))
                    })?;
                    parsed.mac = Some(mac);
                }
                other => unknown.push(other.to_string()),
            }
        }

        if !unknown.is_empty() && !parsed.ignore_unknown {
            return Err(CniError::config(format!("ARGS: unknown args {unknown:?}")));
        }

        Ok(parsed)
    }
}

/// Boolean spellings accepted for `IgnoreUnknown`.
fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const L2_CONF: &str = r#"{"cniVersion": "1.0.0", "name": "podnet", "type": "bridge-cni", "mtu": 1500}"#;

    #[test]
    fn test_defaults() {
        let conf = NetConf::parse(L2_CONF.as_bytes(), "").unwrap();
        assert_eq!(conf.bridge, DEFAULT_BRIDGE);
        assert_eq!(conf.mtu, 1500);
        assert!(!conf.enable_dad);
        assert!(!conf.is_layer3());
        assert_eq!(conf.mac, None);
        assert_eq!(conf.cni_version, SpecVersion::new(1, 0, 0));
        assert_eq!(conf.raw, L2_CONF.as_bytes());
    }

    #[test]
    fn test_full_config() {
        let data = r#"{
            "cniVersion": "0.4.0",
            "name": "podnet",
            "type": "bridge-cni",
            "defaultBridge": "br-pods",
            "enabledad": true,
            "logLevel": "debug",
            "ipam": {"type": "host-local", "subnet": "10.244.0.0/24"}
        }"#;
        let conf = NetConf::parse(data.as_bytes(), "IgnoreUnknown=1;MAC=0a:58:0a:f4:00:07").unwrap();
        assert_eq!(conf.bridge, "br-pods");
        assert!(conf.enable_dad);
        assert_eq!(conf.ipam_type(), Some("host-local"));
        assert_eq!(
            conf.ipam.as_ref().unwrap().other.get("subnet"),
            Some(&Value::from("10.244.0.0/24"))
        );
        assert_eq!(conf.mac, Some("0a:58:0a:f4:00:07".parse().unwrap()));
        assert_eq!(conf.log.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_bridge_alias() {
        let data = r#"{"cniVersion": "1.0.0", "bridge": "br0"}"#;
        assert_eq!(NetConf::parse(data.as_bytes(), "").unwrap().bridge, "br0");
    }

    #[test]
    fn test_empty_ipam_type_is_layer2() {
        let data = r#"{"cniVersion": "1.0.0", "ipam": {}}"#;
        assert!(!NetConf::parse(data.as_bytes(), "").unwrap().is_layer3());
    }

    #[test]
    fn test_mac_only_from_args() {
        let data = r#"{"cniVersion": "1.0.0", "mac": "0a:58:0a:f4:00:07"}"#;
        assert_eq!(NetConf::parse(data.as_bytes(), "").unwrap().mac, None);
    }

    #[test]
    fn test_malformed_json() {
        let err = NetConf::parse(b"{not json", "").unwrap_err();
        assert_eq!(err.code(), 7);
        assert!(err.to_string().starts_with("failed to load netconf"));
    }

    #[test]
    fn test_version_negotiation() {
        for ok in ["0.3.0", "0.3.1", "0.4.0", "1.0.0", "1.1.0"] {
            assert!(negotiate(ok).is_ok(), "{ok}");
        }
        for bad in ["0.2.0", "9.9.9", "banana"] {
            assert!(matches!(negotiate(bad), Err(CniError::IncompatibleVersion(_))), "{bad}");
        }
        let err = NetConf::parse(br#"{"name": "x"}"#, "").unwrap_err();
        assert!(err.to_string().contains("\"0.1.0\""));
    }

    #[test]
    fn test_args_unknown_rejected() {
        let err = CniArgs::parse("K8S_POD_NAME=web-0").unwrap_err();
        assert_eq!(err.to_string(), "ARGS: unknown args [\"K8S_POD_NAME\"]");
    }

    #[test]
    fn test_args_ignore_unknown() {
        let args = CniArgs::parse("IgnoreUnknown=true;K8S_POD_NAME=web-0;K8S_POD_NAMESPACE=default")
            .unwrap();
        assert!(args.ignore_unknown);
        assert_eq!(args.mac, None);

        let err = CniArgs::parse("IgnoreUnknown=false;FOO=bar").unwrap_err();
        assert!(err.to_string().contains("FOO"));
    }

    #[test]
    fn test_args_invalid_pair() {
        assert!(CniArgs::parse("MAC").is_err());
        assert!(CniArgs::parse("MAC=0a:58:0a:f4:00:07;").is_err());
        assert!(CniArgs::parse("A=b=c").is_err());
        assert!(CniArgs::parse("IgnoreUnknown=maybe").is_err());
    }

    #[test]
    fn test_args_bad_mac() {
        let err = CniArgs::parse("MAC=zz:zz").unwrap_err();
        assert_eq!(err.code(), 7);
    }

    #[test]
    fn test_log_settings_sniff() {
        let settings = LogSettings::sniff(br#"{"logFile": "/var/log/bridge-cni.log"}"#);
        assert_eq!(settings.log_file, Some(PathBuf::from("/var/log/bridge-cni.log")));
        assert_eq!(LogSettings::sniff(b"garbage"), LogSettings::default());
    }
}
