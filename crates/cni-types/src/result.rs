//! The CNI success document.
//!
//! A [`CniResult`] is version-neutral. It is decoded from any shape a
//! delegate or runtime may hand us (the legacy `ip4`/`ip6` layout of 0.1/0.2
//! or the `ips[]` layout of 0.3 onwards) and encoded for whichever version
//! the configuration asked for.

use crate::{MacAddress, ParseError, SpecVersion};
use ipnet::IpNet;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::net::IpAddr;

/// An interface created or touched by the plugin.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "empty_mac_as_none"
    )]
    pub mac: Option<MacAddress>,
    /// Namespace path for container interfaces; absent for host interfaces.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "empty_str_as_none"
    )]
    pub sandbox: Option<String>,
}

impl Interface {
    pub fn host(name: impl Into<String>, mac: Option<MacAddress>) -> Self {
        Self {
            name: name.into(),
            mac,
            sandbox: None,
        }
    }

    pub fn container(
        name: impl Into<String>,
        mac: Option<MacAddress>,
        netns: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            mac,
            sandbox: Some(netns.into()),
        }
    }

    pub fn sandbox(&self) -> &str {
        self.sandbox.as_deref().unwrap_or_default()
    }
}

/// An address assignment. `interface` indexes [`CniResult::interfaces`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpConfig {
    pub address: IpNet,
    pub gateway: Option<IpAddr>,
    pub interface: Option<usize>,
}

#[derive(Serialize, Deserialize)]
struct IpConfigWire {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    address: IpNet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    gateway: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    interface: Option<usize>,
}

impl IpConfig {
    fn to_wire(&self, version: SpecVersion) -> IpConfigWire {
        let family = match self.address {
            IpNet::V4(_) => "4",
            IpNet::V6(_) => "6",
        };
        IpConfigWire {
            version: version.tags_ip_version().then(|| family.to_string()),
            address: self.address,
            gateway: self.gateway,
            interface: self.interface,
        }
    }
}

impl IpConfigWire {
    fn into_config(self) -> IpConfig {
        IpConfig {
            address: self.address,
            gateway: self.gateway,
            interface: self.interface,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub dst: IpNet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Dns {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl Dns {
    pub fn is_empty(&self) -> bool {
        self.nameservers.is_empty()
            && self.domain.is_none()
            && self.search.is_empty()
            && self.options.is_empty()
    }
}

/// Result of a successful ADD, or the payload of an IPAM delegate.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CniResult {
    pub interfaces: Vec<Interface>,
    pub ips: Vec<IpConfig>,
    pub routes: Vec<Route>,
    pub dns: Dns,
}

#[derive(Serialize)]
struct CurrentOut<'a> {
    #[serde(rename = "cniVersion")]
    cni_version: String,
    #[serde(skip_serializing_if = "<[Interface]>::is_empty")]
    interfaces: &'a [Interface],
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ips: Vec<IpConfigWire>,
    #[serde(skip_serializing_if = "<[Route]>::is_empty")]
    routes: &'a [Route],
    #[serde(skip_serializing_if = "Dns::is_empty")]
    dns: &'a Dns,
}

#[derive(Deserialize)]
struct CurrentIn {
    #[serde(default)]
    interfaces: Vec<Interface>,
    #[serde(default)]
    ips: Vec<IpConfigWire>,
    #[serde(default)]
    routes: Vec<Route>,
    #[serde(default)]
    dns: Dns,
}

#[derive(Deserialize)]
struct LegacyIn {
    #[serde(default)]
    ip4: Option<LegacyIp>,
    #[serde(default)]
    ip6: Option<LegacyIp>,
    #[serde(default)]
    dns: Dns,
}

#[derive(Deserialize)]
struct LegacyIp {
    ip: IpNet,
    #[serde(default)]
    gateway: Option<IpAddr>,
    #[serde(default)]
    routes: Vec<Route>,
}

impl CniResult {
    /// Encodes the result for `version`, stamping `cniVersion`.
    pub fn to_json(&self, version: SpecVersion) -> Value {
        let out = CurrentOut {
            cni_version: version.to_string(),
            interfaces: &self.interfaces,
            ips: self.ips.iter().map(|ip| ip.to_wire(version)).collect(),
            routes: &self.routes,
            dns: &self.dns,
        };
        // Plain structs with string keys always serialize.
        serde_json::to_value(out).unwrap_or(Value::Null)
    }

    /// Decodes a result in any supported layout.
    pub fn from_json(value: &Value) -> Result<Self, ParseError> {
        let obj = value
            .as_object()
            .ok_or_else(|| ParseError::InvalidResult("result is not a JSON object".into()))?;

        if obj.contains_key("ip4") || obj.contains_key("ip6") {
            let legacy = LegacyIn::deserialize(value)
                .map_err(|e| ParseError::InvalidResult(e.to_string()))?;
            return Ok(legacy.into_result());
        }

        let current =
            CurrentIn::deserialize(value).map_err(|e| ParseError::InvalidResult(e.to_string()))?;
        let result = CniResult {
            interfaces: current.interfaces,
            ips: current.ips.into_iter().map(IpConfigWire::into_config).collect(),
            routes: current.routes,
            dns: current.dns,
        };
        result.check_interface_indices()?;
        Ok(result)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, ParseError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| ParseError::InvalidResult(e.to_string()))?;
        Self::from_json(&value)
    }

    /// Default gateway for `family_of`, taken from the first matching address.
    pub fn gateway_for(&self, family_of: &IpNet) -> Option<IpAddr> {
        self.ips
            .iter()
            .filter(|ip| ip.address.addr().is_ipv4() == family_of.addr().is_ipv4())
            .find_map(|ip| ip.gateway)
    }

    fn check_interface_indices(&self) -> Result<(), ParseError> {
        if self.interfaces.is_empty() {
            return Ok(());
        }
        for ip in &self.ips {
            if let Some(idx) = ip.interface {
                if idx >= self.interfaces.len() {
                    return Err(ParseError::InvalidResult(format!(
                        "address {} references interface {} of {}",
                        ip.address,
                        idx,
                        self.interfaces.len()
                    )));
                }
            }
        }
        Ok(())
    }
}

impl LegacyIn {
    fn into_result(self) -> CniResult {
        let mut result = CniResult {
            dns: self.dns,
            ..Default::default()
        };
        for ip in [self.ip4, self.ip6].into_iter().flatten() {
            result.ips.push(IpConfig {
                address: ip.ip,
                gateway: ip.gateway,
                interface: None,
            });
            result.routes.extend(ip.routes);
        }
        result
    }
}

fn empty_str_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.filter(|s| !s.is_empty()))
}

fn empty_mac_as_none<'de, D>(deserializer: D) -> Result<Option<MacAddress>, D::Error>
where
    D: Deserializer<'de>,
{
    match empty_str_as_none(deserializer)? {
        Some(s) => s.parse().map(Some).map_err(D::Error::custom),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn sample() -> CniResult {
        CniResult {
            interfaces: vec![
                Interface::host("cni0", Some(MacAddress::new([0x0a, 0x58, 0, 0, 0, 1]))),
                Interface::host("veth0a1b2c3d", None),
                Interface::container("eth0", None, "/var/run/netns/ns1"),
            ],
            ips: vec![IpConfig {
                address: "10.244.0.5/24".parse().unwrap(),
                gateway: Some("10.244.0.1".parse().unwrap()),
                interface: Some(2),
            }],
            routes: vec![Route {
                dst: "0.0.0.0/0".parse().unwrap(),
                gw: None,
            }],
            dns: Dns::default(),
        }
    }

    #[test]
    fn test_encode_1_0_has_no_ip_version() {
        let json = sample().to_json(SpecVersion::new(1, 0, 0));
        assert_eq!(json["cniVersion"], "1.0.0");
        assert_eq!(
            json["ips"][0],
            json!({"address": "10.244.0.5/24", "gateway": "10.244.0.1", "interface": 2})
        );
        assert!(json.get("dns").is_none());
        assert_eq!(json["interfaces"][1], json!({"name": "veth0a1b2c3d"}));
        assert_eq!(json["interfaces"][2]["sandbox"], "/var/run/netns/ns1");
    }

    #[test]
    fn test_encode_0_4_tags_ip_version() {
        let json = sample().to_json(SpecVersion::new(0, 4, 0));
        assert_eq!(json["ips"][0]["version"], "4");
    }

    #[test]
    fn test_decode_current_layout() {
        let doc = json!({
            "cniVersion": "0.4.0",
            "interfaces": [
                {"name": "cni0", "mac": "0a:58:00:00:00:01"},
                {"name": "veth0a1b2c3d", "mac": ""},
                {"name": "eth0", "sandbox": "/var/run/netns/ns1"}
            ],
            "ips": [{"version": "4", "address": "10.244.0.5/24", "gateway": "10.244.0.1", "interface": 2}],
            "routes": [{"dst": "0.0.0.0/0"}]
        });
        assert_eq!(CniResult::from_json(&doc).unwrap(), sample());
    }

    #[test]
    fn test_decode_legacy_layout() {
        let doc = json!({
            "cniVersion": "0.2.0",
            "ip4": {
                "ip": "10.1.0.7/16",
                "gateway": "10.1.0.1",
                "routes": [{"dst": "0.0.0.0/0"}]
            },
            "ip6": {"ip": "fd00::7/64"},
            "dns": {"nameservers": ["10.1.0.1"]}
        });
        let result = CniResult::from_json(&doc).unwrap();
        assert_eq!(result.ips.len(), 2);
        assert_eq!(result.ips[0].address, "10.1.0.7/16".parse::<IpNet>().unwrap());
        assert_eq!(result.ips[0].interface, None);
        assert_eq!(result.ips[1].gateway, None);
        assert_eq!(result.routes.len(), 1);
        assert_eq!(result.dns.nameservers, vec!["10.1.0.1".to_string()]);
        assert!(result.interfaces.is_empty());
    }

    #[test]
    fn test_decode_ipam_result_without_interfaces() {
        let doc = json!({
            "cniVersion": "1.0.0",
            "ips": [{"address": "10.1.0.7/16", "gateway": "10.1.0.1"}]
        });
        let result = CniResult::from_json(&doc).unwrap();
        assert_eq!(result.ips.len(), 1);
        assert_eq!(
            result.gateway_for(&"0.0.0.0/0".parse().unwrap()),
            Some("10.1.0.1".parse().unwrap())
        );
        assert_eq!(result.gateway_for(&"::/0".parse().unwrap()), None);
    }

    #[test]
    fn test_decode_rejects_dangling_interface_index() {
        let doc = json!({
            "interfaces": [{"name": "eth0"}],
            "ips": [{"address": "10.1.0.7/16", "interface": 3}]
        });
        assert!(CniResult::from_json(&doc).is_err());
    }

    #[test]
    fn test_decode_rejects_bad_mac() {
        let doc = json!({"interfaces": [{"name": "eth0", "mac": "nope"}]});
        assert!(CniResult::from_json(&doc).is_err());
        assert!(CniResult::from_json(&json!([])).is_err());
    }
}
