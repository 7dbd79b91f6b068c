//! CNI plugin that attaches container network namespaces to a host bridge.
//!
//! For each container the plugin creates a veth pair, leaves one end in the
//! container namespace under the requested interface name, and enslaves the
//! other end to a pre-existing bridge. With an IPAM delegate configured it
//! also assigns addresses and routes inside the container.
//!
//! # Architecture
//!
//! ```text
//!   stdin/env ──▶ skel ──▶ Plugin::cmd_{add,del,check}
//!                              │
//!          ┌───────────────────┼────────────────────┐
//!          ▼                   ▼                    ▼
//!       bridge/veth          ipam              validate
//!          │                (delegate)             │
//!          ▼                                       ▼
//!       Kernel ◀────────── iface/readiness ──── Kernel
//!      (netlink, sysctl, netns)
//! ```
//!
//! All kernel access goes through the [`kernel::Kernel`] trait so the
//! command handlers can run against an in-memory kernel in tests.

pub mod accelerator;
pub mod bridge;
pub mod commands;
pub mod config;
pub mod error;
pub mod iface;
pub mod ipam;
pub mod kernel;
pub mod logging;
#[cfg(target_os = "linux")]
mod netlink;
pub mod netns;
pub mod readiness;
pub mod skel;
#[cfg(target_os = "linux")]
mod sysctl;
pub mod validate;
pub mod veth;

pub use commands::Plugin;
pub use config::NetConf;
pub use error::{CniError, Result};
pub use skel::{CmdArgs, Command};
