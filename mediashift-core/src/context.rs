//! Shared runtime context.
//!
//! One `ToolkitContext` is constructed at startup and handed (behind an Arc)
//! to every component that needs configuration, host identity, or platform
//! facts. Nothing in the engine reads global state.

use crate::config::ToolkitConfig;
use std::net::{IpAddr, Ipv4Addr};

#[derive(Debug, Clone)]
pub struct PlatformInfo {
    /// OS label as reported by the toolchain ("linux", "macos", "windows")
    pub os: String,
    pub hostname: String,
}

impl PlatformInfo {
    pub fn detect() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string());
        PlatformInfo {
            os: std::env::consts::OS.to_string(),
            hostname,
        }
    }
}

#[derive(Debug)]
pub struct ToolkitContext {
    pub config: ToolkitConfig,
    pub platform: PlatformInfo,
    /// Short random id distinguishing this process from peers on the network
    pub instance_id: String,
}

impl ToolkitContext {
    pub fn new(config: ToolkitConfig) -> Self {
        let instance_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        ToolkitContext {
            config,
            platform: PlatformInfo::detect(),
            instance_id,
        }
    }

    /// Best-effort local LAN address.
    ///
    /// Opens a connected UDP socket toward a public address (no packet is
    /// sent) and reads the chosen source address back. Falls back to
    /// loopback when the host has no route.
    pub fn local_ip(&self) -> IpAddr {
        local_ip_probe().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}

fn local_ip_probe() -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    socket.connect(("8.8.8.8", 80)).ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}
