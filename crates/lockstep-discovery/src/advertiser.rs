//! mDNS advertisement of the master.
//!
//! The master calls [`MasterAdvertiser::register`] after binding so that
//! slaves on the same subnet find it without manual IP entry.
//!
//! # TXT record keys
//!
//! | Key       | Value                              |
//! |-----------|------------------------------------|
//! | `version` | Protocol version (`"1"`)           |
//! | `port`    | TCP session port (default `"8989"`) |
//! | `host`    | Advertised LAN IP address          |

use std::collections::HashMap;
use std::net::IpAddr;

use anyhow::Result;
use mdns_sd::{ServiceDaemon, ServiceInfo};
use tracing::{info, warn};

pub const PROTOCOL_VERSION: &str = "1";

/// Active mDNS advertisement. Call [`unregister`](Self::unregister) to stop.
pub struct MasterAdvertiser {
    daemon: ServiceDaemon,
    fullname: String,
}

impl MasterAdvertiser {
    pub fn register(service_type: &str, instance_name: &str, port: u16, host_ip: IpAddr) -> Result<Self> {
        let daemon = ServiceDaemon::new()?;

        let raw_host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "lockstep-master".to_owned());
        let hostname = format!("{raw_host}.local.");

        let mut properties = HashMap::new();
        properties.insert("version".to_owned(), PROTOCOL_VERSION.to_owned());
        properties.insert("port".to_owned(), port.to_string());
        properties.insert("host".to_owned(), host_ip.to_string());

        let service = ServiceInfo::new(service_type, instance_name, &hostname, host_ip, port, Some(properties))?;
        let fullname = service.get_fullname().to_owned();
        daemon.register(service)?;

        info!("[mDNS] Advertising '{}' at {}:{}", instance_name, host_ip, port);
        Ok(Self { daemon, fullname })
    }

    pub fn fullname(&self) -> &str {
        &self.fullname
    }

    pub fn unregister(self) {
        if let Err(e) = self.daemon.unregister(&self.fullname) {
            warn!("[mDNS] Failed to unregister '{}': {}", self.fullname, e);
        } else {
            info!("[mDNS] Advertisement '{}' removed", self.fullname);
        }
        let _ = self.daemon.shutdown();
    }
}

// ── Local IP detection ────────────────────────────────────────────────────────

/// Primary LAN IPv4 address, from the routing table. Nothing is sent.
pub fn detect_local_ip() -> IpAddr {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| {
            s.connect("8.8.8.8:80")?;
            s.local_addr()
        })
        .map(|a| a.ip())
        .unwrap_or_else(|_| IpAddr::V4(std::net::Ipv4Addr::LOCALHOST))
}
