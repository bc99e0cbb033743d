//! Finding the master on the LAN.
//!
//! [`MdnsDiscovery`] advertises (master side) and browses (slave side) the
//! session service over mDNS. [`StaticDiscovery`] reports one fixed endpoint
//! and is used when the master address is known up front.

use std::net::Ipv4Addr;

use lockstep_core::{DiscoveryError, PeerInfo};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

mod advertiser;

pub use advertiser::{detect_local_ip, MasterAdvertiser, PROTOCOL_VERSION};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Started,
    ServiceFound(PeerInfo),
    ResolveFailed { fullname: String, reason: String },
    ServiceLost { fullname: String },
}

pub trait DiscoveryService: Send {
    /// Publish this process as the master on `port`.
    fn advertise(&mut self, name: &str, port: u16) -> Result<(), DiscoveryError>;

    /// Start looking for a master.
    fn discover(&mut self) -> Result<mpsc::Receiver<DiscoveryEvent>, DiscoveryError>;

    fn stop(&mut self);
}

/// Wait for the first resolved master. `None` once the event stream ends.
pub async fn first_master(events: &mut mpsc::Receiver<DiscoveryEvent>) -> Option<PeerInfo> {
    while let Some(event) = events.recv().await {
        match event {
            DiscoveryEvent::ServiceFound(peer) => return Some(peer),
            DiscoveryEvent::ResolveFailed { fullname, reason } => {
                warn!("[Discovery] Could not resolve {}: {}", fullname, reason)
            }
            DiscoveryEvent::ServiceLost { fullname } => debug!("[Discovery] {} went away", fullname),
            DiscoveryEvent::Started => debug!("[Discovery] Search started"),
        }
    }
    None
}

// MARK: - MdnsDiscovery

pub struct MdnsDiscovery {
    service_type: String,
    daemon: Option<ServiceDaemon>,
    advertiser: Option<MasterAdvertiser>,
}

impl MdnsDiscovery {
    pub fn new(service_type: impl Into<String>) -> Self {
        Self {
            service_type: service_type.into(),
            daemon: None,
            advertiser: None,
        }
    }
}

impl DiscoveryService for MdnsDiscovery {
    fn advertise(&mut self, name: &str, port: u16) -> Result<(), DiscoveryError> {
        if let Some(previous) = self.advertiser.take() {
            previous.unregister();
        }
        let advertiser = MasterAdvertiser::register(&self.service_type, name, port, detect_local_ip())
            .map_err(|e| DiscoveryError::RegisterFailed(format!("{e:#}")))?;
        self.advertiser = Some(advertiser);
        Ok(())
    }

    fn discover(&mut self) -> Result<mpsc::Receiver<DiscoveryEvent>, DiscoveryError> {
        let daemon = ServiceDaemon::new().map_err(|e| DiscoveryError::DaemonFailed(e.to_string()))?;
        let receiver = daemon
            .browse(&self.service_type)
            .map_err(|e| DiscoveryError::BrowseFailed(e.to_string()))?;

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let mut started = false;
            while let Ok(event) = receiver.recv_async().await {
                if let Some(event) = map_event(event, &mut started) {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
            }
        });

        info!("[Discovery] Browsing for {}", self.service_type);
        self.daemon = Some(daemon);
        Ok(rx)
    }

    fn stop(&mut self) {
        if let Some(advertiser) = self.advertiser.take() {
            advertiser.unregister();
        }
        if let Some(daemon) = self.daemon.take() {
            let _ = daemon.shutdown();
        }
    }
}

impl Drop for MdnsDiscovery {
    fn drop(&mut self) {
        self.stop();
    }
}

fn map_event(event: ServiceEvent, started: &mut bool) -> Option<DiscoveryEvent> {
    match event {
        ServiceEvent::SearchStarted(_) if !*started => {
            *started = true;
            Some(DiscoveryEvent::Started)
        }
        ServiceEvent::ServiceResolved(info) => Some(resolve(&info)),
        ServiceEvent::ServiceRemoved(_, fullname) => {
            debug!("[Discovery] Master gone: {}", fullname);
            Some(DiscoveryEvent::ServiceLost { fullname })
        }
        _ => None,
    }
}

fn resolve(info: &ServiceInfo) -> DiscoveryEvent {
    let fullname = info.get_fullname().to_owned();
    let mut addresses: Vec<String> = info.get_addresses().iter().map(|a| a.to_string()).collect();
    // IPv4 first: it needs no zone or brackets.
    addresses.sort_by_key(|a| a.parse::<Ipv4Addr>().is_err());
    match addresses.into_iter().next() {
        Some(address) => {
            info!("[Discovery] Found master: {} at {}:{}", fullname, address, info.get_port());
            DiscoveryEvent::ServiceFound(PeerInfo::new(
                fullname,
                info.get_hostname().trim_end_matches('.'),
                address,
                info.get_port(),
            ))
        }
        None => DiscoveryEvent::ResolveFailed {
            fullname,
            reason: "no address in record".to_owned(),
        },
    }
}

// MARK: - StaticDiscovery

/// Reports one configured endpoint.
#[derive(Debug, Clone)]
pub struct StaticDiscovery {
    peer: PeerInfo,
}

impl StaticDiscovery {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        let address = address.into();
        Self {
            peer: PeerInfo::new(format!("static:{address}:{port}"), address.clone(), address, port),
        }
    }

    /// Parse `host:port`.
    pub fn parse(endpoint: &str) -> Result<Self, DiscoveryError> {
        let (host, port) = endpoint
            .rsplit_once(':')
            .ok_or_else(|| DiscoveryError::BrowseFailed(format!("{endpoint:?} is not host:port")))?;
        let port = port
            .parse()
            .map_err(|_| DiscoveryError::BrowseFailed(format!("invalid port in {endpoint:?}")))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(DiscoveryError::BrowseFailed(format!("missing host in {endpoint:?}")));
        }
        Ok(Self::new(host, port))
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }
}

impl DiscoveryService for StaticDiscovery {
    fn advertise(&mut self, name: &str, port: u16) -> Result<(), DiscoveryError> {
        debug!("[Discovery] Static mode, not advertising '{}' on {}", name, port);
        Ok(())
    }

    fn discover(&mut self) -> Result<mpsc::Receiver<DiscoveryEvent>, DiscoveryError> {
        let (tx, rx) = mpsc::channel(2);
        let _ = tx.try_send(DiscoveryEvent::Started);
        let _ = tx.try_send(DiscoveryEvent::ServiceFound(self.peer.clone()));
        Ok(rx)
    }

    fn stop(&mut self) {}
}
