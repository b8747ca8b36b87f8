//! LAN discovery collaborator: advertises this organization's endpoint
//! over mDNS/DNS-SD so agents on the local network can find it without a
//! directory round-trip. Treated strictly as a start/stop collaborator —
//! it never feeds back into registration or the broker.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

use crate::config::{LocalNetworkConfig, OrganizationConfig, ServerConfig};

/// TXT record fields published alongside the service instance.
#[derive(Debug, Clone)]
pub struct ServiceTxtRecord {
    pub npi: String,
    pub name: String,
    pub org_type: String,
    pub port: u16,
}

impl ServiceTxtRecord {
    fn entries(&self) -> Vec<(String, String)> {
        vec![
            ("npi".to_string(), self.npi.clone()),
            ("name".to_string(), self.name.clone()),
            ("type".to_string(), self.org_type.clone()),
        ]
    }
}

/// Start/stop collaborator boundary. The production implementation below
/// is a no-op placeholder; a real deployment would register an
/// `mdns-sd::ServiceDaemon` instance here.
pub trait DiscoveryAdvertiser: Send + Sync {
    fn start(&self, record: ServiceTxtRecord) -> Result<(), crate::error::BrokerError>;
    fn stop(&self);
}

/// LAN advertiser. `localNetwork.enabled = false` (the default) keeps
/// this fully inert; `true` logs the would-be advertisement.
///
/// Note: in production this would hand the TXT record to `mdns-sd`'s
/// `ServiceDaemon::new()` / `register(...)`. That dependency is not
/// wired up here; advertising is logged, not broadcast.
pub struct MdnsDiscovery {
    enabled: bool,
    running: AtomicBool,
}

impl MdnsDiscovery {
    pub fn new(config: &LocalNetworkConfig) -> Self {
        Self {
            enabled: config.enabled,
            running: AtomicBool::new(false),
        }
    }

    pub fn from_config(organization: &OrganizationConfig, server: &ServerConfig, local_network: &LocalNetworkConfig) -> (Self, ServiceTxtRecord) {
        let record = ServiceTxtRecord {
            npi: organization.npi.clone(),
            name: organization.name.clone(),
            org_type: format!("{:?}", organization.org_type).to_lowercase(),
            port: server.port,
        };
        (Self::new(local_network), record)
    }
}

impl DiscoveryAdvertiser for MdnsDiscovery {
    fn start(&self, record: ServiceTxtRecord) -> Result<(), crate::error::BrokerError> {
        if !self.enabled {
            return Ok(());
        }
        self.running.store(true, Ordering::SeqCst);
        info!(
            npi = %record.npi,
            name = %record.name,
            port = record.port,
            txt = ?record.entries(),
            "discovery advertiser started (mDNS placeholder, not broadcasting)"
        );
        Ok(())
    }

    fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("discovery advertiser stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrganizationType;

    #[test]
    fn disabled_advertiser_never_flips_running() {
        let advertiser = MdnsDiscovery::new(&LocalNetworkConfig { enabled: false });
        let record = ServiceTxtRecord { npi: "1234567893".into(), name: "Test".into(), org_type: "clinic".into(), port: 3000 };
        advertiser.start(record).unwrap();
        assert!(!advertiser.running.load(Ordering::SeqCst));
    }

    #[test]
    fn enabled_advertiser_starts_and_stops_idempotently() {
        let advertiser = MdnsDiscovery::new(&LocalNetworkConfig { enabled: true });
        let record = ServiceTxtRecord { npi: "1234567893".into(), name: "Test".into(), org_type: "clinic".into(), port: 3000 };
        advertiser.start(record).unwrap();
        assert!(advertiser.running.load(Ordering::SeqCst));
        advertiser.stop();
        advertiser.stop();
        assert!(!advertiser.running.load(Ordering::SeqCst));
        let _ = OrganizationType::Clinic;
    }
}
