use std::collections::HashMap;
use std::net::IpAddr;

use anyhow::Context;
use mdns_sd::{ServiceDaemon, ServiceInfo};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::state::ServerInfo;

pub const AIRPLAY_SERVICE_TYPE: &str = "_airplay._tcp.local.";

fn txt_properties(info: &ServerInfo) -> HashMap<String, String> {
    HashMap::from([
        ("deviceid".to_owned(), info.device_id.clone()),
        ("features".to_owned(), format!("{:#x}", info.features)),
        ("model".to_owned(), info.model.clone()),
    ])
}

/// One mDNS daemon shared by all bridged renderers; each renderer gets its
/// own `_airplay._tcp` registration keyed here by UDN.
pub struct ZeroconfPublisher {
    daemon: ServiceDaemon,
    registered: Mutex<HashMap<String, String>>,
}

impl ZeroconfPublisher {
    pub fn new() -> anyhow::Result<Self> {
        let daemon = ServiceDaemon::new().context("error creating mDNS daemon")?;
        Ok(Self {
            daemon,
            registered: Mutex::new(HashMap::new()),
        })
    }

    pub fn register(
        &self,
        key: &str,
        name: &str,
        ip: IpAddr,
        port: u16,
        info: &ServerInfo,
    ) -> anyhow::Result<()> {
        let hostname = gethostname::gethostname();
        let hostname = format!("{}.local.", hostname.to_string_lossy());
        let service = ServiceInfo::new(
            AIRPLAY_SERVICE_TYPE,
            name,
            &hostname,
            ip,
            port,
            txt_properties(info),
        )
        .context("error building mDNS service info")?;
        let fullname = service.get_fullname().to_owned();
        self.daemon
            .register(service)
            .context("error registering mDNS service")?;
        info!(name, %ip, port, "registered AirPlay service");
        self.registered.lock().insert(key.to_owned(), fullname);
        Ok(())
    }

    pub fn unregister(&self, key: &str) {
        let Some(fullname) = self.registered.lock().remove(key) else {
            return;
        };
        debug!(name = %fullname, "unregistering AirPlay service");
        if let Err(e) = self.daemon.unregister(&fullname) {
            debug!("error unregistering {fullname}: {e:#}");
        }
    }

    /// Withdraws every advertisement and stops the daemon.
    pub fn shutdown(&self) {
        let keys: Vec<String> = self.registered.lock().keys().cloned().collect();
        for key in keys {
            self.unregister(&key);
        }
        let _ = self.daemon.shutdown();
    }
}
