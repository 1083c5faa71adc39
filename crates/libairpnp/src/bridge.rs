use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::Mutex;
use tokio::sync::mpsc::unbounded_channel;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, info, warn};
use url::Url;

use airplay_serve::{
    AirPlayServiceOptions, ServerInfo, ZeroconfPublisher, run_airplay_service,
};
use upnp::discovery::{DiscoveredDevice, DiscoveryEvent, SsdpDiscovery, SsdpDiscoveryOptions};
use upnp::{
    Device, SERVICE_ID_AVTRANSPORT, SERVICE_ID_CONNECTION_MANAGER, SERVICE_TYPE_AVTRANSPORT,
    SERVICE_TYPE_CONNECTION_MANAGER, SoapClient, are_service_types_compatible,
};

use crate::config::Config;
use crate::control_point::AVControlPoint;
use crate::device_id::create_device_id;
use crate::port_pool::PortPool;
use crate::spawn_utils::spawn;

const DESCRIPTION_TIMEOUT: Duration = Duration::from_secs(10);

pub struct BridgeServerOptions {
    pub config: Config,
    /// TCP ports handed to per-renderer AirPlay listeners.
    pub port_range: Range<u16>,
}

struct BridgeEntry {
    port: u16,
    cancel: CancellationToken,
}

struct BridgeState {
    config: Config,
    ports: PortPool,
    zeroconf: ZeroconfPublisher,
    soap: Arc<SoapClient>,
    http: reqwest::Client,
    entries: Mutex<HashMap<String, BridgeEntry>>,
}

/// Glues discovery to per-renderer AirPlay services: admits compatible
/// MediaRenderers, gives each an AirPlay listener plus a Zeroconf
/// advertisement, and tears everything down when the renderer leaves.
pub struct BridgeServer {
    state: Arc<BridgeState>,
}

impl BridgeServer {
    pub fn new(opts: BridgeServerOptions) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(DESCRIPTION_TIMEOUT)
            .build()
            .context("error building HTTP client")?;
        Ok(Self {
            state: Arc::new(BridgeState {
                config: opts.config,
                ports: PortPool::new(opts.port_range),
                zeroconf: ZeroconfPublisher::new()?,
                soap: Arc::new(SoapClient::new()?),
                http,
                entries: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub async fn run_forever(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let (tx, mut rx) = unbounded_channel();
        let discovery = SsdpDiscovery::new(
            SsdpDiscoveryOptions {
                interface_ip: self.state.config.interface_ip,
                ..Default::default()
            },
            tx,
        )
        .await
        .context("error starting SSDP discovery")?;
        let discovery_fut = discovery.run_forever();
        tokio::pin!(discovery_fut);

        info!(
            interface = %self.state.config.interface_name,
            ip = %self.state.config.interface_ip,
            "bridge running"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                r = &mut discovery_fut => {
                    r.context("SSDP discovery terminated")?;
                    break;
                }
                event = rx.recv() => match event {
                    Some(DiscoveryEvent::Added(record)) => {
                        let state = self.state.clone();
                        let span = debug_span!("device", udn = %record.udn);
                        spawn(span, async move {
                            if let Err(e) = state.admit_device(&record).await {
                                debug!("not bridging {}: {e:#}", record.udn);
                            }
                            Ok(())
                        });
                    }
                    Some(DiscoveryEvent::Removed { udn }) => self.state.remove_device(&udn),
                    None => break,
                }
            }
        }

        self.state.shutdown_all();
        Ok(())
    }
}

impl BridgeState {
    async fn admit_device(self: &Arc<Self>, record: &DiscoveredDevice) -> anyhow::Result<()> {
        if self.entries.lock().contains_key(&record.udn) {
            return Ok(());
        }

        let body = self
            .fetch_with_retry(&record.location)
            .await
            .context("error fetching device description")?;
        let mut device = Device::from_description_xml(&body, &record.location)
            .context("error parsing device description")?;

        if !is_compatible_renderer(&device) {
            debug!(device = %device, "device has no compatible AVTransport/ConnectionManager");
            return Ok(());
        }

        for service_id in [SERVICE_ID_AVTRANSPORT, SERVICE_ID_CONNECTION_MANAGER] {
            let scpd_url = device.service_by_id(service_id)?.scpd_url().clone();
            let scpd = self
                .fetch_with_retry(&scpd_url)
                .await
                .with_context(|| format!("error fetching SCPD for {service_id}"))?;
            device
                .service_by_id_mut(service_id)?
                .initialize(&scpd, self.soap.clone())?;
        }
        let device = Arc::new(device);

        let Some(port) = self.ports.allocate() else {
            warn!(device = %device, "no free AirPlay ports, cannot bridge device");
            return Ok(());
        };
        let cancel = CancellationToken::new();
        let control_point = Arc::new(AVControlPoint::new(device.clone(), cancel.child_token())?);
        let info = ServerInfo::new(create_device_id(device.udn()));
        let name = device.friendly_name().to_owned();
        info!(device = %device, port, deviceid = %info.device_id, "bridging renderer");

        spawn(
            debug_span!("airplay", device = %device.udn()),
            run_airplay_service(
                AirPlayServiceOptions {
                    name: name.clone(),
                    bind_addr: self.config.interface_ip.into(),
                    port,
                    info: info.clone(),
                    shutdown: cancel.clone(),
                },
                control_point,
            ),
        );

        if let Err(e) = self.zeroconf.register(
            device.udn(),
            &name,
            self.config.interface_ip.into(),
            port,
            &info,
        ) {
            warn!("error publishing Zeroconf advertisement: {e:#}");
        }

        self.entries
            .lock()
            .insert(device.udn().to_owned(), BridgeEntry { port, cancel });
        Ok(())
    }

    fn remove_device(&self, udn: &str) {
        let Some(entry) = self.entries.lock().remove(udn) else {
            return;
        };
        info!(udn, "renderer left, tearing down its AirPlay service");
        entry.cancel.cancel();
        self.zeroconf.unregister(udn);
        self.ports.release(entry.port);
    }

    fn shutdown_all(&self) {
        let udns: Vec<String> = self.entries.lock().keys().cloned().collect();
        for udn in udns {
            self.remove_device(&udn);
        }
        self.zeroconf.shutdown();
    }

    /// Descriptions come from flaky embedded HTTP servers; one retry on
    /// transport failure before the device is dropped.
    async fn fetch_with_retry(&self, url: &Url) -> anyhow::Result<String> {
        match self.fetch(url).await {
            Ok(body) => Ok(body),
            Err(e) => {
                debug!(%url, "fetch failed, retrying once: {e:#}");
                self.fetch(url).await
            }
        }
    }

    async fn fetch(&self, url: &Url) -> anyhow::Result<String> {
        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("error fetching {url}"))?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("GET {url} returned {status}");
        }
        response.text().await.context("error reading response body")
    }
}

fn is_compatible_renderer(device: &Device) -> bool {
    let compatible = |service_id: &str, required: &str| {
        device
            .service_by_id(service_id)
            .is_ok_and(|s| are_service_types_compatible(required, s.service_type()))
    };
    compatible(SERVICE_ID_AVTRANSPORT, SERVICE_TYPE_AVTRANSPORT)
        && compatible(SERVICE_ID_CONNECTION_MANAGER, SERVICE_TYPE_CONNECTION_MANAGER)
}
