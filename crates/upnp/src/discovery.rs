use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use bstr::BStr;
use regex::Regex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace, warn};
use url::Url;

use crate::compat::{are_service_types_compatible, split_usn};
use crate::{SSDP_SEARCH_MEDIARENDERER_ST, SSDP_SEARCH_ROOT_ST};

const SSDP_PORT: u16 = 1900;
const SSDP_MCAST_IPV4: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
const SSDP_MULTICAST_ADDR: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(SSDP_MCAST_IPV4, SSDP_PORT));

const NTS_ALIVE: &str = "ssdp:alive";
const NTS_BYEBYE: &str = "ssdp:byebye";

pub fn make_ssdp_search_request(kind: &str) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
            Host: 239.255.255.250:1900\r\n\
            Man: \"ssdp:discover\"\r\n\
            MX: 3\r\n\
            ST: {kind}\r\n\
            \r\n"
    )
}

static MAX_AGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)max-age\s*=\s*(\d+)").unwrap());

/// Extracts `max-age` seconds from a `Cache-Control` header value. Missing or
/// malformed directives yield `None`.
pub fn get_max_age(cache_control: &str) -> Option<u64> {
    MAX_AGE_RE
        .captures(cache_control)
        .and_then(|caps| caps[1].parse().ok())
}

/// A renderer known to SSDP. `expires_at` comes from the advertised
/// `max-age`; the record dies at that point unless a fresh alive arrives.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub udn: String,
    pub location: Url,
    pub device_type: String,
    pub expires_at: Instant,
    pub last_seen: Instant,
}

#[derive(Debug)]
pub enum DiscoveryEvent {
    Added(DiscoveredDevice),
    Removed { udn: String },
}

#[derive(Debug)]
pub enum SsdpMessage<'a> {
    Notify(SsdpNotify<'a>),
    SearchResponse(SsdpSearchResponse<'a>),
    Other,
}

#[derive(Debug)]
pub struct SsdpNotify<'a> {
    pub nt: &'a str,
    pub nts: &'a str,
    pub usn: &'a str,
    pub location: Option<&'a str>,
    pub cache_control: Option<&'a str>,
}

#[derive(Debug)]
pub struct SsdpSearchResponse<'a> {
    pub st: &'a str,
    pub usn: &'a str,
    pub location: Option<&'a str>,
    pub cache_control: Option<&'a str>,
}

fn header_str<'a>(headers: &[httparse::Header<'a>], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .and_then(|h| std::str::from_utf8(h.value).ok())
}

pub fn try_parse_ssdp<'a, 'h>(
    buf: &'a [u8],
    headers: &'h mut [httparse::Header<'a>],
) -> anyhow::Result<SsdpMessage<'a>> {
    if buf.starts_with(b"HTTP/") {
        let mut resp = httparse::Response::new(headers);
        resp.parse(buf).context("error parsing response")?;
        match resp.code {
            Some(200) => {}
            other => bail!("bad response code {other:?}, expected 200"),
        }
        let (Some(st), Some(usn)) = (
            header_str(resp.headers, "ST"),
            header_str(resp.headers, "USN"),
        ) else {
            bail!("search response without ST and USN");
        };
        return Ok(SsdpMessage::SearchResponse(SsdpSearchResponse {
            st,
            usn,
            location: header_str(resp.headers, "LOCATION"),
            cache_control: header_str(resp.headers, "CACHE-CONTROL"),
        }));
    }

    let mut req = httparse::Request::new(headers);
    req.parse(buf).context("error parsing request")?;
    match req.method {
        Some("NOTIFY") => {
            let (Some(nt), Some(nts), Some(usn)) = (
                header_str(req.headers, "NT"),
                header_str(req.headers, "NTS"),
                header_str(req.headers, "USN"),
            ) else {
                bail!("NOTIFY without NT, NTS and USN");
            };
            Ok(SsdpMessage::Notify(SsdpNotify {
                nt,
                nts,
                usn,
                location: header_str(req.headers, "LOCATION"),
                cache_control: header_str(req.headers, "CACHE-CONTROL"),
            }))
        }
        _ => Ok(SsdpMessage::Other),
    }
}

fn is_interesting_target(target: &str) -> bool {
    target == SSDP_SEARCH_ROOT_ST
        || are_service_types_compatible(SSDP_SEARCH_MEDIARENDERER_ST, target)
}

/// The per-UDN record table. Exclusively owned by the discovery task; the
/// rest of the bridge only ever sees events and record snapshots.
struct DeviceTable {
    records: HashMap<String, DiscoveredDevice>,
    tx: UnboundedSender<DiscoveryEvent>,
}

impl DeviceTable {
    fn new(tx: UnboundedSender<DiscoveryEvent>) -> Self {
        Self {
            records: HashMap::new(),
            tx,
        }
    }

    fn on_alive(
        &mut self,
        udn: &str,
        target: &str,
        location: &str,
        max_age: Option<u64>,
        now: Instant,
    ) {
        if let Some(record) = self.records.get_mut(udn) {
            record.last_seen = now;
            if let Some(max_age) = max_age {
                record.expires_at = now + Duration::from_secs(max_age);
            }
            return;
        }
        if !is_interesting_target(target) {
            trace!(udn, target, "ignoring advertisement");
            return;
        }
        let Some(max_age) = max_age else {
            debug!(udn, "ignoring new device advertised without usable max-age");
            return;
        };
        let location = match Url::parse(location) {
            Ok(url) => url,
            Err(e) => {
                debug!(udn, location, "ignoring device with bad location: {e:#}");
                return;
            }
        };
        let record = DiscoveredDevice {
            udn: udn.to_owned(),
            location,
            device_type: target.to_owned(),
            expires_at: now + Duration::from_secs(max_age),
            last_seen: now,
        };
        debug!(udn, location = %record.location, "discovered device");
        self.records.insert(udn.to_owned(), record.clone());
        let _ = self.tx.send(DiscoveryEvent::Added(record));
    }

    fn on_byebye(&mut self, udn: &str) {
        if self.records.remove(udn).is_some() {
            debug!(udn, "device said byebye");
            let _ = self.tx.send(DiscoveryEvent::Removed {
                udn: udn.to_owned(),
            });
        }
    }

    fn evict_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .records
            .values()
            .filter(|r| r.expires_at <= now)
            .map(|r| r.udn.clone())
            .collect();
        for udn in expired {
            debug!(udn, "device advertisement expired");
            self.records.remove(&udn);
            let _ = self.tx.send(DiscoveryEvent::Removed { udn });
        }
    }

    fn handle_packet(&mut self, buf: &[u8], from: SocketAddr, now: Instant) {
        let mut headers = [httparse::EMPTY_HEADER; 32];
        let msg = match try_parse_ssdp(buf, &mut headers) {
            Ok(msg) => msg,
            Err(e) => {
                trace!(?from, packet = ?BStr::new(buf), "unparsable SSDP packet: {e:#}");
                return;
            }
        };
        match msg {
            SsdpMessage::Notify(notify) => {
                let (udn, _) = split_usn(notify.usn);
                match notify.nts {
                    NTS_ALIVE => {
                        let Some(location) = notify.location else {
                            trace!(udn, "alive without location, ignoring");
                            return;
                        };
                        let max_age = notify.cache_control.and_then(get_max_age);
                        self.on_alive(udn, notify.nt, location, max_age, now);
                    }
                    NTS_BYEBYE => self.on_byebye(udn),
                    other => trace!(udn, nts = other, "unknown NTS, ignoring"),
                }
            }
            SsdpMessage::SearchResponse(resp) => {
                let (udn, _) = split_usn(resp.usn);
                let Some(location) = resp.location else {
                    trace!(udn, "search response without location, ignoring");
                    return;
                };
                let max_age = resp.cache_control.and_then(get_max_age);
                self.on_alive(udn, resp.st, location, max_age, now);
            }
            SsdpMessage::Other => {}
        }
    }
}

pub struct SsdpDiscoveryOptions {
    /// IPv4 address of the interface the bridge is configured to use.
    pub interface_ip: Ipv4Addr,
    pub search_interval: Duration,
    pub evict_interval: Duration,
}

impl Default for SsdpDiscoveryOptions {
    fn default() -> Self {
        Self {
            interface_ip: Ipv4Addr::UNSPECIFIED,
            search_interval: Duration::from_secs(60),
            evict_interval: Duration::from_secs(5),
        }
    }
}

/// SSDP listener and active searcher. Joins the multicast group for NOTIFY
/// traffic and periodically M-SEARCHes for root devices and MediaRenderers;
/// add/remove events go out on the channel handed to [`SsdpDiscovery::new`].
pub struct SsdpDiscovery {
    opts: SsdpDiscoveryOptions,
    multicast: UdpSocket,
    search: UdpSocket,
    table: DeviceTable,
}

fn bind_multicast_socket(interface_ip: Ipv4Addr) -> anyhow::Result<UdpSocket> {
    let bind_addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, SSDP_PORT).into();
    let sock = socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::DGRAM, None)
        .context("error creating socket")?;
    #[cfg(not(target_os = "windows"))]
    sock.set_reuse_port(true)
        .context("error setting SO_REUSEPORT")?;
    sock.set_reuse_address(true)
        .context("error setting SO_REUSEADDR")?;
    sock.bind(&bind_addr.into())
        .context(bind_addr)
        .context("error binding")?;
    sock.set_nonblocking(true)?;

    let sock = UdpSocket::from_std(sock.into())
        .context("error converting socket2 socket to tokio")?;

    for ifaddr in [Ipv4Addr::UNSPECIFIED, interface_ip] {
        trace!(multiaddr=?SSDP_MCAST_IPV4, interface=?ifaddr, "joining multicast group");
        if let Err(e) = sock.join_multicast_v4(SSDP_MCAST_IPV4, ifaddr) {
            debug!(multiaddr=?SSDP_MCAST_IPV4, interface=?ifaddr, "error joining multicast group: {e:#}");
        }
    }
    Ok(sock)
}

impl SsdpDiscovery {
    pub async fn new(
        opts: SsdpDiscoveryOptions,
        tx: UnboundedSender<DiscoveryEvent>,
    ) -> anyhow::Result<Self> {
        let multicast = bind_multicast_socket(opts.interface_ip)?;
        let search = UdpSocket::bind((opts.interface_ip, 0))
            .await
            .context("error binding search socket")?;
        Ok(Self {
            opts,
            multicast,
            search,
            table: DeviceTable::new(tx),
        })
    }

    pub async fn run_forever(self) -> anyhow::Result<()> {
        let SsdpDiscovery {
            opts,
            multicast,
            search,
            mut table,
        } = self;

        let mut search_interval = tokio::time::interval(opts.search_interval);
        search_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut evict_interval = tokio::time::interval(opts.evict_interval);
        evict_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut mcast_buf = [0u8; 2048];
        let mut search_buf = [0u8; 2048];

        loop {
            tokio::select! {
                _ = search_interval.tick() => {
                    for st in [SSDP_SEARCH_ROOT_ST, SSDP_SEARCH_MEDIARENDERER_ST] {
                        let request = make_ssdp_search_request(st);
                        if let Err(e) = search.send_to(request.as_bytes(), SSDP_MULTICAST_ADDR).await {
                            warn!("failed to send SSDP search request: {e:#}");
                        }
                    }
                }
                _ = evict_interval.tick() => {
                    table.evict_expired(Instant::now());
                }
                r = multicast.recv_from(&mut mcast_buf) => {
                    let (len, addr) = r.context("error receiving from multicast socket")?;
                    table.handle_packet(&mcast_buf[..len], addr, Instant::now());
                }
                r = search.recv_from(&mut search_buf) => {
                    let (len, addr) = r.context("error receiving from search socket")?;
                    table.handle_packet(&search_buf[..len], addr, Instant::now());
                }
            }
        }
    }
}
