//! Peer discovery.
//!
//! Three signals feed one registry: UDP announcements from other toolkit
//! instances, replies to the managed application's native discovery probe,
//! and a partial TCP sweep of the local /24. Peers age out when not re-seen
//! within the TTL. Every signal degrades silently; discovery never fails an
//! operation, it just finds fewer peers.

use crate::context::ToolkitContext;
use crate::progress::ProgressBus;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const ANNOUNCE_TYPE: &str = "toolkit_announce";
pub const PROTOCOL_VERSION: u32 = 1;

/// Probe payload understood by the managed application's discovery port.
const APP_PROBE_PAYLOAD: &[u8] = b"M-SEARCH * HTTP/1.0\r\n\r\n";

/// How long one tick listens for probe replies.
const APP_PROBE_WINDOW: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeerRole {
    Source,
    Target,
    Standalone,
}

impl PeerRole {
    /// The role a migration partner must hold. Standalone instances do not
    /// pair up.
    pub fn complement(&self) -> Option<PeerRole> {
        match self {
            PeerRole::Source => Some(PeerRole::Target),
            PeerRole::Target => Some(PeerRole::Source),
            PeerRole::Standalone => None,
        }
    }
}

impl std::str::FromStr for PeerRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "source" => Ok(PeerRole::Source),
            "target" => Ok(PeerRole::Target),
            "standalone" => Ok(PeerRole::Standalone),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

impl std::fmt::Display for PeerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            PeerRole::Source => "SOURCE",
            PeerRole::Target => "TARGET",
            PeerRole::Standalone => "STANDALONE",
        };
        f.write_str(label)
    }
}

/// One UDP announcement datagram.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Announcement {
    #[serde(rename = "type")]
    pub kind: String,
    pub protocol_version: u32,
    pub instance_id: String,
    pub hostname: String,
    pub ip: IpAddr,
    pub port: u16,
    pub role: PeerRole,
}

#[derive(Debug, Clone)]
pub struct NetworkPeer {
    pub ip: IpAddr,
    pub port: u16,
    pub hostname: Option<String>,
    pub role: Option<PeerRole>,
    pub instance_id: Option<String>,
    /// Server name reported by the managed application's discovery reply.
    pub app_name: Option<String>,
    /// Machine identifier reported by the managed application.
    pub app_identifier: Option<String>,
    /// The managed application answered a probe at this address.
    pub has_app: bool,
    /// A toolkit instance announced itself from this address.
    pub has_toolkit: bool,
    pub last_seen: Instant,
}

impl NetworkPeer {
    pub fn age_secs(&self) -> u64 {
        self.last_seen.elapsed().as_secs()
    }
}

#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    Discovered(NetworkPeer),
    Lost(NetworkPeer),
}

type PeerKey = (IpAddr, u16);

pub struct DiscoveryService {
    ctx: Arc<ToolkitContext>,
    role: PeerRole,
    peers: DashMap<PeerKey, NetworkPeer>,
    events: ProgressBus<DiscoveryEvent>,
    cancel: CancellationToken,
}

impl DiscoveryService {
    pub fn new(ctx: Arc<ToolkitContext>, role: PeerRole) -> Arc<Self> {
        Arc::new(DiscoveryService {
            ctx,
            role,
            peers: DashMap::new(),
            events: ProgressBus::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// The datagram this instance broadcasts every tick.
    pub fn announcement(&self) -> Announcement {
        Announcement {
            kind: ANNOUNCE_TYPE.to_string(),
            protocol_version: PROTOCOL_VERSION,
            instance_id: self.ctx.instance_id.clone(),
            hostname: self.ctx.platform.hostname.clone(),
            ip: self.ctx.local_ip(),
            port: self.ctx.config.network.toolkit_port,
            role: self.role,
        }
    }

    /// Periodic discovery loop; returns when [`DiscoveryService::stop`] is
    /// called.
    pub async fn run(self: Arc<Self>) {
        let network = &self.ctx.config.network;
        info!(
            role = %self.role,
            announce_port = network.announce_port,
            "discovery started"
        );

        let listener = match UdpSocket::bind(("0.0.0.0", network.announce_port)).await {
            Ok(socket) => Some(socket),
            Err(e) => {
                // Another instance on this host already owns the port.
                warn!("announce listener unavailable: {e}");
                None
            }
        };
        let sender = match broadcast_socket().await {
            Ok(socket) => Some(socket),
            Err(e) => {
                warn!("announce sender unavailable: {e}");
                None
            }
        };
        let prober = match broadcast_socket().await {
            Ok(socket) => Some(socket),
            Err(e) => {
                warn!("app probe socket unavailable: {e}");
                None
            }
        };

        let mut interval =
            tokio::time::interval(Duration::from_secs(network.discovery_interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Some(socket) = &prober {
                        self.probe_app_broadcast(socket).await;
                    }
                    if let Some(socket) = &sender {
                        self.send_announcement(socket).await;
                    }
                    if let Some(socket) = &listener {
                        self.drain_announcements(socket);
                    }
                    self.probe_subnet().await;
                    self.purge_expired();
                }
            }
        }
        info!("discovery stopped");
    }

    /// Pull every queued datagram off the announce listener.
    fn drain_announcements(&self, socket: &UdpSocket) {
        let mut buf = [0u8; 2048];
        loop {
            match socket.try_recv_from(&mut buf) {
                Ok((len, from)) => match serde_json::from_slice::<Announcement>(&buf[..len]) {
                    Ok(announcement) => {
                        self.ingest_announcement(announcement, from.ip());
                    }
                    Err(e) => debug!(%from, "ignoring malformed announcement: {e}"),
                },
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!("announce recv failed: {e}");
                    break;
                }
            }
        }
    }

    async fn send_announcement(&self, socket: &UdpSocket) {
        let announcement = self.announcement();
        let payload = match serde_json::to_vec(&announcement) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("could not encode announcement: {e}");
                return;
            }
        };
        let target = (Ipv4Addr::BROADCAST, self.ctx.config.network.announce_port);
        if let Err(e) = socket.send_to(&payload, target).await {
            debug!("announce send failed: {e}");
        }
    }

    async fn probe_app_broadcast(&self, socket: &UdpSocket) {
        let target = (
            Ipv4Addr::BROADCAST,
            self.ctx.config.network.app_discovery_port,
        );
        if let Err(e) = socket.send_to(APP_PROBE_PAYLOAD, target).await {
            debug!("app probe send failed: {e}");
            return;
        }
        let deadline = Instant::now() + APP_PROBE_WINDOW;
        let mut buf = [0u8; 1024];
        loop {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()).filter(|d| !d.is_zero())
            else {
                break;
            };
            match tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await {
                Ok(Ok((len, from))) => {
                    let reply = String::from_utf8_lossy(&buf[..len]);
                    self.ingest_app_reply(from.ip(), &reply);
                }
                Ok(Err(e)) => {
                    debug!("app probe recv failed: {e}");
                    break;
                }
                Err(_) => break,
            }
        }
    }

    /// Partial sweep of the local /24: every `probe_stride`-th address,
    /// connect to the application port. Finds headless installs that answer
    /// no broadcast. Already-registered addresses are not re-probed.
    async fn probe_subnet(&self) {
        let IpAddr::V4(local) = self.ctx.local_ip() else {
            return;
        };
        if local.is_loopback() {
            return;
        }
        let network = &self.ctx.config.network;
        let [a, b, c, _] = local.octets();
        let timeout = Duration::from_millis(network.probe_timeout_ms);
        let port = network.app_port;
        let stride = usize::from(network.probe_stride.max(1));

        let mut probes = tokio::task::JoinSet::new();
        for host in (1u16..255).step_by(stride) {
            let candidate = Ipv4Addr::new(a, b, c, host as u8);
            if candidate == local {
                continue;
            }
            let candidate_ip = IpAddr::V4(candidate);
            if self.peers.iter().any(|entry| entry.key().0 == candidate_ip) {
                continue;
            }
            probes.spawn(async move {
                match tokio::time::timeout(timeout, TcpStream::connect((candidate, port))).await {
                    Ok(Ok(_)) => Some(candidate),
                    _ => None,
                }
            });
        }
        while let Some(result) = probes.join_next().await {
            if let Ok(Some(ip)) = result {
                self.ingest_app_peer(IpAddr::V4(ip));
            }
        }
    }

    /// Fold one announcement into the registry. Returns `true` when it
    /// introduced a peer not seen before.
    pub fn ingest_announcement(&self, announcement: Announcement, from: IpAddr) -> bool {
        if announcement.kind != ANNOUNCE_TYPE
            || announcement.protocol_version != PROTOCOL_VERSION
        {
            debug!(
                kind = %announcement.kind,
                version = announcement.protocol_version,
                "ignoring incompatible announcement"
            );
            return false;
        }
        if announcement.instance_id == self.ctx.instance_id {
            return false;
        }
        let ip = if announcement.ip.is_unspecified() {
            from
        } else {
            announcement.ip
        };

        let mut discovered = None;
        match self.peers.entry((ip, announcement.port)) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                let peer = entry.get_mut();
                peer.hostname = Some(announcement.hostname);
                peer.role = Some(announcement.role);
                peer.instance_id = Some(announcement.instance_id);
                peer.has_toolkit = true;
                peer.last_seen = Instant::now();
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let peer = NetworkPeer {
                    ip,
                    port: announcement.port,
                    hostname: Some(announcement.hostname),
                    role: Some(announcement.role),
                    instance_id: Some(announcement.instance_id),
                    app_name: None,
                    app_identifier: None,
                    has_app: false,
                    has_toolkit: true,
                    last_seen: Instant::now(),
                };
                discovered = Some(peer.clone());
                entry.insert(peer);
            }
        }
        if let Some(peer) = discovered {
            info!(ip = %peer.ip, port = peer.port, role = ?peer.role, "peer discovered");
            self.events.publish(DiscoveryEvent::Discovered(peer));
            true
        } else {
            false
        }
    }

    /// Record an unconfirmed candidate found by the subnet sweep.
    pub fn ingest_app_peer(&self, ip: IpAddr) {
        if ip == self.ctx.local_ip() {
            return;
        }
        let port = self.ctx.config.network.app_port;
        self.merge_app_observation(ip, port, None, None);
    }

    /// Fold one reply to the application discovery probe into the registry.
    pub fn ingest_app_reply(&self, ip: IpAddr, reply: &str) {
        if ip == self.ctx.local_ip() {
            return;
        }
        let info = parse_probe_reply(reply);
        let port = info.port.unwrap_or(self.ctx.config.network.app_port);
        self.merge_app_observation(ip, port, info.name, info.identifier);
    }

    fn merge_app_observation(
        &self,
        ip: IpAddr,
        port: u16,
        app_name: Option<String>,
        app_identifier: Option<String>,
    ) {
        let mut discovered = None;
        match self.peers.entry((ip, port)) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                let peer = entry.get_mut();
                peer.has_app = true;
                // Additive merge: a reply without a field never erases one.
                if app_name.is_some() {
                    peer.app_name = app_name;
                }
                if app_identifier.is_some() {
                    peer.app_identifier = app_identifier;
                }
                peer.last_seen = Instant::now();
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let peer = NetworkPeer {
                    ip,
                    port,
                    hostname: Some(ip.to_string()),
                    role: Some(PeerRole::Standalone),
                    instance_id: None,
                    app_name,
                    app_identifier,
                    has_app: true,
                    has_toolkit: false,
                    last_seen: Instant::now(),
                };
                discovered = Some(peer.clone());
                entry.insert(peer);
            }
        }
        if let Some(peer) = discovered {
            info!(ip = %peer.ip, port = peer.port, "application instance discovered");
            self.events.publish(DiscoveryEvent::Discovered(peer));
        }
    }

    /// Drop peers not re-seen within the TTL; returns how many were lost.
    pub fn purge_expired(&self) -> usize {
        let ttl = Duration::from_secs(self.ctx.config.network.peer_ttl_secs);
        let expired: Vec<PeerKey> = self
            .peers
            .iter()
            .filter(|entry| entry.last_seen.elapsed() > ttl)
            .map(|entry| *entry.key())
            .collect();
        let mut lost = 0;
        for key in expired {
            if let Some((_, peer)) = self.peers.remove(&key) {
                info!(ip = %peer.ip, port = peer.port, "peer expired");
                self.events.publish(DiscoveryEvent::Lost(peer));
                lost += 1;
            }
        }
        lost
    }

    /// The freshest toolkit peer whose role complements ours.
    pub fn find_partner(&self) -> Option<NetworkPeer> {
        let want = self.role.complement()?;
        self.peers
            .iter()
            .filter(|entry| entry.has_toolkit && entry.role == Some(want))
            .max_by_key(|entry| entry.last_seen)
            .map(|entry| entry.value().clone())
    }

    /// Snapshot of the registry, freshest peers first.
    pub fn peers(&self) -> Vec<NetworkPeer> {
        let mut all: Vec<NetworkPeer> = self.peers.iter().map(|entry| entry.value().clone()).collect();
        all.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        all
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct ProbeReply {
    name: Option<String>,
    port: Option<u16>,
    identifier: Option<String>,
}

/// Parse the header-style reply the managed application sends to a
/// discovery probe. Unknown headers are skipped; a reply that carries
/// none of the known headers yields an empty result.
fn parse_probe_reply(reply: &str) -> ProbeReply {
    let mut parsed = ProbeReply::default();
    for line in reply.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        if key.eq_ignore_ascii_case("name") {
            parsed.name = Some(value.to_string());
        } else if key.eq_ignore_ascii_case("port") {
            parsed.port = value.parse().ok();
        } else if key.eq_ignore_ascii_case("resource-identifier") {
            parsed.identifier = Some(value.to_string());
        }
    }
    parsed
}

async fn broadcast_socket() -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    socket.set_broadcast(true)?;
    if let Ok(addr) = socket.local_addr() {
        debug!(%addr, "broadcast socket bound");
    }
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolkitConfig;

    fn service(role: PeerRole) -> Arc<DiscoveryService> {
        DiscoveryService::new(Arc::new(ToolkitContext::new(ToolkitConfig::default())), role)
    }

    fn announcement(instance_id: &str, ip: [u8; 4], port: u16, role: PeerRole) -> Announcement {
        Announcement {
            kind: ANNOUNCE_TYPE.to_string(),
            protocol_version: PROTOCOL_VERSION,
            instance_id: instance_id.to_string(),
            hostname: format!("host-{instance_id}"),
            ip: IpAddr::V4(Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3])),
            port,
            role,
        }
    }

    #[test]
    fn test_announcement_wire_shape() {
        let service = service(PeerRole::Source);
        let value = serde_json::to_value(service.announcement()).unwrap();
        assert_eq!(value["type"], "toolkit_announce");
        assert_eq!(value["protocol_version"], 1);
        assert_eq!(value["role"], "SOURCE");
        assert_eq!(value["port"], 52400);
        assert!(value["instance_id"].as_str().unwrap().len() == 8);
    }

    #[test]
    fn test_two_announcements_one_tick() {
        let service = service(PeerRole::Source);
        let mut events = service.subscribe();
        let from = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 99));

        assert!(service.ingest_announcement(
            announcement("aaaa0001", [10, 0, 0, 11], 52400, PeerRole::Target),
            from
        ));
        assert!(service.ingest_announcement(
            announcement("bbbb0002", [10, 0, 0, 12], 52400, PeerRole::Standalone),
            from
        ));
        assert_eq!(service.peers().len(), 2);
        assert!(matches!(events.try_recv(), Ok(DiscoveryEvent::Discovered(_))));
        assert!(matches!(events.try_recv(), Ok(DiscoveryEvent::Discovered(_))));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_reannounce_refreshes_without_second_event() {
        let service = service(PeerRole::Source);
        let mut events = service.subscribe();
        let from = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 99));
        let first = announcement("aaaa0001", [10, 0, 0, 11], 52400, PeerRole::Target);

        assert!(service.ingest_announcement(first.clone(), from));
        assert!(!service.ingest_announcement(first, from));
        assert_eq!(service.peers().len(), 1);
        assert!(matches!(events.try_recv(), Ok(DiscoveryEvent::Discovered(_))));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_own_announcement_ignored() {
        let service = service(PeerRole::Source);
        let own_id = service.ctx.instance_id.clone();
        let from = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 99));
        assert!(!service.ingest_announcement(
            announcement(&own_id, [10, 0, 0, 11], 52400, PeerRole::Target),
            from
        ));
        assert!(service.peers().is_empty());
    }

    #[test]
    fn test_incompatible_announcement_ignored() {
        let service = service(PeerRole::Source);
        let from = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 99));

        let mut wrong_kind = announcement("aaaa0001", [10, 0, 0, 11], 52400, PeerRole::Target);
        wrong_kind.kind = "something_else".to_string();
        assert!(!service.ingest_announcement(wrong_kind, from));

        let mut wrong_version = announcement("aaaa0002", [10, 0, 0, 12], 52400, PeerRole::Target);
        wrong_version.protocol_version = 99;
        assert!(!service.ingest_announcement(wrong_version, from));
        assert!(service.peers().is_empty());
    }

    #[test]
    fn test_unspecified_ip_falls_back_to_sender() {
        let service = service(PeerRole::Source);
        let from = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 42));
        let mut ann = announcement("aaaa0001", [0, 0, 0, 0], 52400, PeerRole::Target);
        ann.ip = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        assert!(service.ingest_announcement(ann, from));
        assert_eq!(service.peers()[0].ip, from);
    }

    #[test]
    fn test_find_partner_wants_complementary_role() {
        let service = service(PeerRole::Source);
        let from = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 99));
        service.ingest_announcement(
            announcement("aaaa0001", [10, 0, 0, 11], 52400, PeerRole::Source),
            from,
        );
        service.ingest_announcement(
            announcement("bbbb0002", [10, 0, 0, 12], 52400, PeerRole::Standalone),
            from,
        );
        assert!(service.find_partner().is_none());

        service.ingest_announcement(
            announcement("cccc0003", [10, 0, 0, 13], 52400, PeerRole::Target),
            from,
        );
        let partner = service.find_partner().unwrap();
        assert_eq!(partner.ip, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 13)));
        assert_eq!(partner.role, Some(PeerRole::Target));
    }

    #[test]
    fn test_standalone_never_pairs() {
        let service = service(PeerRole::Standalone);
        let from = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 99));
        service.ingest_announcement(
            announcement("aaaa0001", [10, 0, 0, 11], 52400, PeerRole::Target),
            from,
        );
        service.ingest_announcement(
            announcement("bbbb0002", [10, 0, 0, 12], 52400, PeerRole::Source),
            from,
        );
        assert!(service.find_partner().is_none());
    }

    #[test]
    fn test_app_peer_does_not_satisfy_find_partner() {
        let service = service(PeerRole::Source);
        service.ingest_app_peer(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 50)));
        let peers = service.peers();
        assert_eq!(peers.len(), 1);
        assert!(peers[0].has_app);
        assert!(!peers[0].has_toolkit);
        assert_eq!(peers[0].hostname.as_deref(), Some("10.0.0.50"));
        assert_eq!(peers[0].role, Some(PeerRole::Standalone));
        assert!(service.find_partner().is_none());
    }

    #[test]
    fn test_app_probe_refreshes_known_peer() {
        let service = service(PeerRole::Source);
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 50));
        service.ingest_app_peer(ip);
        service.ingest_app_peer(ip);
        assert_eq!(service.peers().len(), 1);
    }

    #[test]
    fn test_parse_probe_reply_headers() {
        let reply = "HTTP/1.0 200 OK\r\nName: Den Server\r\nPort: 32400\r\nResource-Identifier: abc123def\r\nUnknown: x\r\n";
        let parsed = parse_probe_reply(reply);
        assert_eq!(parsed.name.as_deref(), Some("Den Server"));
        assert_eq!(parsed.port, Some(32400));
        assert_eq!(parsed.identifier.as_deref(), Some("abc123def"));

        assert_eq!(parse_probe_reply("garbage"), ProbeReply::default());
        assert_eq!(parse_probe_reply("name: lower\r\nPORT: 99"), ProbeReply {
            name: Some("lower".to_string()),
            port: Some(99),
            identifier: None,
        });
    }

    #[test]
    fn test_probe_reply_fills_peer_details() {
        let service = service(PeerRole::Source);
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 60));
        service.ingest_app_reply(
            ip,
            "HTTP/1.0 200 OK\r\nName: Attic\r\nPort: 32400\r\nResource-Identifier: id-9\r\n",
        );
        let peers = service.peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].port, 32400);
        assert_eq!(peers[0].app_name.as_deref(), Some("Attic"));
        assert_eq!(peers[0].app_identifier.as_deref(), Some("id-9"));

        // A later reply without those headers must not erase them.
        service.ingest_app_reply(ip, "HTTP/1.0 200 OK\r\nPort: 32400\r\n");
        let peers = service.peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].app_name.as_deref(), Some("Attic"));
        assert_eq!(peers[0].app_identifier.as_deref(), Some("id-9"));
    }

    #[test]
    fn test_expired_peers_purged_with_event() {
        let mut config = ToolkitConfig::default();
        config.network.peer_ttl_secs = 0;
        let service = DiscoveryService::new(
            Arc::new(ToolkitContext::new(config)),
            PeerRole::Source,
        );
        let from = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 99));
        service.ingest_announcement(
            announcement("aaaa0001", [10, 0, 0, 11], 52400, PeerRole::Target),
            from,
        );
        let mut events = service.subscribe();

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(service.purge_expired(), 1);
        assert!(service.peers().is_empty());
        assert!(matches!(events.try_recv(), Ok(DiscoveryEvent::Lost(_))));
    }
}
