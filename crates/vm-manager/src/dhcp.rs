//! Embedded DHCPv4 responder (spec.md §4.4). No crate in reach implements
//! BOOTP/DHCP framing, so the wire format is hand-rolled here; the lease
//! table and socket plumbing follow the rest of the crate's patterns
//! (`dashmap` for concurrent state, `socket2` for broadcast/reuseaddr).

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use ipnetwork::Ipv4Network;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Result, VmError};
use crate::network::first_host_address;
use crate::types::{IpUpdate, Lease};

const SERVER_PORT: u16 = 67;
const CLIENT_PORT: u16 = 68;
const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

const OP_BOOTREQUEST: u8 = 1;
const OP_BOOTREPLY: u8 = 2;
const HTYPE_ETHER: u8 = 1;

const OPT_PAD: u8 = 0;
const OPT_REQUESTED_IP: u8 = 50;
const OPT_LEASE_TIME: u8 = 51;
const OPT_MSG_TYPE: u8 = 53;
const OPT_SERVER_ID: u8 = 54;
const OPT_SUBNET_MASK: u8 = 1;
const OPT_ROUTER: u8 = 3;
const OPT_DNS: u8 = 6;
const OPT_END: u8 = 255;

const DHCPDISCOVER: u8 = 1;
const DHCPOFFER: u8 = 2;
const DHCPREQUEST: u8 = 3;
const DHCPACK: u8 = 5;

const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Concurrent MAC → lease table. Allocation is deterministic: the same MAC
/// always gets the same address until its lease is reclaimed.
pub struct LeaseTable {
    leases: DashMap<String, Lease>,
    subnet: Ipv4Network,
    ttl: Duration,
}

impl LeaseTable {
    pub fn new(subnet: Ipv4Network, ttl: Duration) -> Self {
        Self {
            leases: DashMap::new(),
            subnet,
            ttl,
        }
    }

    pub fn with_default_ttl(subnet: Ipv4Network) -> Self {
        Self::new(subnet, DEFAULT_LEASE_TTL)
    }

    /// Assign the lowest free address in `[start, gateway)` to `mac`. Renewals
    /// from an already-leased, non-expired MAC return the same address.
    /// Expired leases are reclaimed lazily here, at allocation time.
    pub fn allocate(&self, mac: &str) -> Result<Ipv4Addr> {
        let now = SystemTime::now();
        if let Some(existing) = self.leases.get(mac) {
            if existing.expiry > now {
                return Ok(existing.ip);
            }
        }

        let start = u32::from(first_host_address(self.subnet));
        let gateway = u32::from(self.subnet.broadcast()) - 1;

        let in_use: std::collections::HashSet<Ipv4Addr> = self
            .leases
            .iter()
            .filter(|e| e.value().expiry > now)
            .map(|e| e.value().ip)
            .collect();

        for candidate in start..gateway {
            let ip = Ipv4Addr::from(candidate);
            if !in_use.contains(&ip) {
                self.leases.insert(
                    mac.to_string(),
                    Lease {
                        ip,
                        expiry: now + self.ttl,
                    },
                );
                return Ok(ip);
            }
        }

        Err(VmError::Upstream(format!(
            "no free addresses in {}",
            self.subnet
        )))
    }

    pub fn lookup(&self, mac: &str) -> Option<Ipv4Addr> {
        self.leases.get(mac).map(|l| l.ip)
    }
}

/// A parsed, minimal BOOTP/DHCP packet: only the fields this responder needs.
#[derive(Debug, Clone)]
struct DhcpPacket {
    xid: [u8; 4],
    chaddr: [u8; 6],
    msg_type: u8,
}

fn parse_mac(chaddr: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        chaddr[0], chaddr[1], chaddr[2], chaddr[3], chaddr[4], chaddr[5]
    )
}

/// Parse a BOOTP frame, extracting xid, chaddr, and the DHCP message type
/// option. Returns `None` for malformed or non-DHCP (no magic cookie) frames.
fn parse_packet(buf: &[u8]) -> Option<DhcpPacket> {
    if buf.len() < 240 {
        return None;
    }
    if buf[0] != OP_BOOTREQUEST {
        return None;
    }
    if buf[1] != HTYPE_ETHER || buf[2] != 6 {
        return None;
    }
    if buf[236..240] != MAGIC_COOKIE {
        return None;
    }

    let mut xid = [0u8; 4];
    xid.copy_from_slice(&buf[4..8]);
    let mut chaddr = [0u8; 6];
    chaddr.copy_from_slice(&buf[28..34]);

    let mut msg_type = 0u8;
    let mut i = 240;
    while i < buf.len() {
        let opt = buf[i];
        if opt == OPT_END {
            break;
        }
        if opt == OPT_PAD {
            i += 1;
            continue;
        }
        if i + 1 >= buf.len() {
            break;
        }
        let len = buf[i + 1] as usize;
        let end = i + 2 + len;
        if end > buf.len() {
            break;
        }
        if opt == OPT_MSG_TYPE && len == 1 {
            msg_type = buf[i + 2];
        }
        i = end;
    }

    Some(DhcpPacket {
        xid,
        chaddr,
        msg_type,
    })
}

/// Build a DHCPOFFER/DHCPACK reply for `client` with the given options.
#[allow(clippy::too_many_arguments)]
fn build_reply(
    reply_type: u8,
    req: &DhcpPacket,
    client_ip: Ipv4Addr,
    server_ip: Ipv4Addr,
    gateway: Ipv4Addr,
    netmask: Ipv4Addr,
    name_servers: &[Ipv4Addr],
    lease_secs: u32,
) -> Vec<u8> {
    let mut pkt = vec![0u8; 240];
    pkt[0] = OP_BOOTREPLY;
    pkt[1] = HTYPE_ETHER;
    pkt[2] = 6;
    pkt[4..8].copy_from_slice(&req.xid);
    pkt[16..20].copy_from_slice(&client_ip.octets());
    pkt[20..24].copy_from_slice(&server_ip.octets());
    pkt[28..34].copy_from_slice(&req.chaddr);
    pkt[236..240].copy_from_slice(&MAGIC_COOKIE);

    pkt.push(OPT_MSG_TYPE);
    pkt.push(1);
    pkt.push(reply_type);

    pkt.push(OPT_SERVER_ID);
    pkt.push(4);
    pkt.extend_from_slice(&server_ip.octets());

    pkt.push(OPT_LEASE_TIME);
    pkt.push(4);
    pkt.extend_from_slice(&lease_secs.to_be_bytes());

    pkt.push(OPT_SUBNET_MASK);
    pkt.push(4);
    pkt.extend_from_slice(&netmask.octets());

    pkt.push(OPT_ROUTER);
    pkt.push(4);
    pkt.extend_from_slice(&gateway.octets());

    if !name_servers.is_empty() {
        pkt.push(OPT_DNS);
        pkt.push((name_servers.len() * 4) as u8);
        for ns in name_servers {
            pkt.extend_from_slice(&ns.octets());
        }
    }

    pkt.push(OPT_END);
    pkt
}

/// Run the DHCP responder loop, serving `socket` until the process exits.
/// Each successful ACK sends `{mac, ip}` on `updates`; backpressure from a
/// slow consumer stalls this loop, acceptable at this scale (spec.md §4.4).
pub async fn serve(
    socket: UdpSocket,
    leases: std::sync::Arc<LeaseTable>,
    gateway: Ipv4Addr,
    netmask: Ipv4Addr,
    name_servers: Vec<Ipv4Addr>,
    updates: mpsc::Sender<IpUpdate>,
) -> Result<()> {
    let mut buf = [0u8; 1500];
    loop {
        let (len, peer) = socket
            .recv_from(&mut buf)
            .await
            .map_err(|e| VmError::io("recv dhcp packet", e))?;

        let Some(packet) = parse_packet(&buf[..len]) else {
            continue;
        };

        let mac = parse_mac(&packet.chaddr);
        let (reply_type, ip) = match packet.msg_type {
            DHCPDISCOVER => {
                let ip = match leases.allocate(&mac) {
                    Ok(ip) => ip,
                    Err(e) => {
                        warn!(mac = %mac, error = %e, "dhcp allocation failed");
                        continue;
                    }
                };
                (DHCPOFFER, ip)
            }
            DHCPREQUEST => {
                let ip = match leases.allocate(&mac) {
                    Ok(ip) => ip,
                    Err(e) => {
                        warn!(mac = %mac, error = %e, "dhcp allocation failed");
                        continue;
                    }
                };
                (DHCPACK, ip)
            }
            _ => continue,
        };

        let reply = build_reply(
            reply_type,
            &packet,
            ip,
            gateway,
            gateway,
            netmask,
            &name_servers,
            DEFAULT_LEASE_TTL.as_secs() as u32,
        );

        let dest = broadcast_addr(peer);
        if let Err(e) = socket.send_to(&reply, dest).await {
            warn!(mac = %mac, error = %e, "failed to send dhcp reply");
            continue;
        }

        debug!(mac = %mac, ip = %ip, msg_type = packet.msg_type, "dhcp reply sent");

        if reply_type == DHCPACK {
            if updates.send(IpUpdate { mac, ip }).await.is_err() {
                warn!("ip-update channel closed; dhcp responder stopping");
                return Ok(());
            }
        }
    }
}

fn broadcast_addr(_peer: std::net::SocketAddr) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::BROADCAST, CLIENT_PORT)
}

/// Construct the UDP/67 listening socket with broadcast and reuseaddr set,
/// bound to the given interface-local address.
pub fn bind_socket(bind_addr: Ipv4Addr) -> Result<UdpSocket> {
    let socket =
        Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(|e| VmError::io("create dhcp socket", e))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| VmError::io("set SO_REUSEADDR", e))?;
    socket
        .set_broadcast(true)
        .map_err(|e| VmError::io("set SO_BROADCAST", e))?;
    let addr = SocketAddrV4::new(bind_addr, SERVER_PORT);
    socket
        .bind(&addr.into())
        .map_err(|e| VmError::io(format!("bind {addr}"), e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| VmError::io("set nonblocking", e))?;
    info!(addr = %addr, "dhcp responder listening");
    UdpSocket::from_std(socket.into()).map_err(|e| VmError::io("wrap dhcp socket", e))
}
