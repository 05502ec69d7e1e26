//! Reply delivery. Clients that do not have an address yet cannot be
//! reached by ordinary UDP, so replies to non-relayed requests are
//! framed as full Ethernet/IPv4/UDP packets and written to a raw
//! AF_PACKET socket on the listen interface. Relayed requests go back
//! to the relay as a plain datagram.

use std::ffi::CString;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use crate::packet::{DhcpPacket, CLIENT_PORT, SERVER_PORT};
use crate::server::Listen;

/// Delivery seam between the listener and the network, swappable for a
/// recording double in tests.
pub trait Responder: Send + Sync {
    fn send(&self, resp: &DhcpPacket, req: &DhcpPacket, peer: SocketAddr) -> anyhow::Result<()>;
    fn close(&self);
}

pub type ResponderFactory =
    Box<dyn Fn(&Listen) -> anyhow::Result<Box<dyn Responder>> + Send + Sync>;

/// Factory producing the raw-socket responder.
pub fn default_factory() -> ResponderFactory {
    Box::new(|listen: &Listen| Ok(Box::new(SocketResponder::open(listen)?)))
}

/// One raw packet socket per listener, owned by that listener's task.
pub struct SocketResponder {
    fd: i32,
    ifindex: i32,
    if_mac: [u8; 6],
    ifname: String,
    closed: AtomicBool,
}

impl SocketResponder {
    pub fn open(listen: &Listen) -> anyhow::Result<Self> {
        let if_mac = mac_address::mac_address_by_name(&listen.interface)?
            .ok_or_else(|| anyhow::anyhow!("interface not found: {}", listen.interface))?
            .bytes();

        let name = CString::new(listen.interface.as_str())?;
        let ifindex = unsafe { libc::if_nametoindex(name.as_ptr()) };
        if ifindex == 0 {
            return Err(anyhow::anyhow!("interface not found: {}", listen.interface));
        }

        let fd = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW, 0) };
        if fd < 0 {
            return Err(
                anyhow::Error::from(io::Error::last_os_error()).context("cannot open raw socket")
            );
        }

        info!("broadcast responder on {} (ifindex {})", listen.interface, ifindex);

        Ok(Self {
            fd,
            ifindex: ifindex as i32,
            if_mac,
            ifname: listen.interface.clone(),
            closed: AtomicBool::new(false),
        })
    }

    fn send_broadcast(&self, resp: &DhcpPacket) -> anyhow::Result<()> {
        let frame = build_broadcast_frame(self.if_mac, resp);

        // The frame already names the destination, but the link-layer
        // address in the sockaddr carries the client MAC as well.
        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_ifindex = self.ifindex;
        addr.sll_halen = 6;
        addr.sll_addr[..6].copy_from_slice(&resp.chaddr[..6]);

        debug!(
            "{} -> {} {} ({} bytes)",
            self.ifname,
            resp.mac_str(),
            resp.yiaddr,
            frame.len()
        );

        let rc = unsafe {
            libc::sendto(
                self.fd,
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
                0,
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(anyhow::Error::from(io::Error::last_os_error())
                .context("raw send failed"));
        }
        Ok(())
    }

    fn send_unicast(&self, resp: &DhcpPacket, peer: SocketAddr) -> anyhow::Result<()> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.send_to(&resp.to_bytes(), peer)?;
        Ok(())
    }
}

impl Responder for SocketResponder {
    fn send(&self, resp: &DhcpPacket, req: &DhcpPacket, peer: SocketAddr) -> anyhow::Result<()> {
        if req.giaddr.is_unspecified() {
            self.send_broadcast(resp)
        } else {
            self.send_unicast(resp, peer)
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let rc = unsafe { libc::close(self.fd) };
        if rc != 0 {
            warn!(
                "error closing raw socket on {}: {}",
                self.ifname,
                io::Error::last_os_error()
            );
        }
    }
}

impl Drop for SocketResponder {
    fn drop(&mut self) {
        Responder::close(self);
    }
}

/// Assemble the full L2 frame for a reply: Ethernet II, IPv4 with
/// Don't-Fragment and header checksum, UDP 67→68 with pseudo-header
/// checksum, then the DHCP payload.
pub fn build_broadcast_frame(src_mac: [u8; 6], resp: &DhcpPacket) -> Vec<u8> {
    let payload = resp.to_bytes();
    let ip_total = 20 + 8 + payload.len();
    let udp_len = 8 + payload.len();
    let mut buf = Vec::with_capacity(14 + ip_total);

    // Ethernet II
    buf.extend_from_slice(&resp.chaddr[..6]); // dst: client hardware address
    buf.extend_from_slice(&src_mac);
    buf.extend_from_slice(&0x0800u16.to_be_bytes()); // ethertype: IPv4

    // IPv4 header
    buf.push(0x45); // version 4, IHL 5
    buf.push(0); // DSCP/ECN
    buf.extend_from_slice(&(ip_total as u16).to_be_bytes());
    buf.extend_from_slice(&[0, 0]); // identification
    buf.extend_from_slice(&0x4000u16.to_be_bytes()); // flags: Don't Fragment
    buf.push(64); // TTL
    buf.push(17); // protocol: UDP
    buf.extend_from_slice(&[0, 0]); // header checksum, filled below
    buf.extend_from_slice(&resp.siaddr.octets());
    buf.extend_from_slice(&resp.yiaddr.octets());
    let ip_csum = checksum(&buf[14..34]);
    buf[24..26].copy_from_slice(&ip_csum.to_be_bytes());

    // UDP header
    buf.extend_from_slice(&SERVER_PORT.to_be_bytes());
    buf.extend_from_slice(&CLIENT_PORT.to_be_bytes());
    buf.extend_from_slice(&(udp_len as u16).to_be_bytes());
    buf.extend_from_slice(&[0, 0]); // checksum, filled below

    buf.extend_from_slice(&payload);

    let udp_csum = udp_checksum(resp.siaddr, resp.yiaddr, &buf[34..]);
    buf[40..42].copy_from_slice(&udp_csum.to_be_bytes());

    buf
}

/// RFC 1071 internet checksum.
fn checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    for chunk in data.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]])
        } else {
            u16::from_be_bytes([chunk[0], 0])
        };
        sum += word as u32;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// UDP checksum over the IPv4 pseudo-header and the segment. A computed
/// zero is transmitted as all-ones (RFC 768).
fn udp_checksum(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> u16 {
    let mut data = Vec::with_capacity(12 + segment.len());
    data.extend_from_slice(&src.octets());
    data.extend_from_slice(&dst.octets());
    data.push(0);
    data.push(17); // protocol: UDP
    data.extend_from_slice(&(segment.len() as u16).to_be_bytes());
    data.extend_from_slice(segment);

    match checksum(&data) {
        0 => 0xffff,
        sum => sum,
    }
}
