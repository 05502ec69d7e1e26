//! One listener per configured listen endpoint: receives DHCP requests
//! on port 67, demultiplexes the message type, asks the server for a
//! reply and hands it to the responder.

use std::net::{Ipv4Addr, SocketAddr};
use anyhow::Result;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::options::{DhcpOption, DHCPACK, DHCPDISCOVER, DHCPOFFER, DHCPREQUEST};
use crate::packet::{DhcpPacket, SERVER_PORT};
use crate::responder::Responder;
use crate::server::{Listen, ReplyHook};

/// Bind the inbound server socket for a listen endpoint: port 67 with
/// SO_BROADCAST, tied to the endpoint's interface.
pub fn bind_socket(listen: &Listen) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, SERVER_PORT));
    socket.bind(&addr.into())?;

    #[cfg(target_os = "linux")]
    if !listen.interface.is_empty() {
        socket.bind_device(Some(listen.interface.as_bytes()))?;
        info!("listener bound to interface {}", listen.interface);
    }

    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket.into())?)
}

pub struct Listener {
    listen: Listen,
    socket: UdpSocket,
    hook: ReplyHook,
    responder: Box<dyn Responder>,
}

impl Listener {
    pub fn new(
        listen: Listen,
        socket: UdpSocket,
        hook: ReplyHook,
        responder: Box<dyn Responder>,
    ) -> Self {
        Self {
            listen,
            socket,
            hook,
            responder,
        }
    }

    /// Receive loop. Blocks until the socket fails or shutdown is
    /// signalled; the responder is closed on the way out.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut buf = [0u8; 1500];

        let result = loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, peer)) => self.handle_datagram(&buf[..len], peer),
                    Err(e) => break Err(anyhow::Error::from(e)),
                },
                _ = shutdown.changed() => {
                    info!("listener {} shutting down", self.listen);
                    break Ok(());
                }
            }
        };

        self.responder.close();
        result
    }

    /// Handle one inbound datagram. Anything that is not a well-formed
    /// DISCOVER or REQUEST is logged and dropped; the client retries on
    /// its own schedule.
    pub(crate) fn handle_datagram(&self, data: &[u8], peer: SocketAddr) {
        let req = match DhcpPacket::parse(data) {
            Ok(p) => p,
            Err(e) => {
                debug!("invalid dhcp packet from {}: {}", peer, e);
                return;
            }
        };

        // BOOTREQUEST only
        if req.op != 1 {
            return;
        }

        let reply_type = match req.msg_type() {
            Some(DHCPDISCOVER) => DHCPOFFER,
            Some(DHCPREQUEST) => DHCPACK,
            other => {
                debug!("ignoring dhcp message type {:?} from {}", other, req.mac_str());
                return;
            }
        };

        debug!(
            "{} <- {} ({}) type {}",
            self.listen.laddr,
            req.mac_str(),
            peer,
            req.msg_type().unwrap_or_default()
        );

        let mut resp = match (self.hook)(&req, &self.listen) {
            Ok(resp) => resp,
            Err(e) => {
                warn!("dropping request from {}: {}", req.mac_str(), e);
                return;
            }
        };

        resp.update_option(DhcpOption::msg_type(reply_type));
        resp.siaddr = self.listen.laddr.into();

        if let Err(e) = self.responder.send(&resp, &req, peer) {
            warn!("failed to send dhcp response to {}: {:#}", req.mac_str(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::OPT_SERVER_ID;
    use crate::packet::MAGIC_COOKIE;
    use crate::responder::testing::RecordingResponder;
    use std::sync::Arc;

    fn request_bytes(msg_type: u8, mac: [u8; 6]) -> Vec<u8> {
        let mut pkt = vec![0u8; 300];
        pkt[0] = 1; // BOOTREQUEST
        pkt[1] = 1;
        pkt[2] = 6;
        pkt[4..8].copy_from_slice(&0xaabb0011u32.to_be_bytes());
        pkt[28..34].copy_from_slice(&mac);
        pkt[236..240].copy_from_slice(&MAGIC_COOKIE);
        pkt[240] = 53;
        pkt[241] = 1;
        pkt[242] = msg_type;
        pkt[243] = 255;
        pkt
    }

    fn test_listen() -> Listen {
        Listen {
            interface: String::new(),
            subnet: "10.1.1.0/24".to_string(),
            laddr: "10.1.1.1".parse().unwrap(),
        }
    }

    async fn test_listener(hook: ReplyHook) -> (Listener, RecordingResponder) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let responder = RecordingResponder::default();
        let listener = Listener::new(
            test_listen(),
            socket,
            hook,
            Box::new(responder.clone()),
        );
        (listener, responder)
    }

    fn echo_hook() -> ReplyHook {
        Arc::new(|req: &DhcpPacket, _listen: &Listen| Ok(DhcpPacket::reply_to(req)))
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:68".parse().unwrap()
    }

    #[tokio::test]
    async fn test_discover_is_answered_with_offer() {
        let (listener, responder) = test_listener(echo_hook()).await;

        listener.handle_datagram(&request_bytes(DHCPDISCOVER, [1, 2, 3, 4, 5, 6]), peer());

        let calls = responder.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].resp.msg_type(), Some(DHCPOFFER));
        assert_eq!(calls[0].resp.siaddr, Ipv4Addr::new(10, 1, 1, 1));
        assert_eq!(calls[0].req.mac_str(), "01:02:03:04:05:06");
        assert_eq!(calls[0].peer, peer());
    }

    #[tokio::test]
    async fn test_request_is_answered_with_ack() {
        let (listener, responder) = test_listener(echo_hook()).await;

        listener.handle_datagram(&request_bytes(DHCPREQUEST, [1, 2, 3, 4, 5, 6]), peer());

        let calls = responder.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].resp.msg_type(), Some(DHCPACK));
    }

    #[tokio::test]
    async fn test_unknown_message_types_are_dropped() {
        let (listener, responder) = test_listener(echo_hook()).await;

        // DHCPRELEASE (7) and an unknown type
        listener.handle_datagram(&request_bytes(7, [1, 2, 3, 4, 5, 6]), peer());
        listener.handle_datagram(&request_bytes(42, [1, 2, 3, 4, 5, 6]), peer());

        assert!(responder.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_and_reply_packets_are_dropped() {
        let (listener, responder) = test_listener(echo_hook()).await;

        listener.handle_datagram(&[0u8; 12], peer());

        let mut reply = request_bytes(DHCPDISCOVER, [1, 2, 3, 4, 5, 6]);
        reply[0] = 2; // BOOTREPLY
        listener.handle_datagram(&reply, peer());

        assert!(responder.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hook_error_drops_request() {
        let hook: ReplyHook = Arc::new(|_req: &DhcpPacket, _listen: &Listen| {
            Err(crate::server::DhcpError::NoLease {
                mac: "01:02:03:04:05:06".to_string(),
            })
        });
        let (listener, responder) = test_listener(hook).await;

        listener.handle_datagram(&request_bytes(DHCPDISCOVER, [1, 2, 3, 4, 5, 6]), peer());

        assert!(responder.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hook_reply_keeps_its_server_id_option() {
        // the listener stamps type and siaddr but leaves the option set alone
        let hook: ReplyHook = Arc::new(|req: &DhcpPacket, listen: &Listen| {
            let mut resp = DhcpPacket::reply_to(req);
            resp.update_option(DhcpOption::server_id(listen.laddr.into()));
            Ok(resp)
        });
        let (listener, responder) = test_listener(hook).await;

        listener.handle_datagram(&request_bytes(DHCPDISCOVER, [1, 2, 3, 4, 5, 6]), peer());

        let calls = responder.calls.lock().unwrap();
        let server_id = calls[0].resp.get_option(OPT_SERVER_ID).unwrap();
        assert_eq!(server_id.as_ipv4(), Some(Ipv4Addr::new(10, 1, 1, 1)));
    }

    #[tokio::test]
    async fn test_serve_exits_on_shutdown_and_closes_responder() {
        let (listener, responder) = test_listener(echo_hook()).await;
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(listener.serve(rx));
        tx.send(true).unwrap();

        task.await.unwrap().unwrap();
        assert!(*responder.closed.lock().unwrap());
    }
}
