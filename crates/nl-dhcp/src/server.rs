//! Server registry: owns the configured subnets and the running
//! listeners, routes each request to a subnet, and composes the reply
//! option set from the resolved lease.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::ipv4::Ipv4;
use crate::listener::{self, Listener};
use crate::options::{DhcpOption, DHCPREQUEST};
use crate::packet::DhcpPacket;
use crate::responder::ResponderFactory;
use crate::subnet::{Lease, Subnet, SubnetConfig};

/// Listen endpoint record as carried by the config store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listen {
    /// Interface to bind; also carries the raw socket for broadcasts.
    #[serde(default)]
    pub interface: String,
    /// Subnet key this endpoint serves directly (non-relayed traffic).
    pub subnet: String,
    /// Address used as siaddr and server identifier in replies.
    pub laddr: Ipv4,
}

impl fmt::Display for Listen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[if:{:?} subnet:{:?} laddr:{}]",
            self.interface, self.subnet, self.laddr
        )
    }
}

#[derive(Error, Debug)]
pub enum DhcpError {
    #[error("no lease available for {mac}")]
    NoLease { mac: String },
    #[error("no subnet for request (giaddr {giaddr})")]
    NoSubnet { giaddr: Ipv4 },
    #[error("no subnet contains lease {ip}")]
    LeaseWithoutSubnet { ip: Ipv4 },
}

/// Builder hook handed to each listener: request + endpoint in, reply
/// out (message type and siaddr still unset).
pub type ReplyHook =
    Arc<dyn Fn(&DhcpPacket, &Listen) -> Result<DhcpPacket, DhcpError> + Send + Sync>;

/// Outbound persistence hook invoked for every committed lease.
pub type LeaseSink = Box<dyn Fn(&Lease) + Send + Sync>;

/// The shape of the server the external config watcher drives.
pub trait ConfigHandler: Send + Sync {
    fn handle_subnet(&self, cfg: SubnetConfig) -> anyhow::Result<()>;
    fn handle_listen(&self, listen: Listen) -> anyhow::Result<()>;
    fn handle_lease(&self, lease: Lease) -> anyhow::Result<()>;
}

pub struct ServerConfig {
    pub responder_factory: ResponderFactory,
    pub lease_sink: Option<LeaseSink>,
}

impl ServerConfig {
    /// Raw-socket responders plus the given persistence hook.
    pub fn new(lease_sink: Option<LeaseSink>) -> Self {
        Self {
            responder_factory: crate::responder::default_factory(),
            lease_sink,
        }
    }
}

/// Subnet registry shared between the config handlers and every
/// listener task.
struct Registry {
    subnets: RwLock<HashMap<String, Arc<Subnet>>>,
    lease_sink: Option<LeaseSink>,
}

impl Registry {
    /// Route a request: the endpoint's own subnet when registered,
    /// otherwise the first subnet containing the relay's giaddr.
    fn route(&self, req: &DhcpPacket, listen: &Listen) -> Option<Arc<Subnet>> {
        let subnets = self.subnets.read().unwrap();
        if let Some(subnet) = subnets.get(&listen.subnet) {
            return Some(Arc::clone(subnet));
        }
        let giaddr = Ipv4::from(req.giaddr);
        subnets.values().find(|s| s.contains(giaddr)).cloned()
    }

    fn build_reply(&self, req: &DhcpPacket, listen: &Listen) -> Result<DhcpPacket, DhcpError> {
        let subnet = self.route(req, listen).ok_or(DhcpError::NoSubnet {
            giaddr: req.giaddr.into(),
        })?;

        let mac = req.mac_str();
        let lease = subnet
            .lease_for_mac(&mac)
            .ok_or(DhcpError::NoLease { mac })?;
        debug!("lease {} for {} in {}", lease.ip, lease.mac, subnet.cidr());

        let mut resp = DhcpPacket::reply_to(req);
        resp.yiaddr = lease.ip.into();
        resp.giaddr = lease.gateway.into();

        resp.update_option(DhcpOption::subnet_mask(lease.net_mask.into()));
        resp.update_option(DhcpOption::lease_time(lease.lease_time as u32));
        resp.update_option(DhcpOption::router(lease.gateway.into()));
        let dns: Vec<std::net::Ipv4Addr> = lease.dns.iter().map(|&ip| ip.into()).collect();
        resp.update_option(DhcpOption::dns_servers(&dns));
        resp.update_option(DhcpOption::server_id(listen.laddr.into()));
        for extra in &lease.options {
            if let Some(opt) = extra.encode() {
                resp.update_option(opt);
            }
        }

        // A REQUEST turns into an ACK: commit the binding before the
        // reply leaves.
        if req.msg_type() == Some(DHCPREQUEST) {
            self.write_through(&lease)?;
            if let Some(sink) = &self.lease_sink {
                sink(&lease);
            }
        }

        Ok(resp)
    }

    fn write_through(&self, lease: &Lease) -> Result<(), DhcpError> {
        let subnets = self.subnets.read().unwrap();
        let subnet = subnets
            .values()
            .find(|s| s.contains(lease.ip))
            .ok_or(DhcpError::LeaseWithoutSubnet { ip: lease.ip })?;
        subnet.commit(lease.clone());
        Ok(())
    }
}

struct ListenerHandle {
    listen: Listen,
    shutdown: watch::Sender<bool>,
}

pub struct Server {
    registry: Arc<Registry>,
    listeners: Mutex<Vec<ListenerHandle>>,
    responder_factory: ResponderFactory,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            registry: Arc::new(Registry {
                subnets: RwLock::new(HashMap::new()),
                lease_sink: config.lease_sink,
            }),
            listeners: Mutex::new(Vec::new()),
            responder_factory: config.responder_factory,
        }
    }

    /// The builder hook, exposed for driving the engine without a
    /// socket (and for the listeners themselves).
    pub fn build_reply(&self, req: &DhcpPacket, listen: &Listen) -> Result<DhcpPacket, DhcpError> {
        self.registry.build_reply(req, listen)
    }

    /// Signal the first listener serving the given subnet to stop.
    pub fn stop_listen(&self, cidr: &str) {
        let listeners = self.listeners.lock().unwrap();
        for handle in listeners.iter() {
            if handle.listen.subnet == cidr {
                let _ = handle.shutdown.send(true);
                return;
            }
        }
        warn!("listener for subnet {:?} not found", cidr);
    }

    /// Signal every listener to stop; their receive loops unblock and
    /// close their responders.
    pub fn close(&self) {
        for handle in self.listeners.lock().unwrap().iter() {
            let _ = handle.shutdown.send(true);
        }
    }
}

impl ConfigHandler for Server {
    /// (Re)initialize a subnet. Replacement drops the old lease table.
    fn handle_subnet(&self, cfg: SubnetConfig) -> anyhow::Result<()> {
        let subnet = Subnet::new(cfg)?;
        info!("serving subnet {} (gateway {})", subnet.cidr(), subnet.gateway());
        self.registry
            .subnets
            .write()
            .unwrap()
            .insert(subnet.cidr().to_string(), Arc::new(subnet));
        Ok(())
    }

    /// Start a listener for an endpoint, replacing a previous listener
    /// for the same subnet key. The task's termination is logged but
    /// does not take the process down.
    fn handle_listen(&self, listen: Listen) -> anyhow::Result<()> {
        {
            let mut listeners = self.listeners.lock().unwrap();
            if let Some(pos) = listeners
                .iter()
                .position(|h| h.listen.subnet == listen.subnet)
            {
                let old = listeners.remove(pos);
                info!("replacing listener {}", old.listen);
                let _ = old.shutdown.send(true);
            }
        }

        let responder = (self.responder_factory)(&listen)?;
        let socket = listener::bind_socket(&listen)?;

        let registry = Arc::clone(&self.registry);
        let hook: ReplyHook =
            Arc::new(move |req: &DhcpPacket, l: &Listen| registry.build_reply(req, l));
        let server = Listener::new(listen.clone(), socket, hook, responder);

        let (shutdown, rx) = watch::channel(false);
        info!("starting listener {}", listen);
        let tag = listen.clone();
        tokio::spawn(async move {
            match server.serve(rx).await {
                Ok(()) => info!("listener {} exited", tag),
                Err(e) => error!("listener {} failed: {:#}", tag, e),
            }
        });

        self.listeners
            .lock()
            .unwrap()
            .push(ListenerHandle { listen, shutdown });
        Ok(())
    }

    /// Write a committed lease through into whichever subnet contains
    /// it; the watcher uses this to replay store-persisted leases.
    fn handle_lease(&self, lease: Lease) -> anyhow::Result<()> {
        self.registry.write_through(&lease)?;
        Ok(())
    }
}
