use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use tracing::warn;

/// DHCP option codes (RFC 2132)
pub const OPT_SUBNET_MASK: u8 = 1;
pub const OPT_ROUTER: u8 = 3;
pub const OPT_DNS_SERVERS: u8 = 6;
pub const OPT_REQUESTED_IP: u8 = 50;
pub const OPT_LEASE_TIME: u8 = 51;
pub const OPT_MSG_TYPE: u8 = 53;
pub const OPT_SERVER_ID: u8 = 54;
pub const OPT_END: u8 = 255;
pub const OPT_PAD: u8 = 0;

/// DHCP message types
pub const DHCPDISCOVER: u8 = 1;
pub const DHCPOFFER: u8 = 2;
pub const DHCPREQUEST: u8 = 3;
pub const DHCPACK: u8 = 5;
pub const DHCPNAK: u8 = 6;

/// A single option as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpOption {
    pub code: u8,
    pub data: Vec<u8>,
}

impl DhcpOption {
    pub fn new(code: u8, data: Vec<u8>) -> Self {
        Self { code, data }
    }

    pub fn msg_type(t: u8) -> Self {
        Self::new(OPT_MSG_TYPE, vec![t])
    }

    pub fn subnet_mask(mask: Ipv4Addr) -> Self {
        Self::new(OPT_SUBNET_MASK, mask.octets().to_vec())
    }

    pub fn lease_time(secs: u32) -> Self {
        Self::new(OPT_LEASE_TIME, secs.to_be_bytes().to_vec())
    }

    pub fn router(ip: Ipv4Addr) -> Self {
        Self::new(OPT_ROUTER, ip.octets().to_vec())
    }

    /// DNS server list, all entries in a single option in order.
    pub fn dns_servers(servers: &[Ipv4Addr]) -> Self {
        let mut data = Vec::with_capacity(servers.len() * 4);
        for ip in servers {
            data.extend_from_slice(&ip.octets());
        }
        Self::new(OPT_DNS_SERVERS, data)
    }

    pub fn server_id(ip: Ipv4Addr) -> Self {
        Self::new(OPT_SERVER_ID, ip.octets().to_vec())
    }

    /// Extract a u8 from the option data
    pub fn as_u8(&self) -> Option<u8> {
        self.data.first().copied()
    }

    /// Extract a big-endian u32 from the option data
    pub fn as_u32(&self) -> Option<u32> {
        if self.data.len() == 4 {
            Some(u32::from_be_bytes([
                self.data[0],
                self.data[1],
                self.data[2],
                self.data[3],
            ]))
        } else {
            None
        }
    }

    /// Extract an IPv4 address from the option data
    pub fn as_ipv4(&self) -> Option<Ipv4Addr> {
        if self.data.len() == 4 {
            Some(Ipv4Addr::new(
                self.data[0],
                self.data[1],
                self.data[2],
                self.data[3],
            ))
        } else {
            None
        }
    }

    /// Extract a list of IPv4 addresses (option data is 4-byte groups)
    pub fn as_ipv4_list(&self) -> Vec<Ipv4Addr> {
        self.data
            .chunks_exact(4)
            .map(|c| Ipv4Addr::new(c[0], c[1], c[2], c[3]))
            .collect()
    }
}

/// An operator-configured option copied through to replies.
///
/// The store carries these as `{"code", "type", "value"}`; the only
/// required value type is `"string"`, encoded as the raw UTF-8 bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtraOption {
    pub code: u8,
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

impl ExtraOption {
    /// Encode to wire form, or None (logged) for an unknown value type.
    pub fn encode(&self) -> Option<DhcpOption> {
        match self.kind.as_str() {
            "string" => Some(DhcpOption::new(self.code, self.value.as_bytes().to_vec())),
            other => {
                warn!("unknown option value type {:?} for option {}", other, self.code);
                None
            }
        }
    }
}

/// Parse the option region of a message (everything after the magic
/// cookie). PAD bytes are skipped, END terminates the scan, and an
/// option whose declared length runs past the buffer is dropped along
/// with the rest of the tail.
pub fn parse_options(mut data: &[u8]) -> Vec<DhcpOption> {
    let mut options = Vec::new();

    while let Some((&code, after_code)) = data.split_first() {
        if code == OPT_END {
            break;
        }
        if code == OPT_PAD {
            data = after_code;
            continue;
        }

        let Some((&len, after_len)) = after_code.split_first() else {
            break;
        };
        if after_len.len() < len as usize {
            break;
        }
        let (value, rest) = after_len.split_at(len as usize);
        options.push(DhcpOption::new(code, value.to_vec()));
        data = rest;
    }

    options
}

/// Encode DHCP options as a TLV run terminated with END.
pub fn encode_options(options: &[DhcpOption]) -> Vec<u8> {
    let encoded_len: usize = options.iter().map(|opt| 2 + opt.data.len()).sum();
    let mut buf = Vec::with_capacity(encoded_len + 1);

    for opt in options {
        buf.push(opt.code);
        buf.push(opt.data.len() as u8);
        buf.extend_from_slice(&opt.data);
    }

    buf.push(OPT_END);
    buf
}
