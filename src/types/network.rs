use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut};

use crate::error::{PgError, PgResult};

const PGSQL_AF_INET: u8 = 2;
const PGSQL_AF_INET6: u8 = 3;

/// Address plus prefix length, shared by `inet` and `cidr`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IpNet {
    pub addr: IpAddr,
    pub prefix: u8,
}

impl IpNet {
    fn max_prefix(addr: &IpAddr) -> u8 {
        match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        }
    }

    pub fn parse(input: &str, cidr: bool) -> PgResult<IpNet> {
        let type_name = if cidr { "cidr" } else { "inet" };
        let invalid = || PgError::invalid_text(type_name, input);
        let trimmed = input.trim();
        let (addr_part, prefix_part) = match trimmed.split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (trimmed, None),
        };
        let addr: IpAddr = addr_part.parse().map_err(|_| invalid())?;
        let max = Self::max_prefix(&addr);
        let prefix = match prefix_part {
            Some(p) => p.parse::<u8>().map_err(|_| invalid())?,
            None => max,
        };
        if prefix > max {
            return Err(invalid());
        }
        let net = IpNet { addr, prefix };
        if cidr && net.host_bits_set() {
            return Err(invalid().with_detail("Value has bits set to right of mask."));
        }
        Ok(net)
    }

    fn host_bits_set(&self) -> bool {
        let host_bits = Self::max_prefix(&self.addr) - self.prefix;
        if host_bits == 0 {
            return false;
        }
        match self.addr {
            IpAddr::V4(v4) => {
                let mask = if host_bits >= 32 { u32::MAX } else { (1u32 << host_bits) - 1 };
                u32::from(v4) & mask != 0
            }
            IpAddr::V6(v6) => {
                let mask = if host_bits >= 128 { u128::MAX } else { (1u128 << host_bits) - 1 };
                u128::from(v6) & mask != 0
            }
        }
    }

    /// `inet` output omits a full-length prefix; `cidr` always shows it.
    pub fn to_text(&self, cidr: bool) -> String {
        if !cidr && self.prefix == Self::max_prefix(&self.addr) {
            self.addr.to_string()
        } else {
            format!("{}/{}", self.addr, self.prefix)
        }
    }

    pub fn encode(&self, cidr: bool, buf: &mut impl BufMut) {
        match self.addr {
            IpAddr::V4(v4) => {
                buf.put_u8(PGSQL_AF_INET);
                buf.put_u8(self.prefix);
                buf.put_u8(cidr as u8);
                buf.put_u8(4);
                buf.put_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                buf.put_u8(PGSQL_AF_INET6);
                buf.put_u8(self.prefix);
                buf.put_u8(cidr as u8);
                buf.put_u8(16);
                buf.put_slice(&v6.octets());
            }
        }
    }

    pub fn decode(mut raw: &[u8], cidr: bool) -> PgResult<IpNet> {
        let type_name = if cidr { "cidr" } else { "inet" };
        if raw.len() < 4 {
            return Err(PgError::invalid_binary(type_name, "header too short"));
        }
        let family = raw.get_u8();
        let prefix = raw.get_u8();
        let _is_cidr = raw.get_u8();
        let len = raw.get_u8() as usize;
        if raw.len() != len {
            return Err(PgError::invalid_binary(type_name, "address length mismatch"));
        }
        let addr = match (family, len) {
            (PGSQL_AF_INET, 4) => IpAddr::V4(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3])),
            (PGSQL_AF_INET6, 16) => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(raw);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            _ => return Err(PgError::invalid_binary(type_name, "invalid address family")),
        };
        if prefix > Self::max_prefix(&addr) {
            return Err(PgError::invalid_binary(type_name, "invalid prefix length"));
        }
        Ok(IpNet { addr, prefix })
    }
}

fn parse_mac<const N: usize>(input: &str, type_name: &str) -> PgResult<[u8; N]> {
    let invalid = || PgError::invalid_text(type_name, input);
    let hex: String = input
        .trim()
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '.'))
        .collect();
    if hex.len() != N * 2 {
        return Err(invalid());
    }
    let mut out = [0u8; N];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).map_err(|_| invalid())?;
    }
    Ok(out)
}

fn format_mac(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub fn parse(input: &str) -> PgResult<MacAddr> {
        parse_mac::<6>(input, "macaddr").map(MacAddr)
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_mac(&self.0))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MacAddr8(pub [u8; 8]);

impl MacAddr8 {
    /// Accepts 8-byte input, or 6-byte input widened with `ff:fe` in the
    /// middle as PostgreSQL does.
    pub fn parse(input: &str) -> PgResult<MacAddr8> {
        if let Ok(bytes) = parse_mac::<8>(input, "macaddr8") {
            return Ok(MacAddr8(bytes));
        }
        let six = parse_mac::<6>(input, "macaddr8")?;
        Ok(MacAddr8([six[0], six[1], six[2], 0xff, 0xfe, six[3], six[4], six[5]]))
    }
}

impl fmt::Display for MacAddr8 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_mac(&self.0))
    }
}
