use std::fmt::{Display, Formatter};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Port used when a machine address doesn't specify one.
pub const DEFAULT_PORT: u16 = 2718;

/// Identity of a running server instance.
///
/// Machines are compared by value, so the same server reached through two
/// different host names counts as two different machines.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Machine {
    pub host: String,
    pub port: u16,
}

impl Machine {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }

    /// Machine on the loopback interface.
    pub fn local(port: u16) -> Self {
        Self::new("127.0.0.1", port)
    }

    /// Address string usable with `std::net` resolution.
    pub fn address(&self) -> String {
        self.to_string()
    }
}

impl From<std::net::SocketAddr> for Machine {
    fn from(addr: std::net::SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl FromStr for Machine {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidMachine(s.to_string()));
        }
        // bracketed ipv6, e.g. [::1]:2718
        if s.starts_with('[') {
            let end = s
                .find(']')
                .ok_or_else(|| Error::InvalidMachine(s.to_string()))?;
            let host = &s[1..end];
            let port = match s[end + 1..].strip_prefix(':') {
                Some(p) => p.parse()?,
                None => DEFAULT_PORT,
            };
            return Ok(Machine::new(host, port));
        }
        match s.rfind(':') {
            // more than one colon without brackets is a bare ipv6 address
            Some(idx) if s[..idx].contains(':') => Ok(Machine::new(s, DEFAULT_PORT)),
            Some(idx) => {
                let host = &s[..idx];
                if host.is_empty() {
                    return Err(Error::InvalidMachine(s.to_string()));
                }
                Ok(Machine::new(host, s[idx + 1..].parse()?))
            }
            None => Ok(Machine::new(s, DEFAULT_PORT)),
        }
    }
}

impl Display for Machine {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[test]
fn machine_parse_default_port() {
    let m: Machine = "node-1".parse().unwrap();
    assert_eq!(m, Machine::new("node-1", DEFAULT_PORT));
    let m: Machine = "10.0.0.2:9000".parse().unwrap();
    assert_eq!(m.port, 9000);
    assert_eq!(m.to_string(), "10.0.0.2:9000");
}

#[test]
fn machine_parse_ipv6() {
    let m: Machine = "[::1]:80".parse().unwrap();
    assert_eq!(m.host, "::1");
    assert_eq!(m.to_string(), "[::1]:80");
    let m: Machine = "::1".parse().unwrap();
    assert_eq!(m.port, DEFAULT_PORT);
    assert!(":80".parse::<Machine>().is_err());
    assert!("host:notaport".parse::<Machine>().is_err());
}
