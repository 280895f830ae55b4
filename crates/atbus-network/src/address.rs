use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use crate::NetError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// In-process memory ring, host is the region base in hex.
    Mem,
    /// Shared-memory ring, host is the decimal segment key.
    Shm,
    /// Unix pipe, host is the socket path.
    Unix,
    Ipv4,
    Ipv6,
    /// Hostname, resolved to ipv4/ipv6 before use.
    Dns,
}

/// Parsed form of `scheme://host[:port]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelAddress {
    /// The original string.
    pub address: String,
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

/// Parse an address string into its tagged record.
pub fn make_address(input: &str) -> Result<ChannelAddress, NetError> {
    let (scheme_str, rest) = input.split_once("://").ok_or(NetError::Scheme)?;
    if rest.is_empty() {
        return Err(NetError::Scheme);
    }

    let scheme = match scheme_str.to_ascii_lowercase().as_str() {
        "mem" => Scheme::Mem,
        "shm" => Scheme::Shm,
        "unix" => Scheme::Unix,
        "ipv4" => Scheme::Ipv4,
        "ipv6" => Scheme::Ipv6,
        "dns" => Scheme::Dns,
        _ => return Err(NetError::Scheme),
    };

    let (host, port) = match scheme {
        Scheme::Ipv4 | Scheme::Ipv6 | Scheme::Dns => {
            // the host part of an ipv6 literal contains colons itself,
            // the port is always after the last one
            let (host, port_str) = rest.rsplit_once(':').ok_or(NetError::Scheme)?;
            let port: u16 = port_str.parse().map_err(|_| NetError::Scheme)?;
            if host.is_empty() || port == 0 {
                return Err(NetError::Scheme);
            }
            (host.to_owned(), port)
        }
        Scheme::Mem | Scheme::Shm | Scheme::Unix => (rest.to_owned(), 0),
    };

    let addr = ChannelAddress { address: input.to_owned(), scheme, host, port };

    // fail scheme-specific host grammar early
    match scheme {
        Scheme::Mem => {
            addr.mem_base()?;
        }
        Scheme::Shm => {
            addr.shm_key()?;
        }
        Scheme::Ipv4 | Scheme::Ipv6 => {
            addr.socket_addr()?;
        }
        Scheme::Unix | Scheme::Dns => {}
    }

    Ok(addr)
}

/// Resolve a `dns://` address to a concrete `ipv4://`/`ipv6://` record.
/// Non-dns addresses pass through unchanged.
pub fn resolve(addr: &ChannelAddress) -> Result<ChannelAddress, NetError> {
    if addr.scheme != Scheme::Dns {
        return Ok(addr.clone());
    }

    let mut candidates = (addr.host.as_str(), addr.port)
        .to_socket_addrs()
        .map_err(|_| NetError::DnsGetAddrFailed)?;
    let resolved = candidates.next().ok_or(NetError::DnsGetAddrFailed)?;

    let scheme = match resolved.ip() {
        IpAddr::V4(_) => "ipv4",
        IpAddr::V6(_) => "ipv6",
    };
    make_address(&format!("{scheme}://{}:{}", resolved.ip(), resolved.port()))
}

impl ChannelAddress {
    /// Region base address of a `mem://` channel.
    pub fn mem_base(&self) -> Result<usize, NetError> {
        if self.scheme != Scheme::Mem {
            return Err(NetError::Params);
        }
        let digits = self.host.strip_prefix("0x").unwrap_or(&self.host);
        usize::from_str_radix(digits, 16).map_err(|_| NetError::Scheme)
    }

    /// Segment key of a `shm://` channel.
    pub fn shm_key(&self) -> Result<u64, NetError> {
        if self.scheme != Scheme::Shm {
            return Err(NetError::Params);
        }
        self.host.parse().map_err(|_| NetError::Scheme)
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, NetError> {
        let ip: IpAddr = self.host.parse().map_err(|_| NetError::Scheme)?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn from_socket(addr: SocketAddr) -> Self {
        let scheme = if addr.is_ipv4() { "ipv4" } else { "ipv6" };
        Self {
            address: format!("{scheme}://{}:{}", addr.ip(), addr.port()),
            scheme: if addr.is_ipv4() { Scheme::Ipv4 } else { Scheme::Ipv6 },
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }

    pub fn from_pipe(path: &str) -> Self {
        Self {
            address: format!("unix://{path}"),
            scheme: Scheme::Unix,
            host: path.to_owned(),
            port: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_network_schemes() {
        let a = make_address("ipv4://127.0.0.1:16387").unwrap();
        assert_eq!(a.scheme, Scheme::Ipv4);
        assert_eq!(a.host, "127.0.0.1");
        assert_eq!(a.port, 16387);
        assert_eq!(a.address, "ipv4://127.0.0.1:16387");

        let a = make_address("IPV6://::1:16388").unwrap();
        assert_eq!(a.scheme, Scheme::Ipv6);
        assert_eq!(a.host, "::1");
        assert_eq!(a.port, 16388);

        let a = make_address("dns://localhost:8080").unwrap();
        assert_eq!(a.scheme, Scheme::Dns);
        assert_eq!(a.host, "localhost");
    }

    #[test]
    fn parses_local_schemes() {
        let a = make_address("unix:///tmp/atbus.sock").unwrap();
        assert_eq!(a.scheme, Scheme::Unix);
        assert_eq!(a.host, "/tmp/atbus.sock");
        assert_eq!(a.port, 0);

        let a = make_address("shm://16339").unwrap();
        assert_eq!(a.shm_key().unwrap(), 16339);

        let a = make_address("mem://0x7fff0000").unwrap();
        assert_eq!(a.mem_base().unwrap(), 0x7fff_0000);
        let a = make_address("mem://7fff0000").unwrap();
        assert_eq!(a.mem_base().unwrap(), 0x7fff_0000);
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(make_address("tcp://127.0.0.1:80").unwrap_err(), NetError::Scheme);
        assert_eq!(make_address("ipv4://127.0.0.1").unwrap_err(), NetError::Scheme);
        assert_eq!(make_address("ipv4://127.0.0.1:0").unwrap_err(), NetError::Scheme);
        assert_eq!(make_address("ipv4://not-an-ip:80").unwrap_err(), NetError::Scheme);
        assert_eq!(make_address("shm://xyz").unwrap_err(), NetError::Scheme);
        assert_eq!(make_address("mem://zz").unwrap_err(), NetError::Scheme);
        assert_eq!(make_address("no-scheme").unwrap_err(), NetError::Scheme);
        assert_eq!(make_address("ipv4://").unwrap_err(), NetError::Scheme);
    }

    #[test]
    fn resolves_localhost() {
        let a = make_address("dns://localhost:9000").unwrap();
        let r = resolve(&a).unwrap();
        assert!(matches!(r.scheme, Scheme::Ipv4 | Scheme::Ipv6));
        assert_eq!(r.port, 9000);
        // re-entry parses without the dns tag
        assert_ne!(r.address, a.address);
    }
}
