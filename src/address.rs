use std::fmt::{Debug, Display, Formatter};
use std::net::SocketAddr;
use std::str::FromStr;

use rustc_hash::FxHashMap;

use crate::error::TransportError;

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Protocol {
    Tcp,
    Udp,
}
impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}
impl FromStr for Protocol {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            _ => Err(TransportError::InvalidAddress(s.to_string())),
        }
    }
}
impl Display for Protocol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The identity of a peer as seen by the transport. Messages are received *from* an endpoint,
///  and an endpoint's canonical string form can be passed back to `send` to reply.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct Endpoint {
    pub protocol: Protocol,
    pub address: String,
    pub port: u16,
}
impl Endpoint {
    pub fn new(protocol: Protocol, address: impl Into<String>, port: u16) -> Endpoint {
        Endpoint {
            protocol,
            address: address.into(),
            port,
        }
    }

    pub fn from_socket_addr(protocol: Protocol, addr: SocketAddr) -> Endpoint {
        Endpoint::new(protocol, addr.ip().to_string(), addr.port())
    }

    /// `host:port` without the scheme - this is the key for connection lookup
    pub fn host_port(&self) -> String {
        if self.address.contains(':') {
            format!("[{}]:{}", self.address, self.port)
        }
        else {
            format!("{}:{}", self.address, self.port)
        }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.protocol, self.host_port())
    }
}
impl Debug for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self)
    }
}

/// canonical external form of an endpoint, `<protocol>://<address>:<port>`
pub fn format_endpoint(endpoint: &Endpoint) -> String {
    endpoint.to_string()
}


/// An address string taken apart: `<scheme>://<host>:<port>[,key=value]*`
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ParsedAddress {
    pub transport: Protocol,
    pub host: String,
    pub port: u16,
    pub options: FxHashMap<String, String>,
}

impl ParsedAddress {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.transport, self.host.clone(), self.port)
    }

    /// An option without a value (`,bnd`) or with a value other than `0` / `false` counts as set
    pub fn flag(&self, key: &str) -> bool {
        match self.options.get(key) {
            None => false,
            Some(v) => !matches!(v.as_str(), "0" | "false" | "no"),
        }
    }

    pub fn numeric_option<T: FromStr>(&self, key: &str) -> Result<Option<T>, TransportError> {
        match self.options.get(key) {
            None => Ok(None),
            Some(v) => v.parse::<T>()
                .map(Some)
                .map_err(|_| TransportError::InvalidAddress(format!("option {}={} is not numeric", key, v))),
        }
    }
}

pub fn parse_address(s: &str, defaults: &[(&str, &str)]) -> Result<ParsedAddress, TransportError> {
    let invalid = || TransportError::InvalidAddress(s.to_string());

    let mut segments = s.split(',');
    let main = segments.next().unwrap_or_default();

    if main.matches(':').count() < 2 {
        return Err(invalid());
    }

    // the port is after the *last* colon so that bracketed IPV6 hosts survive
    let (scheme, rest) = main.split_once(':').ok_or_else(invalid)?;
    let (host, port) = rest.rsplit_once(':').ok_or_else(invalid)?;

    let host = host.strip_prefix("//").ok_or_else(invalid)?;
    let host = host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(invalid());
    }

    let port = port.parse::<u16>().map_err(|_| invalid())?;
    let transport = scheme.parse::<Protocol>().map_err(|_| invalid())?;

    let mut options = FxHashMap::default();
    for (k, v) in defaults {
        options.insert(k.to_string(), v.to_string());
    }
    for segment in segments {
        if segment.is_empty() {
            continue;
        }
        match segment.split_once('=') {
            Some((k, v)) => options.insert(k.trim().to_string(), v.trim().to_string()),
            None => options.insert(segment.trim().to_string(), String::new()),
        };
    }

    Ok(ParsedAddress {
        transport,
        host: host.to_string(),
        port,
        options,
    })
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::udp_localhost("udp://localhost:9999", Protocol::Udp, "localhost", 9999)]
    #[case::tcp_ip("tcp://10.1.2.3:80", Protocol::Tcp, "10.1.2.3", 80)]
    #[case::ipv6("udp://[::1]:1234", Protocol::Udp, "::1", 1234)]
    #[case::with_options("tcp://example.com:7000,bnd=1,local_port=5", Protocol::Tcp, "example.com", 7000)]
    fn test_parse_valid(#[case] s: &str, #[case] transport: Protocol, #[case] host: &str, #[case] port: u16) {
        let parsed = parse_address(s, &[]).unwrap();
        assert_eq!(parsed.transport, transport);
        assert_eq!(parsed.host, host);
        assert_eq!(parsed.port, port);
    }

    #[rstest]
    #[case::bogus("bogus")]
    #[case::one_colon("udp://localhost")]
    #[case::no_slashes("udp:localhost:9999")]
    #[case::port_not_numeric("udp://localhost:abc")]
    #[case::port_too_big("udp://localhost:70000")]
    #[case::empty_host("udp://:9999")]
    #[case::unknown_scheme("http://localhost:80")]
    #[case::empty("")]
    fn test_parse_invalid(#[case] s: &str) {
        match parse_address(s, &[]) {
            Err(TransportError::InvalidAddress(_)) => {}
            other => panic!("expected InvalidAddress, got {:?}", other),
        }
    }

    #[test]
    fn test_options_merge() {
        let parsed = parse_address("tcp://h:1,block=1,wait=250,bnd", &[("block", "0"), ("track_incoming", "1")]).unwrap();
        assert!(parsed.flag("block"));
        assert!(parsed.flag("bnd"));
        assert!(parsed.flag("track_incoming"));
        assert!(!parsed.flag("con"));
        assert_eq!(parsed.numeric_option::<u64>("wait").unwrap(), Some(250));
        assert_eq!(parsed.options.len(), 4);
    }

    #[test]
    fn test_numeric_option_invalid() {
        let parsed = parse_address("tcp://h:1,local_port=x", &[]).unwrap();
        assert!(parsed.numeric_option::<u16>("local_port").is_err());
    }

    #[rstest]
    #[case::v4(Endpoint::new(Protocol::Udp, "127.0.0.1", 5), "udp://127.0.0.1:5")]
    #[case::v6(Endpoint::new(Protocol::Tcp, "::1", 7), "tcp://[::1]:7")]
    fn test_format_endpoint(#[case] endpoint: Endpoint, #[case] expected: &str) {
        assert_eq!(format_endpoint(&endpoint), expected);
        assert_eq!(parse_address(expected, &[]).unwrap().endpoint(), endpoint);
    }
}
