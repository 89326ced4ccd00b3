use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;

use anyhow::anyhow;
use rustc_hash::FxHashMap;
use tokio::net::lookup_host;
use tracing::debug;

/// Caches host name resolution so that sending to a named host does not trigger a DNS lookup
///  for every message. Resolved addresses are cached under their own string form as well, so
///  that replying to a received endpoint never resolves.
///
/// A UDP socket can only send to addresses of its own address family, so a cache for a UDP
///  channel is restricted to that family. TCP connections take whatever resolves first.
pub struct AddressCache {
    ipv4: Option<bool>,
    cache: Mutex<FxHashMap<String, IpAddr>>,
}

impl AddressCache {
    pub fn new(ipv4: bool) -> AddressCache {
        AddressCache {
            ipv4: Some(ipv4),
            cache: Default::default(),
        }
    }

    pub fn any_family() -> AddressCache {
        AddressCache {
            ipv4: None,
            cache: Default::default(),
        }
    }

    pub fn cached(&self, host: &str) -> Option<IpAddr> {
        self.cache.lock().unwrap()
            .get(host)
            .cloned()
    }

    pub async fn resolve(&self, host: &str, port: u16) -> anyhow::Result<SocketAddr> {
        if let Some(ip) = self.cached(host) {
            return Ok(SocketAddr::new(ip, port));
        }

        let ip = match host.parse::<IpAddr>() {
            Ok(ip) => ip,
            Err(_) => {
                let resolved = lookup_host((host, port)).await?
                    .find(|a| self.ipv4.map(|ipv4| a.is_ipv4() == ipv4).unwrap_or(true))
                    .ok_or_else(|| anyhow!("host {} does not resolve to an address of a usable address family", host))?;
                debug!("resolved {} to {}", host, resolved.ip());
                resolved.ip()
            }
        };

        let mut cache = self.cache.lock().unwrap();
        cache.insert(host.to_string(), ip);
        cache.insert(ip.to_string(), ip);
        Ok(SocketAddr::new(ip, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_literal() {
        let cache = AddressCache::new(true);
        let addr = cache.resolve("127.0.0.1", 5000).await.unwrap();
        assert_eq!(addr, SocketAddr::from(([127, 0, 0, 1], 5000)));
        assert_eq!(cache.cached("127.0.0.1"), Some(addr.ip()));
    }

    #[tokio::test]
    async fn test_resolve_localhost_caches_both_ways() {
        let cache = AddressCache::new(true);
        let addr = cache.resolve("localhost", 5000).await.unwrap();
        assert!(addr.is_ipv4());
        assert_eq!(cache.cached("localhost"), Some(addr.ip()));
        assert_eq!(cache.cached(&addr.ip().to_string()), Some(addr.ip()));

        // second lookup uses the cache, port is not part of the cache key
        assert_eq!(cache.resolve("localhost", 6000).await.unwrap(), SocketAddr::new(addr.ip(), 6000));
    }

    #[tokio::test]
    async fn test_resolve_any_family() {
        let cache = AddressCache::any_family();
        assert_eq!(cache.resolve("::1", 80).await.unwrap(), "[::1]:80".parse::<SocketAddr>().unwrap());
        assert!(cache.resolve("localhost", 80).await.is_ok());
    }

    #[tokio::test]
    async fn test_resolve_unresolvable() {
        let cache = AddressCache::new(true);
        assert!(cache.resolve("no-such-host.invalid", 5000).await.is_err());
        assert!(cache.cached("no-such-host.invalid").is_none());
    }
}
