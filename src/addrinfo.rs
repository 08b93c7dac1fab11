//! `getaddrinfo`-shaped front end over [`SdnsEnv`].
//!
//! Returns owned [`AddrInfo`] records; dropping the [`AddrInfoList`] releases
//! them, so there is no separate free call.

use std::net::{IpAddr, SocketAddr};
use std::ops::Deref;

use tracing::debug;

use crate::addr::{AddressFamily, QueryKey};
use crate::env::SdnsEnv;
use crate::error::ResolveError;

/// Well-known service names accepted in place of a numeric port.
const SERVICES: &[(&str, u16)] = &[
    ("ftp", 21),
    ("ssh", 22),
    ("telnet", 23),
    ("smtp", 25),
    ("domain", 53),
    ("http", 80),
    ("pop3", 110),
    ("imap", 143),
    ("https", 443),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SockType {
    /// Both stream and datagram entries are returned.
    #[default]
    Any,
    Stream,
    Datagram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// Lookup hints; `Default` matches a null hints pointer.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddrInfoHints {
    /// `None` accepts either family.
    pub family: Option<AddressFamily>,
    pub socktype: SockType,
    /// Fill `canonname` on the first result.
    pub canonname: bool,
    /// Node must be an address literal; never touches cache or backend.
    pub numeric_host: bool,
    /// Service must be numeric.
    pub numeric_serv: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrInfo {
    pub family: AddressFamily,
    pub socktype: SockType,
    pub protocol: Protocol,
    pub addr: SocketAddr,
    pub canonname: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddrInfoList(Vec<AddrInfo>);

impl AddrInfoList {
    pub fn addrs(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.0.iter().map(|ai| ai.addr)
    }
}

impl Deref for AddrInfoList {
    type Target = [AddrInfo];

    fn deref(&self) -> &[AddrInfo] {
        &self.0
    }
}

impl IntoIterator for AddrInfoList {
    type Item = AddrInfo;
    type IntoIter = std::vec::IntoIter<AddrInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a AddrInfoList {
    type Item = &'a AddrInfo;
    type IntoIter = std::slice::Iter<'a, AddrInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl SdnsEnv {
    /// Resolves `node` and `service` into socket addresses.
    ///
    /// Address literals are returned as-is; names go through
    /// [`SdnsEnv::resolve_addresses`] and therefore through the cache.
    pub async fn getaddrinfo(
        &self,
        node: &str,
        service: Option<&str>,
        hints: Option<&AddrInfoHints>,
    ) -> Result<AddrInfoList, ResolveError> {
        if !self.is_initialized() {
            return Err(ResolveError::NotInitialized);
        }
        let hints = hints.copied().unwrap_or_default();
        let port = service_port(service, hints.numeric_serv)?;

        let (ips, canonical): (Vec<IpAddr>, String) = match node.parse::<IpAddr>() {
            Ok(ip) => (vec![ip], ip.to_string()),
            Err(_) if hints.numeric_host => return Err(ResolveError::InvalidName(node.to_string())),
            Err(_) => {
                let key = QueryKey::new(node)?;
                let set = self.resolve_addresses(key.name()).await?;
                (set.iter().collect(), key.name().to_string())
            }
        };

        let socktypes: &[(SockType, Protocol)] = match hints.socktype {
            SockType::Any => &[(SockType::Stream, Protocol::Tcp), (SockType::Datagram, Protocol::Udp)],
            SockType::Stream => &[(SockType::Stream, Protocol::Tcp)],
            SockType::Datagram => &[(SockType::Datagram, Protocol::Udp)],
        };

        let mut out = Vec::with_capacity(ips.len() * socktypes.len());
        for ip in ips {
            let family = family_of(ip);
            if hints.family.is_some_and(|want| want != family) {
                continue;
            }
            for &(socktype, protocol) in socktypes {
                out.push(AddrInfo {
                    family,
                    socktype,
                    protocol,
                    addr: SocketAddr::new(ip, port),
                    canonname: None,
                });
            }
        }
        if out.is_empty() {
            debug!(node, family = ?hints.family, "no address of the requested family");
            return Err(ResolveError::NoAnswer(node.to_string()));
        }
        if hints.canonname {
            out[0].canonname = Some(canonical);
        }
        Ok(AddrInfoList(out))
    }
}

fn family_of(ip: IpAddr) -> AddressFamily {
    match ip {
        IpAddr::V4(_) => AddressFamily::Inet,
        IpAddr::V6(_) => AddressFamily::Inet6,
    }
}

fn service_port(service: Option<&str>, numeric_only: bool) -> Result<u16, ResolveError> {
    let Some(service) = service.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(0);
    };
    if let Ok(port) = service.parse::<u16>() {
        return Ok(port);
    }
    if numeric_only {
        return Err(ResolveError::InvalidService(service.to_string()));
    }
    SERVICES
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(service))
        .map(|&(_, port)| port)
        .ok_or_else(|| ResolveError::InvalidService(service.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::{AddressSet, Resolution};
    use crate::backend::Backend;
    use crate::config::SdnsConfig;
    use async_trait::async_trait;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Static {
        addrs: AddressSet,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Backend for Static {
        fn label(&self) -> &str {
            "static"
        }

        async fn resolve(&self, _key: &QueryKey) -> Result<Resolution, ResolveError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Resolution {
                addrs: self.addrs.clone(),
                ttl: 300,
            })
        }
    }

    fn env_with(addrs: AddressSet) -> (SdnsEnv, Arc<Static>) {
        let backend = Arc::new(Static {
            addrs,
            calls: AtomicUsize::new(0),
        });
        let env = SdnsEnv::with_backend(SdnsConfig::default(), backend.clone()).unwrap();
        (env, backend)
    }

    fn v4() -> AddressSet {
        AddressSet::V4(vec![Ipv4Addr::new(198, 51, 100, 1), Ipv4Addr::new(198, 51, 100, 2)].into())
    }

    #[test]
    fn service_ports() {
        assert_eq!(service_port(None, false), Ok(0));
        assert_eq!(service_port(Some("8080"), false), Ok(8080));
        assert_eq!(service_port(Some("HTTPS"), false), Ok(443));
        assert_eq!(service_port(Some("domain"), false), Ok(53));
        assert!(matches!(service_port(Some("http"), true), Err(ResolveError::InvalidService(_))));
        assert!(matches!(service_port(Some("gopher"), false), Err(ResolveError::InvalidService(_))));
        assert!(matches!(service_port(Some("70000"), false), Err(ResolveError::InvalidService(_))));
    }

    #[tokio::test]
    async fn unspecified_socktype_expands_to_stream_and_datagram() {
        let (env, backend) = env_with(v4());
        let list = env.getaddrinfo("www.example.test", Some("http"), None).await.unwrap();
        assert_eq!(list.len(), 4);
        assert_eq!(list[0].socktype, SockType::Stream);
        assert_eq!(list[0].protocol, Protocol::Tcp);
        assert_eq!(list[1].socktype, SockType::Datagram);
        assert_eq!(list[1].protocol, Protocol::Udp);
        assert_eq!(list[0].addr, "198.51.100.1:80".parse().unwrap());
        assert!(list.iter().all(|ai| ai.canonname.is_none()));

        // second call is served from cache
        let stream_only = AddrInfoHints {
            socktype: SockType::Stream,
            canonname: true,
            ..Default::default()
        };
        let list = env
            .getaddrinfo("WWW.example.test.", Some("443"), Some(&stream_only))
            .await
            .unwrap();
        assert_eq!(list.addrs().collect::<Vec<_>>(), vec![
            "198.51.100.1:443".parse::<SocketAddr>().unwrap(),
            "198.51.100.2:443".parse().unwrap(),
        ]);
        assert_eq!(list[0].canonname.as_deref(), Some("WWW.example.test"));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn numeric_hosts_bypass_resolution() {
        let (env, backend) = env_with(v4());
        let list = env.getaddrinfo("2001:db8::7", Some("53"), None).await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].family, AddressFamily::Inet6);
        assert_eq!(list[0].addr, SocketAddr::new(IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 7)), 53));

        let numeric = AddrInfoHints {
            numeric_host: true,
            ..Default::default()
        };
        assert!(matches!(
            env.getaddrinfo("www.example.test", None, Some(&numeric)).await,
            Err(ResolveError::InvalidName(_))
        ));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn family_hint_filters_results() {
        let (env, _) = env_with(v4());
        let want_v6 = AddrInfoHints {
            family: Some(AddressFamily::Inet6),
            ..Default::default()
        };
        assert!(matches!(
            env.getaddrinfo("v4only.test", None, Some(&want_v6)).await,
            Err(ResolveError::NoAnswer(_))
        ));
        assert!(matches!(
            env.getaddrinfo("192.0.2.1", None, Some(&want_v6)).await,
            Err(ResolveError::NoAnswer(_))
        ));

        let want_v4 = AddrInfoHints {
            family: Some(AddressFamily::Inet),
            socktype: SockType::Datagram,
            ..Default::default()
        };
        let list = env.getaddrinfo("v4only.test", None, Some(&want_v4)).await.unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.iter().all(|ai| ai.protocol == Protocol::Udp && ai.addr.port() == 0));
    }

    #[tokio::test]
    async fn errors_before_lookup() {
        let (env, backend) = env_with(v4());
        assert!(matches!(
            env.getaddrinfo("a.test", Some("nope"), None).await,
            Err(ResolveError::InvalidService(_))
        ));
        assert!(matches!(
            env.getaddrinfo("bad..name", None, None).await,
            Err(ResolveError::InvalidName(_))
        ));
        env.destroy();
        assert_eq!(
            env.getaddrinfo("192.0.2.1", None, None).await,
            Err(ResolveError::NotInitialized)
        );
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }
}
