use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use rustc_hash::FxHasher;

use crate::error::ResolveError;

/// Longest presentation-format name accepted (RFC 1035 limit).
const MAX_NAME_LEN: usize = 253;

/// Normalized lookup key.
///
/// Equality and hashing use the ASCII-lowercased name; the spelling the caller
/// used is kept for the wire and for obfuscation.
#[derive(Clone)]
pub struct QueryKey {
    name: Arc<str>,
    folded: Arc<str>,
}

impl QueryKey {
    pub fn new(name: &str) -> Result<Self, ResolveError> {
        let trimmed = name.strip_suffix('.').unwrap_or(name);
        if trimmed.is_empty() || trimmed.len() > MAX_NAME_LEN {
            return Err(ResolveError::InvalidName(name.to_string()));
        }
        if trimmed
            .split('.')
            .any(|label| label.is_empty() || label.len() > 63)
        {
            return Err(ResolveError::InvalidName(name.to_string()));
        }
        // IDNs must arrive already punycode-encoded.
        if !trimmed
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
        {
            return Err(ResolveError::InvalidName(name.to_string()));
        }
        Ok(Self {
            name: Arc::from(trimmed),
            folded: Arc::from(trimmed.to_ascii_lowercase()),
        })
    }

    /// Name as supplied by the caller (minus a trailing dot).
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn folded(&self) -> &str {
        &self.folded
    }

    /// Stable hash used by the prefetch job list.
    #[inline]
    pub fn stable_hash(&self) -> u64 {
        let mut h = FxHasher::default();
        self.folded.hash(&mut h);
        h.finish()
    }
}

impl PartialEq for QueryKey {
    fn eq(&self, other: &Self) -> bool {
        self.folded == other.folded
    }
}

impl Eq for QueryKey {}

impl Hash for QueryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.folded.hash(state);
    }
}

impl fmt::Debug for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("QueryKey").field(&self.name).finish()
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Inet,
    Inet6,
}

impl AddressFamily {
    /// Byte length of one address of this family.
    #[inline]
    pub fn addr_len(self) -> usize {
        match self {
            AddressFamily::Inet => 4,
            AddressFamily::Inet6 => 16,
        }
    }
}

/// Resolved addresses of a single family, in upstream order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressSet {
    V4(Arc<[Ipv4Addr]>),
    V6(Arc<[Ipv6Addr]>),
}

impl AddressSet {
    /// Builds a set from mixed addresses, keeping only the family of the first one.
    pub fn from_ips<I: IntoIterator<Item = IpAddr>>(ips: I) -> Option<Self> {
        let mut iter = ips.into_iter().peekable();
        match iter.peek()? {
            IpAddr::V4(_) => {
                let v4: Vec<Ipv4Addr> = iter
                    .filter_map(|ip| match ip {
                        IpAddr::V4(v4) => Some(v4),
                        IpAddr::V6(_) => None,
                    })
                    .collect();
                Some(AddressSet::V4(v4.into()))
            }
            IpAddr::V6(_) => {
                let v6: Vec<Ipv6Addr> = iter
                    .filter_map(|ip| match ip {
                        IpAddr::V6(v6) => Some(v6),
                        IpAddr::V4(_) => None,
                    })
                    .collect();
                Some(AddressSet::V6(v6.into()))
            }
        }
    }

    #[inline]
    pub fn family(&self) -> AddressFamily {
        match self {
            AddressSet::V4(_) => AddressFamily::Inet,
            AddressSet::V6(_) => AddressFamily::Inet6,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        match self {
            AddressSet::V4(a) => a.len(),
            AddressSet::V6(a) => a.len(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = IpAddr> + '_ {
        let (v4, v6): (&[Ipv4Addr], &[Ipv6Addr]) = match self {
            AddressSet::V4(a) => (&a[..], &[]),
            AddressSet::V6(a) => (&[], &a[..]),
        };
        v4.iter()
            .copied()
            .map(IpAddr::V4)
            .chain(v6.iter().copied().map(IpAddr::V6))
    }

    /// Raw payload size in bytes.
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.len() * self.family().addr_len()
    }
}

/// What a backend hands back: addresses plus upstream TTL in seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub addrs: AddressSet,
    pub ttl: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_key_is_case_insensitive_but_preserves_spelling() {
        let a = QueryKey::new("Example.TEST.").expect("key");
        let b = QueryKey::new("example.test").expect("key");
        assert_eq!(a, b);
        assert_eq!(a.stable_hash(), b.stable_hash());
        assert_eq!(a.name(), "Example.TEST");
        assert_eq!(a.folded(), "example.test");
    }

    #[test]
    fn query_key_rejects_bad_names() {
        assert!(QueryKey::new("").is_err());
        assert!(QueryKey::new(".").is_err());
        assert!(QueryKey::new("a..b").is_err());
        assert!(QueryKey::new("has space.test").is_err());
        assert!(QueryKey::new("a.test&id=1").is_err());
        assert!(QueryKey::new("bücher.test").is_err());
        assert!(QueryKey::new(&"a".repeat(64)).is_err());
    }

    #[test]
    fn address_set_keeps_first_family_only() {
        let ips: Vec<IpAddr> = vec![
            "10.0.0.1".parse().unwrap(),
            "2001:db8::1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
        ];
        let set = AddressSet::from_ips(ips).expect("set");
        assert_eq!(set.family(), AddressFamily::Inet);
        assert_eq!(set.len(), 2);
        assert_eq!(set.byte_len(), 8);
        assert!(AddressSet::from_ips(Vec::new()).is_none());
    }
}
