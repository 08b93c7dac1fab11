//! Client-side name-resolution cache.
//!
//! [`SdnsEnv`] answers address lookups from a memory-bounded LRU cache and
//! falls back to one configured backend (wire-format DNS or HTTP-DNS with
//! optional name obfuscation) on a miss. Entries close to expiry are refreshed
//! in the background while the cached addresses keep being served.
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use sdns::{SdnsConfig, SdnsEnv};
//!
//! let mut cfg = SdnsConfig::default();
//! cfg.set_cache_mem(1 << 20).set_min_ttl(60).set_server("119.29.29.29", 80);
//! let env = SdnsEnv::init(cfg)?;
//! let list = env.getaddrinfo("www.example.com", Some("https"), None).await?;
//! for ai in &list {
//!     println!("{}", ai.addr);
//! }
//! env.destroy();
//! # Ok(())
//! # }
//! ```

pub mod addr;
pub mod addrinfo;
pub mod backend;
pub mod cache;
pub mod cipher;
pub mod config;
pub mod env;
pub mod error;
pub mod prefetch;

pub use addr::{AddressFamily, AddressSet, QueryKey, Resolution};
pub use addrinfo::{AddrInfo, AddrInfoHints, AddrInfoList, Protocol, SockType};
pub use backend::Backend;
pub use config::{BackendConfig, BackendKind, SdnsConfig, load_config};
pub use env::{CacheStatus, SdnsEnv};
pub use error::{CipherError, ConfigError, ResolveError};
