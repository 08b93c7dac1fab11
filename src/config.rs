use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use tracing::info;

use crate::error::ConfigError;

/// 环境配置。仅在 `SdnsEnv::init` 之前可修改，初始化后只读。
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SdnsConfig {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub prefetch: PrefetchSettings,
    #[serde(default)]
    pub backend: BackendConfig,
    /// 主后端失败后尝试的公共 DNS（可选）。
    #[serde(default)]
    pub fallback: Option<BackendConfig>,
    /// 企业版加密 id/key（可选）。
    #[serde(default)]
    pub cipher: Option<CipherConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    /// 缓存内存上限（字节）。
    #[serde(default = "default_max_memory")]
    pub max_memory: u64,
    /// 最小TTL秒数，上游返回更小的值会被抬升。
    #[serde(default = "default_min_ttl")]
    pub min_ttl: u32,
    /// 最大TTL秒数。
    #[serde(default = "default_max_ttl")]
    pub max_ttl: u32,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_memory: default_max_memory(),
            min_ttl: default_min_ttl(),
            max_ttl: default_max_ttl(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrefetchSettings {
    #[serde(default = "default_prefetch_enabled")]
    pub enabled: bool,
    /// 剩余 TTL 低于该百分比时触发预取。
    #[serde(default = "default_threshold_percent")]
    pub threshold_percent: u8,
}

impl Default for PrefetchSettings {
    fn default() -> Self {
        Self {
            enabled: default_prefetch_enabled(),
            threshold_percent: default_threshold_percent(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    #[serde(rename = "type", default = "default_backend_kind")]
    pub kind: BackendKind,
    /// 服务器 IP。
    #[serde(default = "default_server")]
    pub server: String,
    /// 端口；缺省按类型取 80 (http) 或 53 (dns)。
    #[serde(default)]
    pub port: Option<u16>,
    /// 上游超时（毫秒）。
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// dns 后端的传输层，缺省udp。
    #[serde(default = "default_transport")]
    pub transport: Transport,
    /// dns 后端查询的地址族。
    #[serde(default = "default_family")]
    pub family: QueryFamily,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: default_backend_kind(),
            server: default_server(),
            port: None,
            timeout_ms: default_timeout_ms(),
            transport: default_transport(),
            family: default_family(),
        }
    }
}

impl BackendConfig {
    pub fn dns(server: impl Into<String>, port: u16) -> Self {
        Self {
            kind: BackendKind::Dns,
            server: server.into(),
            port: Some(port),
            ..Self::default()
        }
    }

    pub fn http(server: impl Into<String>, port: u16) -> Self {
        Self {
            kind: BackendKind::Http,
            server: server.into(),
            port: Some(port),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    #[inline]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Resolves `server`/`port` into a socket address.
    pub fn endpoint(&self, role: &'static str) -> Result<SocketAddr, ConfigError> {
        let port = self.port.unwrap_or(match self.kind {
            BackendKind::Http => 80,
            BackendKind::Dns => 53,
        });
        let ip: IpAddr = self
            .server
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidEndpoint {
                role,
                value: self.server.clone(),
            })?;
        if port == 0 || ip.is_unspecified() {
            return Err(ConfigError::InvalidEndpoint {
                role,
                value: format!("{}:{}", self.server, port),
            });
        }
        Ok(SocketAddr::new(ip, port))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CipherConfig {
    pub id: u32,
    pub key: String,
}

#[derive(Debug, Clone, Deserialize, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Dns,
    Http,
}

#[derive(Debug, Clone, Deserialize, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Udp,
    Tcp,
}

#[derive(Debug, Clone, Deserialize, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueryFamily {
    Ipv4,
    Ipv6,
    /// A 优先，无结果时再查 AAAA。
    Any,
}

impl SdnsConfig {
    pub fn set_cache_mem(&mut self, max_memory: u64) -> &mut Self {
        self.cache.max_memory = max_memory;
        self
    }

    pub fn set_min_ttl(&mut self, min_ttl: u32) -> &mut Self {
        self.cache.min_ttl = min_ttl;
        self
    }

    /// Points the primary backend at `server:port`, keeping its kind.
    pub fn set_server(&mut self, server: impl Into<String>, port: u16) -> &mut Self {
        self.backend.server = server.into();
        self.backend.port = Some(port);
        self
    }

    /// Sets the public wire-protocol server used when the primary backend fails.
    /// It runs inside the primary's `timeout_ms` budget, not a fresh one.
    pub fn set_public_server(&mut self, server: impl Into<String>, port: u16) -> &mut Self {
        self.fallback = Some(BackendConfig::dns(server, port));
        self
    }

    pub fn set_cipher(&mut self, id: u32, key: impl Into<String>) -> &mut Self {
        self.cipher = Some(CipherConfig {
            id,
            key: key.into(),
        });
        self
    }

    pub fn set_backend(&mut self, backend: BackendConfig) -> &mut Self {
        self.backend = backend;
        self
    }

    pub fn set_prefetch(&mut self, enabled: bool, threshold_percent: u8) -> &mut Self {
        self.prefetch = PrefetchSettings {
            enabled,
            threshold_percent,
        };
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_cache()?;
        validate_backend(&self.backend, "backend")?;
        if let Some(fallback) = &self.fallback {
            validate_backend(fallback, "fallback")?;
        }
        if let Some(cipher) = &self.cipher {
            if cipher.key.is_empty() {
                return Err(crate::error::CipherError::EmptyKey.into());
            }
        }
        Ok(())
    }

    /// 只校验缓存与预取部分（自定义后端时使用）。
    pub fn validate_cache(&self) -> Result<(), ConfigError> {
        if self.cache.max_memory == 0 {
            return Err(ConfigError::ZeroMemory);
        }
        if self.cache.min_ttl > self.cache.max_ttl {
            return Err(ConfigError::TtlRange {
                min: self.cache.min_ttl,
                max: self.cache.max_ttl,
            });
        }
        if self.prefetch.threshold_percent > 100 {
            return Err(ConfigError::PrefetchThreshold(self.prefetch.threshold_percent));
        }
        Ok(())
    }
}

fn validate_backend(backend: &BackendConfig, role: &'static str) -> Result<(), ConfigError> {
    if backend.timeout_ms == 0 {
        return Err(ConfigError::ZeroTimeout);
    }
    backend.endpoint(role).map(|_| ())
}

pub fn load_config(path: &Path) -> Result<SdnsConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: SdnsConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;

    if let Some(version) = cfg.version.as_ref() {
        info!(target = "config", version = %version, "config loaded");
    }

    cfg.validate()
        .with_context(|| format!("validate config file: {}", path.display()))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_config_uses_defaults() {
        let cfg: SdnsConfig = serde_json::from_value(json!({})).expect("parse config");
        assert_eq!(cfg.cache.max_memory, default_max_memory());
        assert_eq!(cfg.cache.min_ttl, 60);
        assert_eq!(cfg.backend.kind, BackendKind::Http);
        assert_eq!(cfg.backend.transport, Transport::Udp);
        assert!(cfg.prefetch.enabled);
        assert!(cfg.fallback.is_none());
        assert!(cfg.cipher.is_none());
        cfg.validate().expect("defaults are valid");
    }

    #[test]
    fn backend_port_defaults_by_kind() {
        let raw = json!({
            "backend": { "type": "dns", "server": "10.0.0.53", "transport": "tcp", "family": "any" },
            "fallback": { "type": "http", "server": "10.0.0.80" }
        });
        let cfg: SdnsConfig = serde_json::from_value(raw).expect("parse config");
        assert_eq!(
            cfg.backend.endpoint("backend").unwrap(),
            "10.0.0.53:53".parse().unwrap()
        );
        assert_eq!(cfg.backend.family, QueryFamily::Any);
        let fallback = cfg.fallback.as_ref().unwrap();
        assert_eq!(
            fallback.endpoint("fallback").unwrap(),
            "10.0.0.80:80".parse().unwrap()
        );
    }

    #[test]
    fn validate_reports_errors_at_configuration_time() {
        let mut cfg = SdnsConfig::default();
        cfg.set_server("not-an-ip", 80);
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidEndpoint { role: "backend", .. })
        ));

        let mut cfg = SdnsConfig::default();
        cfg.set_cache_mem(0);
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroMemory));

        let mut cfg = SdnsConfig::default();
        cfg.set_min_ttl(100_000);
        assert!(matches!(cfg.validate(), Err(ConfigError::TtlRange { .. })));

        let mut cfg = SdnsConfig::default();
        cfg.set_cipher(7, "");
        assert!(matches!(cfg.validate(), Err(ConfigError::Cipher(_))));

        let mut cfg = SdnsConfig::default();
        cfg.set_prefetch(true, 150);
        assert_eq!(cfg.validate(), Err(ConfigError::PrefetchThreshold(150)));
    }

    #[test]
    fn setters_mirror_configuration_calls() {
        let mut cfg = SdnsConfig::default();
        cfg.set_cache_mem(1024)
            .set_min_ttl(30)
            .set_server("192.0.2.1", 8080)
            .set_public_server("192.0.2.53", 53)
            .set_cipher(12, "secret");
        assert_eq!(cfg.cache.max_memory, 1024);
        assert_eq!(cfg.cache.min_ttl, 30);
        assert_eq!(
            cfg.backend.endpoint("backend").unwrap(),
            "192.0.2.1:8080".parse().unwrap()
        );
        assert_eq!(cfg.fallback.as_ref().unwrap().kind, BackendKind::Dns);
        assert_eq!(cfg.cipher.as_ref().unwrap().id, 12);
        cfg.validate().expect("valid");
    }
}

fn default_max_memory() -> u64 {
    4 * 1024 * 1024
}

fn default_min_ttl() -> u32 {
    60
}

fn default_max_ttl() -> u32 {
    86_400
}

fn default_prefetch_enabled() -> bool {
    true
}

fn default_threshold_percent() -> u8 {
    10
}

fn default_backend_kind() -> BackendKind {
    BackendKind::Http
}

fn default_server() -> String {
    "119.29.29.29".to_string()
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_transport() -> Transport {
    Transport::Udp
}

fn default_family() -> QueryFamily {
    QueryFamily::Ipv4
}
