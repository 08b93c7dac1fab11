use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CONNECTION, HOST};
use http::Request;
use http_body_util::{BodyExt, Empty};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use super::{Backend, with_deadline};
use crate::addr::{AddressSet, QueryKey, Resolution};
use crate::cipher::NameCipher;
use crate::error::ResolveError;

/// Used when the server omits the `,ttl` suffix; the floor then applies.
const DEFAULT_TTL: u32 = 0;

/// HTTP-DNS 后端：`GET /d?dn=<name>`，企业版对域名加密。
pub struct HttpBackend {
    server: SocketAddr,
    timeout: Duration,
    cipher: Option<NameCipher>,
}

impl HttpBackend {
    pub fn new(server: SocketAddr, timeout: Duration, cipher: Option<NameCipher>) -> Self {
        Self {
            server,
            timeout,
            cipher,
        }
    }

    /// Request target; the plaintext name never appears when a cipher is set.
    pub(crate) fn request_path(&self, key: &QueryKey) -> Result<String, ResolveError> {
        Ok(match &self.cipher {
            Some(cipher) => format!("/d?dn={}&id={}&ttl=1", cipher.encrypt(key.name())?, cipher.id()),
            None => format!("/d?dn={}&ttl=1", key.name()),
        })
    }

    async fn exchange(&self, path: String) -> Result<Bytes, ResolveError> {
        let stream = TcpStream::connect(self.server).await?;
        stream.set_nodelay(true)?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(http_error)?;
        let server = self.server;
        let _conn = AbortOnDrop(tokio::spawn(async move {
            if let Err(err) = conn.await {
                debug!(target = "http_backend", upstream = %server, error = %err, "connection closed with error");
            }
        }));

        let req = Request::get(path)
            .header(HOST, self.server.to_string())
            .header(CONNECTION, "close")
            .body(Empty::<Bytes>::new())
            .map_err(|err| ResolveError::Io(err.to_string()))?;

        let resp = sender.send_request(req).await.map_err(http_error)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ResolveError::UpstreamError {
                code: status.as_u16(),
            });
        }
        let body = resp.into_body().collect().await.map_err(http_error)?.to_bytes();
        Ok(body)
    }
}

#[async_trait]
impl Backend for HttpBackend {
    fn label(&self) -> &str {
        "http"
    }

    async fn resolve(&self, key: &QueryKey) -> Result<Resolution, ResolveError> {
        let deadline = Instant::now() + self.timeout;
        let path = self.request_path(key)?;
        let body = with_deadline(deadline, self.timeout, self.exchange(path)).await?;
        parse_body(&body, key)
    }
}

/// Parses `ip[;ip...][,ttl]`.
pub(crate) fn parse_body(body: &[u8], key: &QueryKey) -> Result<Resolution, ResolveError> {
    let text = std::str::from_utf8(body).map_err(|_| ResolveError::Malformed("body is not utf-8".into()))?;
    let text = text.trim();
    if text.is_empty() {
        return Err(ResolveError::NoAnswer(key.to_string()));
    }

    let (list, ttl) = match text.rsplit_once(',') {
        Some((list, ttl)) => {
            let ttl = ttl
                .trim()
                .parse::<u32>()
                .map_err(|_| ResolveError::Malformed(format!("bad ttl in body: {text:?}")))?;
            (list, ttl)
        }
        None => (text, DEFAULT_TTL),
    };

    let ips = list
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<IpAddr>()
                .map_err(|_| ResolveError::Malformed(format!("bad address in body: {s:?}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let addrs = AddressSet::from_ips(ips).ok_or_else(|| ResolveError::NoAnswer(key.to_string()))?;
    Ok(Resolution { addrs, ttl })
}

fn http_error(err: hyper::Error) -> ResolveError {
    if err.is_parse() {
        ResolveError::Malformed(err.to_string())
    } else {
        ResolveError::Io(err.to_string())
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}
