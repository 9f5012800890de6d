//! HTTP CONNECT tunneling through an upstream proxy.

use crate::config::Config;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::io;

/// Outcome of feeding proxy response bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStatus {
    /// Response headers incomplete; keep feeding.
    Pending,
    /// 2xx: the tunnel is up.
    Established,
    /// Proxy refused the CONNECT with this status.
    Refused(u16),
}

/// Parser for the proxy's HTTP/1 CONNECT response. Only the status code
/// matters; the header list is discarded.
pub struct ProxyTunnel {
    buf: Vec<u8>,
}

impl Default for ProxyTunnel {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyTunnel {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Build the CONNECT request for the configured backend.
    pub fn connect_request(config: &Config) -> String {
        let mut req = format!(
            "CONNECT {} HTTP/1.1\r\nHost: {}\r\n",
            config.backend_hostport(),
            config.backend_host()
        );
        if let Some(userinfo) = config
            .http_proxy
            .as_ref()
            .and_then(|proxy| proxy.userinfo.as_deref())
        {
            req.push_str("Proxy-Authorization: Basic ");
            req.push_str(&STANDARD.encode(userinfo));
            req.push_str("\r\n");
        }
        req.push_str("\r\n");
        req
    }

    /// Feed response bytes from the proxy. Parse errors are fatal for
    /// the session.
    pub fn feed(&mut self, data: &[u8]) -> io::Result<TunnelStatus> {
        self.buf.extend_from_slice(data);

        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(&self.buf) {
            Ok(httparse::Status::Complete(_)) => {
                let code = response.code.unwrap_or(0);
                if (200..300).contains(&code) {
                    Ok(TunnelStatus::Established)
                } else {
                    Ok(TunnelStatus::Refused(code))
                }
            }
            Ok(httparse::Status::Partial) => Ok(TunnelStatus::Pending),
            Err(e) => Err(io::Error::new(io::ErrorKind::InvalidData, e.to_string())),
        }
    }
}
