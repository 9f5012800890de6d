//! Transport driver: raw socket and TLS I/O paths.
//!
//! The session installs one of a small set of read/write modes and drives
//! the matching path here. TLS uses rustls; WANT_READ/WANT_WRITE surface
//! as `WouldBlock` plus the handshake status so the session can arm the
//! right watcher. rustls refuses renegotiation structurally: a peer that
//! tries surfaces as a fatal `process_new_packets` error.

use crate::buffer::ByteBuffer;
use crate::config::BackendConfig;

use mio::net::TcpStream;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConnection, DigitallySignedStruct, ProtocolVersion, SignatureScheme};
use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;

/// How the session reads from the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    Noop,
    TlsHandshake,
    Clear,
    Tls,
}

/// How the session writes to the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Noop,
    /// Waiting for the non-blocking connect to complete.
    Connecting,
    TlsHandshake,
    Clear,
    Tls,
}

/// TLS handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    Done,
    WantRead,
    WantWrite,
}

/// Reusable TLS client context: rustls config plus the server name.
pub struct TlsContext {
    config: Arc<rustls::ClientConfig>,
    server_name: ServerName<'static>,
}

impl TlsContext {
    /// Build a context from backend configuration; `None` when TLS is off.
    pub fn new(backend: &BackendConfig, sni_name: String) -> io::Result<Option<Self>> {
        if !backend.tls {
            return Ok(None);
        }

        let mut config = if backend.insecure {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
                .with_no_client_auth()
        } else {
            let roots =
                rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        };
        config.alpn_protocols = vec![b"h2".to_vec()];

        let server_name = ServerName::try_from(sni_name)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        Ok(Some(Self {
            config: Arc::new(config),
            server_name,
        }))
    }

    fn start(&self) -> io::Result<ClientConnection> {
        ClientConnection::new(self.config.clone(), self.server_name.clone())
            .map_err(io::Error::other)
    }
}

/// Skips certificate verification (`backend.insecure = true`).
#[derive(Debug)]
struct InsecureVerifier;

impl ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}

/// The socket and optional TLS state owned by the session.
#[derive(Default)]
pub struct Transport {
    sock: Option<TcpStream>,
    tls: Option<ClientConnection>,
}

impl Transport {
    /// Open a non-blocking socket and start connecting; EINPROGRESS is
    /// the expected outcome.
    pub fn connect(addr: SocketAddr) -> io::Result<TcpStream> {
        let socket = socket2::Socket::new(
            socket2::Domain::for_address(addr),
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        socket.set_nonblocking(true)?;
        let _ = socket.set_nodelay(true);
        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }
        Ok(TcpStream::from_std(socket.into()))
    }

    pub fn set_socket(&mut self, sock: TcpStream) {
        self.sock = Some(sock);
    }

    pub fn socket_mut(&mut self) -> Option<&mut TcpStream> {
        self.sock.as_mut()
    }

    pub fn is_open(&self) -> bool {
        self.sock.is_some()
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Attach a fresh TLS client connection over the current socket.
    pub fn start_tls(&mut self, ctx: &TlsContext) -> io::Result<()> {
        self.tls = Some(ctx.start()?);
        Ok(())
    }

    /// Verify the non-blocking connect finished.
    pub fn check_connected(&self) -> io::Result<()> {
        let sock = self.sock.as_ref().ok_or(io::ErrorKind::NotConnected)?;
        if let Some(err) = sock.take_error()? {
            return Err(err);
        }
        sock.peer_addr()?;
        Ok(())
    }

    /// One vectored read into `rb`. `Ok(0)` is EOF; `WouldBlock` means
    /// the socket is drained.
    pub fn recv_clear(&mut self, rb: &mut ByteBuffer) -> io::Result<usize> {
        let sock = self.sock.as_mut().ok_or(io::ErrorKind::NotConnected)?;
        if rb.wleft() == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        loop {
            let result = {
                let (first, second) = rb.write_bufs();
                let mut iovs = [IoSliceMut::new(first), IoSliceMut::new(second)];
                sock.read_vectored(&mut iovs)
            };
            match result {
                Ok(n) => {
                    rb.fill(n);
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// One vectored write from `wb`.
    pub fn send_clear(&mut self, wb: &mut ByteBuffer) -> io::Result<usize> {
        let sock = self.sock.as_mut().ok_or(io::ErrorKind::NotConnected)?;
        if wb.rleft() == 0 {
            return Ok(0);
        }
        loop {
            let result = {
                let (first, second) = wb.read_bufs();
                let iovs = [IoSlice::new(first), IoSlice::new(second)];
                sock.write_vectored(&iovs)
            };
            match result {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    wb.drain(n);
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Drive the TLS handshake as far as the socket allows.
    pub fn handshake(&mut self) -> io::Result<Handshake> {
        let sock = self.sock.as_mut().ok_or(io::ErrorKind::NotConnected)?;
        let tls = self.tls.as_mut().ok_or(io::ErrorKind::NotConnected)?;

        loop {
            if tls.wants_write() {
                match tls.write_tls(sock) {
                    Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                    Ok(_) => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(Handshake::WantWrite);
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
            if !tls.is_handshaking() {
                return Ok(Handshake::Done);
            }
            match tls.read_tls(sock) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(_) => {
                    tls.process_new_packets().map_err(io::Error::other)?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Handshake::WantRead);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Read decrypted bytes into `rb`. `Ok(0)` is EOF (clean TLS close or
    /// raw socket EOF); `WouldBlock` means no progress possible now.
    pub fn recv_tls(&mut self, rb: &mut ByteBuffer) -> io::Result<usize> {
        let sock = self.sock.as_mut().ok_or(io::ErrorKind::NotConnected)?;
        let tls = self.tls.as_mut().ok_or(io::ErrorKind::NotConnected)?;
        let mut total = 0usize;

        loop {
            if rb.wleft() == 0 {
                return if total > 0 {
                    Ok(total)
                } else {
                    Err(io::ErrorKind::WouldBlock.into())
                };
            }

            let plain = {
                let (first, second) = rb.write_bufs();
                let seg: &mut [u8] = if first.is_empty() { second } else { first };
                tls.reader().read(seg)
            };
            match plain {
                Ok(0) => return Ok(total),
                Ok(n) => {
                    rb.fill(n);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => match tls.read_tls(sock) {
                    Ok(0) => return Ok(total),
                    Ok(_) => {
                        tls.process_new_packets().map_err(io::Error::other)?;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return if total > 0 { Ok(total) } else { Err(e) };
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// Encrypt and flush from `wb`. `Ok(())` when everything queued and
    /// flushed; `WouldBlock` when the socket backed up.
    pub fn send_tls(&mut self, wb: &mut ByteBuffer) -> io::Result<()> {
        let sock = self.sock.as_mut().ok_or(io::ErrorKind::NotConnected)?;
        let tls = self.tls.as_mut().ok_or(io::ErrorKind::NotConnected)?;

        loop {
            while tls.wants_write() {
                match tls.write_tls(sock) {
                    Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e),
                }
            }
            if wb.rleft() == 0 {
                return Ok(());
            }
            let n = {
                let (first, _) = wb.read_bufs();
                tls.writer().write(first)?
            };
            if n == 0 {
                // rustls buffer limit reached without pending output.
                return Err(io::Error::other("tls writer stalled"));
            }
            wb.drain(n);
        }
    }

    /// Negotiated ALPN protocol, if TLS is in use.
    pub fn alpn(&self) -> Option<&[u8]> {
        self.tls.as_ref().and_then(|tls| tls.alpn_protocol())
    }

    /// RFC 7540 Section 9.2: TLS 1.2+ with a modern AEAD suite. Every
    /// suite rustls implements for 1.2 is ECDHE+AEAD, so version suffices.
    pub fn meets_http2_requirement(&self) -> bool {
        let Some(tls) = self.tls.as_ref() else {
            return false;
        };
        matches!(
            tls.protocol_version(),
            Some(ProtocolVersion::TLSv1_2 | ProtocolVersion::TLSv1_3)
        )
    }

    /// Graceful close: TLS close_notify (best effort), shutdown write,
    /// then drop the socket.
    pub fn close(&mut self) {
        if let (Some(tls), Some(sock)) = (self.tls.as_mut(), self.sock.as_mut()) {
            tls.send_close_notify();
            let _ = tls.write_tls(sock);
        }
        self.tls = None;
        if let Some(sock) = self.sock.take() {
            let _ = sock.shutdown(std::net::Shutdown::Write);
        }
    }
}
