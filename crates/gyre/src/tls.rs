//! TLS transport: context construction and session driving.
//!
//! A [`TlsContext`] is built once from [`TlsOptions`] and shared
//! (reference-counted) by every connection of a listener or connector.
//! The per-connection session is pumped sans-IO against the non-blocking
//! socket: ciphertext moves through `read_tls`/`write_tls`, plaintext
//! through the session's reader and writer. A peer that closes the
//! transport without sending close_notify is treated as a clean EOF, not
//! an error, to match widely deployed servers.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tracing::{debug, error};

use crate::connection::{coalesce, Phase, Stream, READ_CHUNK};
use crate::error::Error;
use crate::reactor::{ConnectionId, Reactor};

/// Peer-certificate verification policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerifyMode {
    /// No verification. Client sessions accept any server certificate;
    /// server sessions request no client certificate.
    #[default]
    None,
    /// Verify a certificate when the peer presents one, but do not
    /// require it.
    Optional,
    /// Require and verify a peer certificate.
    Required,
}

/// Configuration from which a [`TlsContext`] is built.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    server_side: bool,
    cert_file: Option<PathBuf>,
    key_file: Option<PathBuf>,
    password: Option<String>,
    verify_mode: VerifyMode,
    verify_file: Option<PathBuf>,
    check_host: Option<String>,
}

impl TlsOptions {
    /// Options for the server side of a listener.
    pub fn server() -> Self {
        Self { server_side: true, ..Self::default() }
    }

    /// Options for the client side of a connector.
    pub fn client() -> Self {
        Self::default()
    }

    pub fn is_server_side(&self) -> bool {
        self.server_side
    }

    /// PEM certificate chain.
    pub fn with_cert_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.cert_file = Some(path.into());
        self
    }

    /// PEM private key.
    pub fn with_key_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_file = Some(path.into());
        self
    }

    /// Passphrase for an encrypted private key.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_verify_mode(mut self, mode: VerifyMode) -> Self {
        self.verify_mode = mode;
        self
    }

    /// Trusted CA bundle. When absent, the system's default verification
    /// paths are used.
    pub fn with_verify_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.verify_file = Some(path.into());
        self
    }

    /// Hostname to validate against the peer certificate (RFC 2818).
    /// Defaults to the host the connector dials.
    pub fn with_check_host(mut self, host: impl Into<String>) -> Self {
        self.check_host = Some(host.into());
        self
    }
}

#[derive(Debug)]
enum ContextKind {
    Server(Arc<rustls::ServerConfig>),
    Client { config: Arc<rustls::ClientConfig>, check_host: Option<String> },
}

/// A built TLS configuration, shared across the connections it serves.
#[derive(Debug)]
pub struct TlsContext {
    kind: ContextKind,
}

impl TlsContext {
    /// Build a context from options. Certificate and key files are loaded
    /// eagerly; the context is immutable afterwards.
    pub fn new(options: &TlsOptions) -> Result<Arc<Self>, Error> {
        let kind = if options.server_side {
            ContextKind::Server(build_server_config(options)?)
        } else {
            ContextKind::Client {
                config: build_client_config(options)?,
                check_host: options.check_host.clone(),
            }
        };
        Ok(Arc::new(Self { kind }))
    }

    pub fn is_server_side(&self) -> bool {
        matches!(self.kind, ContextKind::Server(_))
    }

    pub(crate) fn server_session(&self) -> Result<rustls::Connection, Error> {
        match &self.kind {
            ContextKind::Server(config) => {
                Ok(rustls::ServerConnection::new(Arc::clone(config))?.into())
            }
            ContextKind::Client { .. } => {
                Err(config_error("client-side context used on a listener"))
            }
        }
    }

    pub(crate) fn client_session(&self, host: &str) -> Result<rustls::Connection, Error> {
        match &self.kind {
            ContextKind::Client { config, check_host } => {
                let name = check_host.clone().unwrap_or_else(|| host.to_string());
                let server_name = ServerName::try_from(name)
                    .map_err(|_| config_error(format!("invalid server name {host:?}")))?;
                Ok(rustls::ClientConnection::new(Arc::clone(config), server_name)?.into())
            }
            ContextKind::Server(_) => {
                Err(config_error("server-side context used on a connector"))
            }
        }
    }
}

fn config_error(msg: impl Into<String>) -> Error {
    Error::Tls(rustls::Error::General(msg.into()))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<io::Result<Vec<_>>>()
        .map_err(Error::from)?;
    if certs.is_empty() {
        return Err(config_error(format!("no certificates found in {}", path.display())));
    }
    Ok(certs)
}

fn load_key(path: &Path, password: Option<&str>) -> Result<PrivateKeyDer<'static>, Error> {
    let mut reader = BufReader::new(File::open(path)?);
    match rustls_pemfile::private_key(&mut reader).map_err(Error::from)? {
        Some(key) => Ok(key),
        // rustls-pemfile only yields cleartext keys, so an encrypted key
        // parses to nothing.
        None if password.is_some() => Err(config_error(format!(
            "could not read an unencrypted private key from {}; \
             encrypted keys are not supported, decrypt to PKCS#8 first",
            path.display()
        ))),
        None => Err(config_error(format!("no private key found in {}", path.display()))),
    }
}

fn load_roots(verify_file: Option<&Path>) -> Result<rustls::RootCertStore, Error> {
    let mut roots = rustls::RootCertStore::empty();
    match verify_file {
        Some(path) => {
            for cert in load_certs(path)? {
                roots.add(cert).map_err(Error::from)?;
            }
        }
        None => {
            // System default verification paths.
            for cert in rustls_native_certs::load_native_certs().certs {
                let _ = roots.add(cert);
            }
        }
    }
    Ok(roots)
}

fn build_server_config(options: &TlsOptions) -> Result<Arc<rustls::ServerConfig>, Error> {
    let cert_path = options
        .cert_file
        .as_deref()
        .ok_or_else(|| config_error("a server-side context requires a certificate file"))?;
    let key_path = options
        .key_file
        .as_deref()
        .ok_or_else(|| config_error("a server-side context requires a key file"))?;
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path, options.password.as_deref())?;

    let builder = rustls::ServerConfig::builder();
    let config = match options.verify_mode {
        VerifyMode::None => builder.with_no_client_auth().with_single_cert(certs, key)?,
        mode => {
            let roots = load_roots(options.verify_file.as_deref())?;
            let mut verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots));
            if mode == VerifyMode::Optional {
                verifier = verifier.allow_unauthenticated();
            }
            let verifier = verifier.build().map_err(|e| config_error(e.to_string()))?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)?
        }
    };
    Ok(Arc::new(config))
}

fn build_client_config(options: &TlsOptions) -> Result<Arc<rustls::ClientConfig>, Error> {
    let client_cert = match (&options.cert_file, &options.key_file) {
        (Some(cert), Some(key)) => {
            Some((load_certs(cert)?, load_key(key, options.password.as_deref())?))
        }
        _ => None,
    };

    let builder = rustls::ClientConfig::builder();
    let config = match options.verify_mode {
        VerifyMode::None => {
            let builder = builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(danger::NoVerification::new()));
            match client_cert {
                Some((certs, key)) => builder.with_client_auth_cert(certs, key)?,
                None => builder.with_no_client_auth(),
            }
        }
        _ => {
            let roots = load_roots(options.verify_file.as_deref())?;
            let builder = builder.with_root_certificates(roots);
            match client_cert {
                Some((certs, key)) => builder.with_client_auth_cert(certs, key)?,
                None => builder.with_no_client_auth(),
            }
        }
    };
    Ok(Arc::new(config))
}

mod danger {
    use rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::DigitallySignedStruct;

    /// Accepts any server certificate. Signatures are still checked so a
    /// garbled handshake does not pass.
    #[derive(Debug)]
    pub(super) struct NoVerification(CryptoProvider);

    impl NoVerification {
        pub(super) fn new() -> Self {
            Self(rustls::crypto::aws_lc_rs::default_provider())
        }
    }

    impl ServerCertVerifier for NoVerification {
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
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}

/// Per-connection TLS state: the socket plus the session pumped over it.
pub(crate) struct TlsStream {
    pub sock: TcpStream,
    pub session: rustls::Connection,
    /// Our close_notify was queued into the session.
    sent_close_notify: bool,
    /// The peer's close_notify arrived.
    peer_closed: bool,
    /// The transport reached EOF (with or without a close_notify first).
    peer_eof: bool,
}

impl TlsStream {
    pub fn new(sock: TcpStream, session: rustls::Connection) -> Self {
        Self { sock, session, sent_close_notify: false, peer_closed: false, peer_eof: false }
    }
}

/// Ciphertext arrived (or the transport closed).
pub(crate) fn conn_readable(r: &mut Reactor, id: ConnectionId) {
    let outcome = {
        let Some(conn) = r.conns.get_mut(&id) else { return };
        let Stream::Tls(tls) = &mut conn.stream else { return };
        // Nb. poll is level-triggered; one read per event, we are woken
        // again while data remains.
        match tls.session.read_tls(&mut tls.sock) {
            Ok(0) => {
                tls.peer_eof = true;
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                return
            }
            Err(e) => Err(e),
        }
    };
    match outcome {
        Ok(()) => process(r, id),
        Err(e) => {
            let Some(conn) = r.conns.get_mut(&id) else { return };
            error!(target: "tls", "{}: Read error {:?}: {}", conn.peer, e.kind(), e);
            conn.error.get_or_insert(Error::from(e));
            r.close_connection(id);
        }
    }
}

/// The socket became writable.
pub(crate) fn conn_writable(r: &mut Reactor, id: ConnectionId) {
    let phase = match r.conns.get(&id) {
        Some(conn) => conn.phase,
        None => return,
    };
    match phase {
        Phase::Handshaking => flush_transport(r, id),
        Phase::Open | Phase::Draining => flush_app_writes(r, id),
        Phase::ShuttingDown => {
            flush_transport(r, id);
            try_finish_shutdown(r, id);
        }
        Phase::Connecting | Phase::Closed => {}
    }
}

/// Digest freshly read ciphertext: advance the handshake, surface
/// plaintext, notice shutdown conditions.
fn process(r: &mut Reactor, id: ConnectionId) {
    let step = {
        let Some(conn) = r.conns.get_mut(&id) else { return };
        let was_handshaking = conn.phase == Phase::Handshaking;
        let Stream::Tls(tls) = &mut conn.stream else { return };
        match tls.session.process_new_packets() {
            Ok(state) => {
                if state.peer_has_closed() {
                    tls.peer_closed = true;
                }
                let done = was_handshaking && !tls.session.is_handshaking();
                Ok((done, state.plaintext_bytes_to_read()))
            }
            Err(e) => {
                // Push out the alert describing the failure, best effort.
                let _ = tls.session.write_tls(&mut tls.sock);
                Err(e)
            }
        }
    };

    match step {
        Err(e) => {
            let Some(conn) = r.conns.get_mut(&id) else { return };
            if conn.phase == Phase::Handshaking {
                error!(target: "tls", "{}: Handshake error: {}", conn.peer, e);
            } else {
                error!(target: "tls", "{}: Session error: {}", conn.peer, e);
            }
            conn.error.get_or_insert(Error::Tls(e));
            r.close_connection(id);
        }
        Ok((handshake_done, plaintext)) => {
            if handshake_done {
                handshake_completed(r, id);
            }
            if plaintext > 0 {
                read_plaintext(r, id);
            }
            finish_events(r, id);
        }
    }
}

fn handshake_completed(r: &mut Reactor, id: ConnectionId) {
    let arm = {
        let Some(conn) = r.conns.get_mut(&id) else { return };
        if conn.phase != Phase::Handshaking {
            return;
        }
        conn.phase = Phase::Open;
        debug!(target: "tls", "{}: Session established", conn.peer);
        // Writes queued during the handshake flush now.
        if !conn.write_queue.is_empty() && !conn.writing {
            conn.writing = true;
            true
        } else {
            false
        }
    };
    if arm {
        r.set_write_interest(id, true);
    }
}

fn read_plaintext(r: &mut Reactor, id: ConnectionId) {
    loop {
        let got = {
            let Some(conn) = r.conns.get_mut(&id) else { return };
            let deliver = conn.phase == Phase::Open;
            conn.read_buf.normalize();
            conn.read_buf.ensure_free_space(READ_CHUNK);
            let Stream::Tls(tls) = &mut conn.stream else { return };
            match tls.session.reader().read(conn.read_buf.write_slice()) {
                Ok(0) => return,
                Ok(n) => {
                    conn.read_buf.write_completed(n);
                    if !deliver {
                        // Close already requested; swallow the bytes.
                        let active = conn.read_buf.active_size();
                        conn.read_buf.read_completed(active);
                        false
                    } else {
                        true
                    }
                }
                Err(_) => return,
            }
        };
        if got {
            r.deliver_data(id);
        }
    }
}

/// Act on shutdown conditions noticed by `process`, then keep the
/// transport moving.
fn finish_events(r: &mut Reactor, id: ConnectionId) {
    let (phase, peer_closed, peer_eof, aborting) = {
        let Some(conn) = r.conns.get(&id) else { return };
        let Stream::Tls(tls) = &conn.stream else { return };
        (conn.phase, tls.peer_closed, tls.peer_eof, conn.aborting())
    };

    match phase {
        Phase::Handshaking => {
            if peer_closed || peer_eof {
                let Some(conn) = r.conns.get_mut(&id) else { return };
                let e = io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed during handshake",
                );
                error!(target: "tls", "{}: Handshake error: {}", conn.peer, e);
                conn.error.get_or_insert(Error::from(e));
                r.close_connection(id);
                return;
            }
        }
        Phase::Open => {
            if peer_closed {
                // Clean closure from the peer; answer with our own
                // close_notify, then close.
                if let Some(conn) = r.conns.get_mut(&id) {
                    conn.error.get_or_insert(Error::ConnectionDone);
                }
                start_shutdown(r, id);
                return;
            }
            if peer_eof {
                // Transport died without close_notify: the TLS short
                // read. Reclassified as a clean EOF, never logged.
                if let Some(conn) = r.conns.get_mut(&id) {
                    conn.error.get_or_insert(Error::ConnectionDone);
                }
                r.close_connection(id);
                return;
            }
        }
        Phase::Draining => {
            if peer_closed || peer_eof {
                if let Some(conn) = r.conns.get_mut(&id) {
                    conn.error.get_or_insert(Error::ConnectionDone);
                }
                r.close_connection(id);
                return;
            }
        }
        Phase::ShuttingDown => {
            try_finish_shutdown(r, id);
            return;
        }
        Phase::Connecting | Phase::Closed => return,
    }

    // After an abort no further TLS bytes leave the socket.
    if !aborting {
        flush_transport(r, id);
    }
}

/// Move pending ciphertext from the session to the socket and keep the
/// write interest consistent.
pub(crate) fn flush_transport(r: &mut Reactor, id: ConnectionId) {
    let outcome = {
        let Some(conn) = r.conns.get_mut(&id) else { return };
        let Stream::Tls(tls) = &mut conn.stream else { return };
        loop {
            if !tls.session.wants_write() {
                break Ok(false);
            }
            match tls.session.write_tls(&mut tls.sock) {
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(true),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(e),
            }
        }
    };

    match outcome {
        Ok(pending) => {
            let want = {
                let Some(conn) = r.conns.get_mut(&id) else { return };
                let queued = !conn.write_queue.is_empty()
                    && matches!(conn.phase, Phase::Open | Phase::Draining);
                let want = pending || queued;
                conn.writing = want;
                want
            };
            r.set_write_interest(id, want);
        }
        Err(e) => {
            let Some(conn) = r.conns.get_mut(&id) else { return };
            let quiet = conn.phase == Phase::ShuttingDown
                && matches!(
                    e.kind(),
                    io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
                );
            if quiet {
                // The peer tore the transport down before reading our
                // close_notify; same interop rule as the short read.
                conn.error.get_or_insert(Error::ConnectionDone);
            } else {
                error!(target: "tls", "{}: Write error {:?}: {}", conn.peer, e.kind(), e);
                conn.error.get_or_insert(Error::from(e));
            }
            r.close_connection(id);
        }
    }
}

/// Flush user bytes: queue → session → socket.
fn flush_app_writes(r: &mut Reactor, id: ConnectionId) {
    {
        let Some(conn) = r.conns.get_mut(&id) else { return };
        if conn.aborting() {
            return;
        }
        coalesce(&mut conn.write_queue);
        let Stream::Tls(tls) = &mut conn.stream else { return };
        while let Some(head) = conn.write_queue.front_mut() {
            match tls.session.writer().write(head.read_slice()) {
                Ok(0) => break,
                Ok(n) => {
                    head.read_completed(n);
                    if head.active_size() == 0 {
                        conn.write_queue.pop_front();
                    }
                }
                Err(_) => break,
            }
        }
    }
    flush_transport(r, id);

    let shutdown = {
        match r.conns.get(&id) {
            Some(conn) => match &conn.stream {
                Stream::Tls(tls) => {
                    conn.phase == Phase::Draining
                        && conn.write_queue.is_empty()
                        && !tls.session.wants_write()
                }
                _ => false,
            },
            None => return,
        }
    };
    if shutdown {
        start_shutdown(r, id);
    }
}

/// Begin (or continue) the close_notify exchange.
pub(crate) fn start_shutdown(r: &mut Reactor, id: ConnectionId) {
    {
        let Some(conn) = r.conns.get_mut(&id) else { return };
        let Stream::Tls(tls) = &mut conn.stream else { return };
        if !tls.sent_close_notify {
            tls.session.send_close_notify();
            tls.sent_close_notify = true;
        }
        conn.phase = Phase::ShuttingDown;
    }
    flush_transport(r, id);
    try_finish_shutdown(r, id);
}

/// Close once our close_notify is flushed and, for a graceful close, the
/// peer has answered (with a close_notify or by closing the transport).
fn try_finish_shutdown(r: &mut Reactor, id: ConnectionId) {
    let done = {
        let Some(conn) = r.conns.get(&id) else { return };
        if conn.phase != Phase::ShuttingDown {
            return;
        }
        let Stream::Tls(tls) = &conn.stream else { return };
        let flushed = !tls.session.wants_write();
        flushed && (conn.aborting() || tls.peer_closed || tls.peer_eof)
    };
    if done {
        r.close_connection(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_temp(dir: &tempfile::TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_server_context_requires_cert_and_key() {
        let err = TlsContext::new(&TlsOptions::server()).unwrap_err();
        assert!(matches!(err, Error::Tls(_)));
    }

    #[test]
    fn test_server_context_from_generated_cert() {
        let dir = tempfile::tempdir().unwrap();
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let cert_path = write_temp(&dir, "cert.pem", &cert.cert.pem());
        let key_path = write_temp(&dir, "key.pem", &cert.key_pair.serialize_pem());

        let options = TlsOptions::server()
            .with_cert_file(&cert_path)
            .with_key_file(&key_path);
        let context = TlsContext::new(&options).unwrap();
        assert!(context.is_server_side());
        context.server_session().unwrap();
        assert!(context.client_session("localhost").is_err());
    }

    #[test]
    fn test_client_context_without_verification() {
        let options = TlsOptions::client();
        let context = TlsContext::new(&options).unwrap();
        assert!(!context.is_server_side());
        context.client_session("localhost").unwrap();
        context.client_session("127.0.0.1").unwrap();
        assert!(context.server_session().is_err());
    }

    #[test]
    fn test_client_context_with_ca_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let ca_path = write_temp(&dir, "ca.pem", &cert.cert.pem());

        let options = TlsOptions::client()
            .with_verify_mode(VerifyMode::Required)
            .with_verify_file(&ca_path)
            .with_check_host("localhost");
        TlsContext::new(&options).unwrap();
    }

    #[test]
    fn test_garbage_cert_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = write_temp(&dir, "cert.pem", "not a certificate");
        let key_path = write_temp(&dir, "key.pem", "not a key");

        let options = TlsOptions::server()
            .with_cert_file(&cert_path)
            .with_key_file(&key_path);
        assert!(TlsContext::new(&options).is_err());
    }
}
