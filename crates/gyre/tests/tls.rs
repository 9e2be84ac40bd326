//! TLS transport: handshake, shutdown, verification.

mod common;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use common::*;
use gyre::{Error, Reactor, TlsContext, TlsOptions, VerifyMode};

fn stop_when_both(a: Shared, b: Shared) -> impl FnMut(&mut Reactor) {
    move |reactor| {
        if a.borrow().lost_once() && b.borrow().lost_once() {
            let _ = reactor.stop();
        }
    }
}

struct CertFiles {
    _dir: tempfile::TempDir,
    cert: PathBuf,
    key: PathBuf,
}

fn localhost_cert() -> CertFiles {
    let dir = tempfile::tempdir().unwrap();
    let cert = rcgen::generate_simple_self_signed(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
    ])
    .unwrap();
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    fs::write(&cert_path, cert.cert.pem()).unwrap();
    fs::write(&key_path, cert.key_pair.serialize_pem()).unwrap();
    CertFiles { _dir: dir, cert: cert_path, key: key_path }
}

fn server_context(files: &CertFiles) -> Arc<TlsContext> {
    TlsContext::new(
        &TlsOptions::server()
            .with_cert_file(&files.cert)
            .with_key_file(&files.key),
    )
    .unwrap()
}

fn trusting_client_context() -> Arc<TlsContext> {
    TlsContext::new(&TlsOptions::client()).unwrap()
}

#[test]
fn test_tls_echo_with_greeting_queued_during_handshake() {
    init_logging();
    let files = localhost_cert();
    let mut reactor = Reactor::new().unwrap();

    let server = shared();
    let client = shared();

    // The greeting is written from make_connection, while the handshake
    // is still in flight; it must arrive only after session establishment.
    let server_protocol = Recorder::new(server.clone())
        .on_connect(|reactor, conn| reactor.write(conn, b"hello"))
        .on_lost(stop_when_both(client.clone(), server.clone()))
        .boxed();
    let listener = reactor
        .listen_tls(
            "127.0.0.1",
            "0",
            Box::new(TestFactory::new(server_protocol)),
            server_context(&files),
        )
        .unwrap();
    let port = reactor.listener_address(listener).unwrap().port();

    let received = client.clone();
    let client_protocol = Recorder::new(client.clone())
        .on_data(move |reactor, conn, _| {
            if received.borrow().data.len() >= 5 {
                reactor.write(conn, b"ping");
                reactor.lose_connection(conn);
            }
        })
        .on_lost(stop_when_both(client.clone(), server.clone()))
        .boxed();
    reactor
        .connect_tls(
            "127.0.0.1",
            &port.to_string(),
            Box::new(TestFactory::new(client_protocol)),
            trusting_client_context(),
            5.0,
            None,
        )
        .unwrap();

    watchdog(&mut reactor, 5.0);
    reactor.run().unwrap();

    assert_eq!(client.borrow().data, b"hello");
    assert_eq!(server.borrow().data, b"ping");
    assert!(client.borrow().lost_once_with_done());
    assert!(server.borrow().lost_once_with_done());
}

#[test]
fn test_tls_abort_during_handshake() {
    init_logging();
    let files = localhost_cert();
    let mut reactor = Reactor::new().unwrap();

    let server = shared();
    let client = shared();

    let server_protocol = Recorder::new(server.clone())
        .on_lost(stop_when_both(client.clone(), server.clone()))
        .boxed();
    let listener = reactor
        .listen_tls(
            "127.0.0.1",
            "0",
            Box::new(TestFactory::new(server_protocol)),
            server_context(&files),
        )
        .unwrap();
    let port = reactor.listener_address(listener).unwrap().port();

    // make_connection fires with the socket up but the handshake still
    // pending; the abort cancels it before any TLS byte is sent.
    let client_protocol = Recorder::new(client.clone())
        .on_connect(|reactor, conn| reactor.abort_connection(conn))
        .on_lost(stop_when_both(client.clone(), server.clone()))
        .boxed();
    let factory = TestFactory::new(client_protocol);
    let log = factory.log();
    reactor
        .connect_tls(
            "127.0.0.1",
            &port.to_string(),
            Box::new(factory),
            trusting_client_context(),
            5.0,
            None,
        )
        .unwrap();

    watchdog(&mut reactor, 5.0);
    reactor.run().unwrap();

    let client = client.borrow();
    assert!(client.lost_once());
    assert!(client.lost[0].is_abort());
    assert!(client.data.is_empty());
    assert_eq!(log.borrow().client_lost.len(), 1);
    assert!(log.borrow().client_lost[0].is_abort());

    // The server saw a dead socket mid-handshake, never a protocol event.
    let server = server.borrow();
    assert!(server.lost_once());
    assert!(server.lost[0].as_io().is_some());
    assert!(server.data.is_empty());
}

#[test]
fn test_tls_verified_against_ca_bundle() {
    init_logging();
    let files = localhost_cert();
    let mut reactor = Reactor::new().unwrap();

    let server = shared();
    let client = shared();

    let server_protocol = echo_protocol(server.clone());
    let listener = reactor
        .listen_tls(
            "127.0.0.1",
            "0",
            Box::new(TestFactory::new(server_protocol)),
            server_context(&files),
        )
        .unwrap();
    let port = reactor.listener_address(listener).unwrap().port();

    let context = TlsContext::new(
        &TlsOptions::client()
            .with_verify_mode(VerifyMode::Required)
            .with_verify_file(&files.cert)
            .with_check_host("localhost"),
    )
    .unwrap();

    let received = client.clone();
    let client_protocol = Recorder::new(client.clone())
        .on_connect(|reactor, conn| reactor.write(conn, b"secure"))
        .on_data(move |reactor, conn, _| {
            if received.borrow().data.len() >= 6 {
                reactor.lose_connection(conn);
            }
        })
        .on_lost(move |reactor| {
            let _ = reactor.stop();
        })
        .boxed();
    reactor
        .connect_tls(
            "127.0.0.1",
            &port.to_string(),
            Box::new(TestFactory::new(client_protocol)),
            context,
            5.0,
            None,
        )
        .unwrap();

    watchdog(&mut reactor, 5.0);
    reactor.run().unwrap();

    assert_eq!(client.borrow().data, b"secure");
    assert!(client.borrow().lost_once_with_done());
}

#[test]
fn test_tls_check_host_mismatch_fails_handshake() {
    init_logging();
    let files = localhost_cert();
    let mut reactor = Reactor::new().unwrap();

    let server = shared();
    let client = shared();

    let server_protocol = Recorder::new(server.clone())
        .on_lost(stop_when_both(client.clone(), server.clone()))
        .boxed();
    let listener = reactor
        .listen_tls(
            "127.0.0.1",
            "0",
            Box::new(TestFactory::new(server_protocol)),
            server_context(&files),
        )
        .unwrap();
    let port = reactor.listener_address(listener).unwrap().port();

    let context = TlsContext::new(
        &TlsOptions::client()
            .with_verify_mode(VerifyMode::Required)
            .with_verify_file(&files.cert)
            .with_check_host("example.com"),
    )
    .unwrap();

    let client_protocol = Recorder::new(client.clone())
        .on_lost(stop_when_both(client.clone(), server.clone()))
        .boxed();
    reactor
        .connect_tls(
            "127.0.0.1",
            &port.to_string(),
            Box::new(TestFactory::new(client_protocol)),
            context,
            5.0,
            None,
        )
        .unwrap();

    watchdog(&mut reactor, 5.0);
    reactor.run().unwrap();

    let client = client.borrow();
    assert!(client.lost_once());
    assert!(matches!(client.lost[0], Error::Tls(_)));
    assert!(client.data.is_empty());
    assert!(server.borrow().lost_once());
    assert!(server.borrow().data.is_empty());
}

#[test]
fn test_tls_abort_after_establishment() {
    init_logging();
    let files = localhost_cert();
    let mut reactor = Reactor::new().unwrap();

    let server = shared();
    let client = shared();

    let server_protocol = Recorder::new(server.clone())
        .on_connect(|reactor, conn| reactor.write(conn, b"hello"))
        .on_lost(stop_when_both(client.clone(), server.clone()))
        .boxed();
    let listener = reactor
        .listen_tls(
            "127.0.0.1",
            "0",
            Box::new(TestFactory::new(server_protocol)),
            server_context(&files),
        )
        .unwrap();
    let port = reactor.listener_address(listener).unwrap().port();

    let client_protocol = Recorder::new(client.clone())
        .on_data(|reactor, conn, _| {
            reactor.write(conn, b"never sent");
            reactor.abort_connection(conn);
        })
        .on_lost(stop_when_both(client.clone(), server.clone()))
        .boxed();
    reactor
        .connect_tls(
            "127.0.0.1",
            &port.to_string(),
            Box::new(TestFactory::new(client_protocol)),
            trusting_client_context(),
            5.0,
            None,
        )
        .unwrap();

    watchdog(&mut reactor, 5.0);
    reactor.run().unwrap();

    let client = client.borrow();
    assert!(client.lost_once());
    assert!(client.lost[0].is_abort());
    // The abort discarded the queued plaintext.
    assert!(server.borrow().data.is_empty());
    assert!(server.borrow().lost_once_with_done());
}
