//! Compose callback-driven transports for network measurements.
//!
//! A [Transport] reports what happens on a connection (`connect`, `data`,
//! `flush`, `error`) to a single registered handler per event and queues
//! outgoing bytes without blocking. Transports compose by decoration: a
//! [socks5::Socks5] wraps another transport connected to a proxy, runs the
//! SOCKS5 handshake over it and then behaves like a direct connection to the
//! target.
//!
//! Transports are single-threaded. They are shared through [std::rc::Rc] and
//! driven by the event loop that owns them ([connection::Connection] runs on
//! a [tokio::task::LocalSet]).
//!
//! # Status
//!
//! `libight-net` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.

use std::{io, rc::Rc};
use thiserror::Error;

pub mod connection;
pub mod mocks;
mod settings;
pub use settings::Settings;
pub mod socks5;
mod transport;
pub use transport::{
    ConnectFn, DataFn, ErrorFn, FlushFn, Handlers, SharedBuffer, Slot, SslFn, Transport,
};

use connection::Connection;
use socks5::{
    wire::{ProtocolViolation, Reply},
    Socks5,
};

/// Errors that can occur when interacting with a [Transport].
#[derive(Error, Debug)]
pub enum Error {
    #[error("buffer error: {0}")]
    Buffer(#[from] libight_buffer::Error),
    #[error("closed")]
    Closed,
    #[error("timeout")]
    Timeout,
    #[error("eof")]
    Eof,
    #[error("connection failed: {0}")]
    ConnectionFailed(io::Error),
    #[error("resolve failed: {0}")]
    ResolveFailed(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("missing setting: {0}")]
    MissingSetting(&'static str),
    #[error("invalid setting {key}: {value}")]
    InvalidSetting { key: &'static str, value: String },
    #[error("proxy protocol error: {0}")]
    ProxyProtocol(#[from] ProtocolViolation),
    #[error("proxy connect failed: {0}")]
    ProxyConnect(Reply),
}

/// Open a [Transport] to the `address` and `port` in `settings`.
///
/// If `socks5_address` is present, the connection goes to the proxy at
/// `socks5_address:socks5_port` and is tunneled to the target through it.
///
/// # Panics
///
/// Panics if called outside of a [tokio::task::LocalSet].
pub fn connect(settings: &Settings) -> Result<Rc<dyn Transport>, Error> {
    if !settings.contains("socks5_address") {
        let config = connection::Config::try_from(settings)?;
        return Ok(Rc::new(Connection::new(config)));
    }
    let config = socks5::Config::try_from(settings)?;
    let proxy = connection::Config::new(config.proxy_address.clone(), config.proxy_port)
        .with_settings(settings)?;
    let conn = Rc::new(Connection::new(proxy));
    Ok(Rc::new(Socks5::with_config(conn, config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use commonware_macros::test_traced;
    use tokio::{
        io::{AsyncReadExt as _, AsyncWriteExt as _},
        net::TcpListener,
        sync::mpsc::{unbounded_channel, UnboundedReceiver},
        task::LocalSet,
    };

    #[derive(Debug)]
    enum Event {
        Connect,
        Data(Bytes),
        Error(Error),
    }

    fn observe(transport: &dyn Transport) -> UnboundedReceiver<Event> {
        let (sender, receiver) = unbounded_channel();
        transport.on_connect(Box::new({
            let sender = sender.clone();
            move || {
                let _ = sender.send(Event::Connect);
            }
        }));
        transport.on_data(Box::new({
            let sender = sender.clone();
            move |data| {
                let data = data.borrow_mut().read_all();
                let _ = sender.send(Event::Data(data));
            }
        }));
        transport.on_error(Box::new(move |err| {
            let _ = sender.send(Event::Error(err));
        }));
        receiver
    }

    async fn recv_data(events: &mut UnboundedReceiver<Event>, len: usize) -> Vec<u8> {
        let mut received = Vec::new();
        while received.len() < len {
            match events.recv().await {
                Some(Event::Data(data)) => received.extend_from_slice(&data),
                event => panic!("unexpected event: {event:?}"),
            }
        }
        received
    }

    #[tokio::test]
    async fn test_connect_through_socks5() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_port = listener.local_addr().unwrap().port();
        let proxy = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            stream.write_all(&[0x05, 0x00]).await.unwrap();

            let mut request = [0u8; 10];
            stream.read_exact(&mut request).await.unwrap();
            assert_eq!(request, [0x05, 0x01, 0x00, 0x01, 10, 0, 0, 1, 0x00, 0x50]);
            let mut reply = vec![0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x04, 0x38];
            reply.extend_from_slice(b"hi");
            stream.write_all(&reply).await.unwrap();

            let mut ping = [0u8; 4];
            stream.read_exact(&mut ping).await.unwrap();
            assert_eq!(&ping, b"ping");
            stream.write_all(b"pong").await.unwrap();
        });

        LocalSet::new()
            .run_until(async move {
                let port = proxy_port.to_string();
                let settings = Settings::from([
                    ("socks5_address", "127.0.0.1"),
                    ("socks5_port", port.as_str()),
                    ("address", "10.0.0.1"),
                    ("port", "80"),
                    ("tcp_nodelay", "true"),
                ]);
                let transport = connect(&settings).unwrap();
                assert_eq!(transport.socks5_address(), Some("127.0.0.1"));
                assert_eq!(transport.socks5_port(), Some(proxy_port));
                let mut events = observe(&*transport);

                assert!(matches!(events.recv().await, Some(Event::Connect)));
                assert_eq!(recv_data(&mut events, 2).await, b"hi");
                transport.send_slice(b"ping").unwrap();
                assert_eq!(recv_data(&mut events, 4).await, b"pong");

                transport.close();
                assert!(transport.is_closed());
            })
            .await;
        proxy.await.unwrap();
    }

    #[tokio::test]
    async fn test_proxy_rejection_reaches_caller() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            stream.write_all(&[0x05, 0x00]).await.unwrap();
            let mut request = vec![0u8; 4 + 1 + 11 + 2];
            stream.read_exact(&mut request).await.unwrap();
            stream
                .write_all(&[0x05, 0x04, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        LocalSet::new()
            .run_until(async move {
                let port = proxy_port.to_string();
                let settings = Settings::from([
                    ("socks5_address", "127.0.0.1"),
                    ("socks5_port", port.as_str()),
                    ("address", "example.com"),
                    ("port", "443"),
                ]);
                let transport = connect(&settings).unwrap();
                let mut events = observe(&*transport);
                match events.recv().await {
                    Some(Event::Error(Error::ProxyConnect(Reply::HostUnreachable))) => {}
                    event => panic!("unexpected event: {event:?}"),
                }
                assert!(transport.is_closed());
                transport.close();
            })
            .await;
    }

    #[tokio::test]
    async fn test_connect_direct() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"banner\r\n").await.unwrap();
        });

        LocalSet::new()
            .run_until(async move {
                let port = port.to_string();
                let settings = Settings::from([("address", "127.0.0.1"), ("port", port.as_str())]);
                let transport = connect(&settings).unwrap();
                assert_eq!(transport.socks5_address(), None);
                let mut events = observe(&*transport);
                assert!(matches!(events.recv().await, Some(Event::Connect)));
                assert_eq!(recv_data(&mut events, 8).await, b"banner\r\n");
            })
            .await;
    }

    #[test_traced]
    fn test_connect_rejects_bad_settings() {
        let settings = Settings::from([("socks5_address", "127.0.0.1"), ("port", "80")]);
        assert!(matches!(
            connect(&settings),
            Err(Error::MissingSetting("socks5_port"))
        ));
        let settings = Settings::from([("address", "127.0.0.1"), ("port", "http")]);
        assert!(matches!(
            connect(&settings),
            Err(Error::InvalidSetting { key: "port", .. })
        ));
    }
}
