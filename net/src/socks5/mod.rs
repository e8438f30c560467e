//! Tunnel a [Transport] through a SOCKS5 proxy.
//!
//! [Socks5] decorates a transport connected (or connecting) to the proxy.
//! It intercepts the underlying connect and data events, negotiates the
//! "no authentication" method, issues a CONNECT for the configured target and
//! only then reports `connect` to its own handler. From that point on it is
//! transparent: data and sends pass through untouched.
//!
//! ```txt
//! AwaitingConnect -> GreetingSent -> RequestSent -> ReplyReceived -> Connected
//!        \________________\_______________\______________\______> Closed
//! ```
//!
//! Any error (reported by the underlying transport or detected while parsing
//! the handshake) moves the tunnel to [State::Closed] and is delivered to the
//! error handler. The underlying transport is left open until [Socks5::close]
//! (or [Transport::close]) is called.

use crate::{
    transport::{ConnectFn, DataFn, ErrorFn, FlushFn, Handlers, SharedBuffer, SslFn},
    Error, Settings, Transport,
};
use bytes::Bytes;
use libight_buffer::ByteBuffer;
use std::{
    cell::{Cell, RefCell},
    rc::{Rc, Weak},
    time::Duration,
};
use tracing::{debug, trace};

pub mod wire;
use wire::{Address, ProtocolViolation, METHOD_SELECTION_LEN, REPLY_HEADER_LEN};

/// Configuration for a [Socks5] tunnel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Host of the proxy (used only for reporting, the underlying transport
    /// is already pointed at it).
    pub proxy_address: String,

    /// Port of the proxy.
    pub proxy_port: u16,

    /// Destination the proxy should connect to.
    pub target_address: Address,

    /// Destination port.
    pub target_port: u16,
}

impl Config {
    /// Tunnel through `proxy_address:proxy_port` to `target_address:target_port`.
    pub fn new(
        proxy_address: impl Into<String>,
        proxy_port: u16,
        target_address: Address,
        target_port: u16,
    ) -> Self {
        Self {
            proxy_address: proxy_address.into(),
            proxy_port,
            target_address,
            target_port,
        }
    }
}

impl TryFrom<&Settings> for Config {
    type Error = Error;

    /// Read `socks5_address`, `socks5_port`, `address` and `port`.
    fn try_from(settings: &Settings) -> Result<Self, Error> {
        let proxy_address = settings.require("socks5_address")?;
        let proxy_port = settings.parse_required("socks5_port")?;
        let address = settings.require("address")?;
        let target_address = Address::parse(address).ok_or_else(|| Error::InvalidSetting {
            key: "address",
            value: address.to_owned(),
        })?;
        let target_port = settings.parse_required("port")?;
        Ok(Self::new(proxy_address, proxy_port, target_address, target_port))
    }
}

/// Handshake progress of a [Socks5] tunnel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Waiting for the underlying transport to connect to the proxy.
    AwaitingConnect,
    /// Greeting sent, waiting for the method selection.
    GreetingSent,
    /// CONNECT sent, waiting for the fixed part of the reply.
    RequestSent,
    /// Reply accepted, waiting for the bound address and port.
    ReplyReceived { address_type: u8 },
    /// Tunnel established.
    Connected,
    /// Failed or closed. Terminal.
    Closed,
}

struct Inner {
    conn: Rc<dyn Transport>,
    config: Config,
    state: Cell<State>,
    closed: Cell<bool>,

    // Handshake bytes received but not yet parsed
    handshake: RefCell<ByteBuffer>,

    // Bytes sent before the tunnel was established
    pending: RefCell<ByteBuffer>,

    handlers: Handlers,
}

impl Inner {
    fn handle_connect(&self) {
        let state = self.state.get();
        if state != State::AwaitingConnect {
            debug!(?state, "ignoring unexpected connect");
            return;
        }
        debug!(
            proxy = %self.config.proxy_address,
            port = self.config.proxy_port,
            "connected to proxy"
        );
        self.state.set(State::GreetingSent);
        if let Err(err) = self.conn.send(Bytes::from_static(&wire::GREETING)) {
            self.fail(err);
        }
    }

    fn handle_data(&self, data: SharedBuffer) {
        match self.state.get() {
            State::Connected => {
                trace!(len = data.borrow().len(), "passing through");
                self.handlers.emit_data(data);
            }
            State::Closed => {
                trace!(len = data.borrow().len(), "dropping data after close");
                data.borrow_mut().clear();
            }
            State::AwaitingConnect => self.fail(ProtocolViolation::DataBeforeConnect.into()),
            _ => {
                self.handshake.borrow_mut().append(&mut data.borrow_mut());
                if let Err(err) = self.advance() {
                    self.fail(err);
                    return;
                }
                if self.state.get() == State::Connected {
                    self.connected(data);
                }
            }
        }
    }

    fn handle_error(&self, err: Error) {
        self.fail(err);
    }

    fn handle_flush(&self) {
        if self.state.get() == State::Connected {
            self.handlers.emit_flush();
        }
    }

    /// Consume as much of the handshake as has arrived.
    fn advance(&self) -> Result<(), Error> {
        let mut handshake = self.handshake.borrow_mut();
        loop {
            match self.state.get() {
                State::GreetingSent => {
                    let Some(selection) = handshake.readn(METHOD_SELECTION_LEN) else {
                        return Ok(());
                    };
                    wire::check_method_selection(&selection)?;
                    if !handshake.is_empty() {
                        return Err(ProtocolViolation::UnexpectedBytes(handshake.len()).into());
                    }
                    debug!(
                        destination = %self.config.target_address,
                        port = self.config.target_port,
                        "method accepted, sending connect request"
                    );
                    self.state.set(State::RequestSent);
                    self.conn.send(wire::connect_request(
                        &self.config.target_address,
                        self.config.target_port,
                    )?)?;
                }
                State::RequestSent => {
                    let Some(header) = handshake.readn(REPLY_HEADER_LEN) else {
                        return Ok(());
                    };
                    let address_type = wire::check_reply_header(&header)?;
                    self.state.set(State::ReplyReceived { address_type });
                }
                State::ReplyReceived { address_type } => {
                    let Some(len) = wire::bound_len(address_type, &handshake)? else {
                        return Ok(());
                    };
                    let Some(bound) = handshake.readn(len) else {
                        return Ok(());
                    };
                    if let Some((address, port)) = wire::decode_bound(address_type, &bound) {
                        debug!(bound = %address, port, "tunnel established");
                    }
                    self.state.set(State::Connected);
                    return Ok(());
                }
                _ => return Ok(()),
            }
        }
    }

    fn connected(&self, data: SharedBuffer) {
        // Anything sent while handshaking goes out before the caller hears about it
        let flushed = self.conn.send_buffer(&mut self.pending.borrow_mut());
        if let Err(err) = flushed {
            self.fail(err);
            return;
        }
        self.handlers.emit_connect();

        // Bytes that trailed the reply belong to the tunnel
        if self.state.get() != State::Connected || self.handshake.borrow().is_empty() {
            return;
        }
        data.borrow_mut().append(&mut self.handshake.borrow_mut());
        self.handlers.emit_data(data);
    }

    fn fail(&self, err: Error) {
        let state = self.state.replace(State::Closed);
        self.handshake.borrow_mut().clear();
        self.pending.borrow_mut().clear();
        if state == State::Closed {
            trace!(?err, "dropping error after close");
            return;
        }
        debug!(?state, ?err, "tunnel failed");
        self.handlers.emit_error(err);
    }
}

/// A [Transport] tunneled through a SOCKS5 proxy.
///
/// Clones share the same tunnel.
#[derive(Clone)]
pub struct Socks5 {
    inner: Rc<Inner>,
}

impl Socks5 {
    /// Wrap `conn` using the proxy and target found in `settings`.
    pub fn new(conn: Rc<dyn Transport>, settings: &Settings) -> Result<Self, Error> {
        Ok(Self::with_config(conn, Config::try_from(settings)?))
    }

    /// Wrap `conn`, which must be connected (or connecting) to the proxy.
    pub fn with_config(conn: Rc<dyn Transport>, config: Config) -> Self {
        let inner = Rc::new(Inner {
            conn,
            config,
            state: Cell::new(State::AwaitingConnect),
            closed: Cell::new(false),
            handshake: RefCell::new(ByteBuffer::new()),
            pending: RefCell::new(ByteBuffer::new()),
            handlers: Handlers::default(),
        });

        // The underlying transport must not keep the tunnel alive
        let weak: Weak<Inner> = Rc::downgrade(&inner);
        inner.conn.on_connect(Box::new({
            let weak = weak.clone();
            move || {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_connect();
                }
            }
        }));
        inner.conn.on_data(Box::new({
            let weak = weak.clone();
            move |data| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_data(data);
                }
            }
        }));
        inner.conn.on_error(Box::new({
            let weak = weak.clone();
            move |err| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_error(err);
                }
            }
        }));
        inner.conn.on_flush(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.handle_flush();
            }
        }));

        Self { inner }
    }

    /// Current handshake state.
    pub fn state(&self) -> State {
        self.inner.state.get()
    }

    /// Configuration the tunnel was created with.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }
}

impl Transport for Socks5 {
    fn on_connect(&self, handler: ConnectFn) {
        self.inner.handlers.on_connect(handler);
    }

    fn on_data(&self, handler: DataFn) {
        self.inner.handlers.on_data(handler);
    }

    fn on_error(&self, handler: ErrorFn) {
        self.inner.handlers.on_error(handler);
    }

    fn on_flush(&self, handler: FlushFn) {
        self.inner.handlers.on_flush(handler);
    }

    fn on_ssl(&self, handler: SslFn) {
        self.inner.conn.on_ssl(handler);
    }

    fn emit_connect(&self) {
        self.inner.conn.emit_connect();
    }

    fn emit_data(&self, data: SharedBuffer) {
        self.inner.conn.emit_data(data);
    }

    fn emit_error(&self, err: Error) {
        self.inner.conn.emit_error(err);
    }

    fn emit_flush(&self) {
        self.inner.conn.emit_flush();
    }

    fn send(&self, data: Bytes) -> Result<(), Error> {
        match self.inner.state.get() {
            State::Closed => Err(Error::Closed),
            State::Connected => self.inner.conn.send(data),
            state => {
                trace!(?state, len = data.len(), "queueing until connected");
                self.inner.pending.borrow_mut().write_bytes(data);
                Ok(())
            }
        }
    }

    fn set_timeout(&self, timeout: Duration) {
        self.inner.conn.set_timeout(timeout);
    }

    fn clear_timeout(&self) {
        self.inner.conn.clear_timeout();
    }

    fn close(&self) {
        if self.inner.closed.replace(true) {
            return;
        }
        debug!(state = ?self.inner.state.get(), "closing tunnel");
        self.inner.state.set(State::Closed);
        self.inner.handshake.borrow_mut().clear();
        self.inner.pending.borrow_mut().clear();
        self.inner.handlers.clear();
        self.inner.conn.close();
    }

    fn is_closed(&self) -> bool {
        self.inner.state.get() == State::Closed
    }

    fn socks5_address(&self) -> Option<&str> {
        Some(&self.inner.config.proxy_address)
    }

    fn socks5_port(&self) -> Option<u16> {
        Some(self.inner.config.proxy_port)
    }
}
