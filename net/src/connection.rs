//! A [Transport] over a TCP socket driven by [tokio].
//!
//! Each [Connection] is served by a single task spawned with
//! [tokio::task::spawn_local], so it must be created inside a
//! [tokio::task::LocalSet]. The task resolves and connects to the configured
//! endpoint, then shuttles bytes between the socket and the connection's
//! buffers, upcalling into the registered handlers as it goes.

use crate::{
    transport::{ConnectFn, DataFn, ErrorFn, FlushFn, Handlers, SharedBuffer, SslFn},
    Error, Settings, Transport,
};
use bytes::Bytes;
use libight_buffer::ByteBuffer;
use std::{
    cell::{Cell, RefCell},
    future::pending,
    io,
    rc::Rc,
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    net::{lookup_host, TcpStream},
    select,
    sync::Notify,
    task::{spawn_local, JoinHandle},
    time::{sleep, timeout},
};
use tracing::{debug, trace, warn};

/// Configuration for a [Connection].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Host name or IP literal to connect to.
    pub address: String,

    /// Port to connect to.
    pub port: u16,

    /// Whether or not to disable Nagle's algorithm.
    ///
    /// If `None`, the operating system default is kept.
    pub tcp_nodelay: Option<bool>,

    /// Maximum number of bytes read from the socket per read call.
    pub read_buffer_size: usize,

    /// Time allowed for resolution and connection before failing with
    /// [Error::Timeout].
    pub connect_timeout: Duration,
}

impl Config {
    /// Connect to `address:port` with default socket options.
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            tcp_nodelay: None,
            read_buffer_size: 64 * 1024, // 64 KB
            connect_timeout: Duration::from_secs(30),
        }
    }

    /// See [Config]
    pub const fn with_tcp_nodelay(mut self, tcp_nodelay: Option<bool>) -> Self {
        self.tcp_nodelay = tcp_nodelay;
        self
    }

    /// See [Config]
    pub const fn with_read_buffer_size(mut self, read_buffer_size: usize) -> Self {
        self.read_buffer_size = read_buffer_size;
        self
    }

    /// See [Config]
    pub const fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Override socket options with `tcp_nodelay`, `read_buffer_size` and
    /// `connect_timeout` (in seconds) if present in `settings`.
    pub fn with_settings(mut self, settings: &Settings) -> Result<Self, Error> {
        if let Some(tcp_nodelay) = settings.parse("tcp_nodelay")? {
            self.tcp_nodelay = Some(tcp_nodelay);
        }
        if let Some(read_buffer_size) = settings.parse::<usize>("read_buffer_size")? {
            if read_buffer_size == 0 {
                return Err(Error::InvalidSetting {
                    key: "read_buffer_size",
                    value: read_buffer_size.to_string(),
                });
            }
            self.read_buffer_size = read_buffer_size;
        }
        if let Some(secs) = settings.parse::<f64>("connect_timeout")? {
            self.connect_timeout =
                Duration::try_from_secs_f64(secs).map_err(|_| Error::InvalidSetting {
                    key: "connect_timeout",
                    value: secs.to_string(),
                })?;
        }
        Ok(self)
    }
}

impl TryFrom<&Settings> for Config {
    type Error = Error;

    fn try_from(settings: &Settings) -> Result<Self, Error> {
        let address = settings.require("address")?;
        let port = settings.parse_required("port")?;
        Self::new(address, port).with_settings(settings)
    }
}

struct Inner {
    config: Config,
    handlers: Handlers,

    // Set by close
    closed: Cell<bool>,

    // Set once the task has exited
    done: Cell<bool>,

    incoming: SharedBuffer,
    outgoing: RefCell<ByteBuffer>,
    idle: Cell<Option<Duration>>,
    wake: Notify,
    task: RefCell<Option<JoinHandle<()>>>,
}

impl Inner {
    fn fail(&self, err: Error) {
        self.done.set(true);
        self.outgoing.borrow_mut().clear();
        if self.closed.get() {
            trace!(?err, "dropping error after close");
            return;
        }
        debug!(
            address = %self.config.address,
            port = self.config.port,
            ?err,
            "connection failed"
        );
        self.handlers.emit_error(err);
    }
}

/// A [Transport] over a TCP socket.
pub struct Connection {
    inner: Rc<Inner>,
}

impl Connection {
    /// Start connecting to the endpoint in `config`.
    ///
    /// Sends issued before the connection is established are written once it
    /// is.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a [tokio::task::LocalSet].
    pub fn new(config: Config) -> Self {
        let inner = Rc::new(Inner {
            config,
            handlers: Handlers::default(),
            closed: Cell::new(false),
            done: Cell::new(false),
            incoming: SharedBuffer::default(),
            outgoing: RefCell::new(ByteBuffer::new()),
            idle: Cell::new(None),
            wake: Notify::new(),
            task: RefCell::new(None),
        });
        let task = spawn_local(run(inner.clone()));
        *inner.task.borrow_mut() = Some(task);
        Self { inner }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run(inner: Rc<Inner>) {
    let stream = match connect(&inner.config).await {
        Ok(stream) => stream,
        Err(err) => return inner.fail(err),
    };
    if let Some(tcp_nodelay) = inner.config.tcp_nodelay {
        if let Err(err) = stream.set_nodelay(tcp_nodelay) {
            warn!(?err, "failed to set TCP_NODELAY");
        }
    }
    debug!(peer = ?stream.peer_addr().ok(), "connected");
    inner.handlers.emit_connect();

    if let Err(err) = pump(&inner, stream).await {
        inner.fail(err);
    }
}

/// Resolve the configured endpoint and connect to the first address that accepts.
async fn connect(config: &Config) -> Result<TcpStream, Error> {
    let host = config.address.trim_start_matches('[').trim_end_matches(']');
    let attempt = async {
        let addresses = lookup_host((host, config.port))
            .await
            .map_err(|err| Error::ResolveFailed(format!("{host}: {err}")))?;
        let mut last = None;
        for address in addresses {
            match TcpStream::connect(address).await {
                Ok(stream) => return Ok::<_, Error>(stream),
                Err(err) => {
                    debug!(?address, ?err, "connect attempt failed");
                    last = Some(err);
                }
            }
        }
        Err(match last {
            Some(err) => Error::ConnectionFailed(err),
            None => Error::ResolveFailed(format!("{host}: no addresses")),
        })
    };
    timeout(config.connect_timeout, attempt)
        .await
        .map_err(|_| Error::Timeout)?
}

/// Wait out the idle timeout (if one is armed).
async fn expire(idle: Option<Duration>) {
    match idle {
        Some(idle) => sleep(idle).await,
        None => pending().await,
    }
}

/// Move bytes between the socket and the connection until it fails or closes.
async fn pump(inner: &Inner, mut stream: TcpStream) -> Result<(), Error> {
    let (mut reader, mut writer) = stream.split();
    let mut chunk = vec![0; inner.config.read_buffer_size];
    let mut in_flight = ByteBuffer::new();
    loop {
        if inner.closed.get() {
            return Ok(());
        }

        // Pick up anything queued since the last write
        if in_flight.is_empty() {
            in_flight.append(&mut inner.outgoing.borrow_mut());
        }
        let writing = !in_flight.is_empty();

        select! {
            read = reader.read(&mut chunk) => {
                let n = read?;
                if n == 0 {
                    return Err(Error::Eof);
                }
                trace!(n, "received");
                inner.incoming.borrow_mut().write(&chunk[..n])?;
                inner.handlers.emit_data(inner.incoming.clone());
            },
            written = writer.write_buf(&mut in_flight), if writing => {
                let n = written?;
                if n == 0 {
                    return Err(io::Error::from(io::ErrorKind::WriteZero).into());
                }
                trace!(n, "sent");
                if in_flight.is_empty() && inner.outgoing.borrow().is_empty() {
                    inner.handlers.emit_flush();
                }
            },
            _ = inner.wake.notified() => {},
            _ = expire(inner.idle.get()) => {
                return Err(Error::Timeout);
            },
        }
    }
}

impl Transport for Connection {
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
        self.inner.handlers.on_ssl(handler);
    }

    fn emit_connect(&self) {
        self.inner.handlers.emit_connect();
    }

    fn emit_data(&self, data: SharedBuffer) {
        self.inner.handlers.emit_data(data);
    }

    fn emit_error(&self, err: Error) {
        self.inner.handlers.emit_error(err);
    }

    fn emit_flush(&self) {
        self.inner.handlers.emit_flush();
    }

    fn send(&self, data: Bytes) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.inner.outgoing.borrow_mut().write_bytes(data);
        self.inner.wake.notify_one();
        Ok(())
    }

    fn set_timeout(&self, timeout: Duration) {
        self.inner.idle.set(Some(timeout));
        self.inner.wake.notify_one();
    }

    fn clear_timeout(&self) {
        self.inner.idle.set(None);
        self.inner.wake.notify_one();
    }

    fn close(&self) {
        if self.inner.closed.replace(true) {
            return;
        }
        debug!(address = %self.inner.config.address, port = self.inner.config.port, "closing");
        if let Some(task) = self.inner.task.borrow_mut().take() {
            task.abort();
        }
        self.inner.outgoing.borrow_mut().clear();
        self.inner.handlers.clear();
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.get() || self.inner.done.get()
    }
}
