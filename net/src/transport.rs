use crate::Error;
use bytes::Bytes;
use libight_buffer::ByteBuffer;
use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    time::Duration,
};
use tracing::{trace, warn};

/// Buffer shared between a [Transport] and its data handler.
///
/// The handler should consume what it needs before returning: the transport
/// keeps appending to the same buffer on later reads.
pub type SharedBuffer = Rc<RefCell<ByteBuffer>>;

/// Handler invoked once a transport is connected.
pub type ConnectFn = Box<dyn FnMut()>;

/// Handler invoked when bytes are available.
pub type DataFn = Box<dyn FnMut(SharedBuffer)>;

/// Handler invoked when an asynchronous failure occurs.
pub type ErrorFn = Box<dyn FnMut(Error)>;

/// Handler invoked when every queued byte has been written.
pub type FlushFn = Box<dyn FnMut()>;

/// Handler invoked when a TLS session is established.
pub type SslFn = Box<dyn FnMut()>;

/// Single-subscriber event registration.
///
/// Registering a handler replaces the previous one. While a handler runs it
/// is taken out of the slot, so it may safely re-register, clear the slot or
/// call back into its transport. A handler replaced (or cleared) during its
/// own run is dropped once it returns.
pub struct Slot<F: ?Sized> {
    handler: RefCell<Option<Box<F>>>,
    generation: Cell<u64>,
}

impl<F: ?Sized> Default for Slot<F> {
    fn default() -> Self {
        Self {
            handler: RefCell::new(None),
            generation: Cell::new(0),
        }
    }
}

impl<F: ?Sized> Slot<F> {
    /// Register `handler`, replacing any previous registration.
    pub fn set(&self, handler: Box<F>) {
        *self.handler.borrow_mut() = Some(handler);
        self.generation.set(self.generation.get().wrapping_add(1));
    }

    /// Remove the registered handler (if any).
    pub fn clear(&self) {
        self.handler.borrow_mut().take();
        self.generation.set(self.generation.get().wrapping_add(1));
    }

    fn dispatch(&self, call: impl FnOnce(&mut F)) -> bool {
        let Some(mut handler) = self.handler.borrow_mut().take() else {
            return false;
        };
        let generation = self.generation.get();
        call(&mut *handler);
        if self.generation.get() == generation {
            *self.handler.borrow_mut() = Some(handler);
        }
        true
    }
}

impl Slot<dyn FnMut()> {
    /// Invoke the registered handler. Returns false if there is none.
    pub fn emit(&self) -> bool {
        self.dispatch(|handler| handler())
    }
}

impl<A> Slot<dyn FnMut(A)> {
    /// Invoke the registered handler with `arg`.
    ///
    /// If no handler is registered (or it is already running), `arg` is
    /// handed back.
    pub fn emit(&self, arg: A) -> Result<(), A> {
        let mut arg = Some(arg);
        self.dispatch(|handler| {
            if let Some(arg) = arg.take() {
                handler(arg);
            }
        });
        match arg {
            Some(arg) => Err(arg),
            None => Ok(()),
        }
    }
}

/// The set of handlers a [Transport] upcalls into.
#[derive(Default)]
pub struct Handlers {
    connect: Slot<dyn FnMut()>,
    data: Slot<dyn FnMut(SharedBuffer)>,
    error: Slot<dyn FnMut(Error)>,
    flush: Slot<dyn FnMut()>,
    ssl: Slot<dyn FnMut()>,
}

impl Handlers {
    pub fn on_connect(&self, handler: ConnectFn) {
        self.connect.set(handler);
    }

    pub fn on_data(&self, handler: DataFn) {
        self.data.set(handler);
    }

    pub fn on_error(&self, handler: ErrorFn) {
        self.error.set(handler);
    }

    pub fn on_flush(&self, handler: FlushFn) {
        self.flush.set(handler);
    }

    pub fn on_ssl(&self, handler: SslFn) {
        self.ssl.set(handler);
    }

    pub fn emit_connect(&self) {
        if !self.connect.emit() {
            trace!("connect dropped: no handler");
        }
    }

    pub fn emit_data(&self, data: SharedBuffer) {
        if let Err(data) = self.data.emit(data) {
            trace!(len = data.borrow().len(), "data left queued: no handler");
        }
    }

    pub fn emit_error(&self, err: Error) {
        if let Err(err) = self.error.emit(err) {
            warn!(?err, "error dropped: no handler");
        }
    }

    pub fn emit_flush(&self) {
        if !self.flush.emit() {
            trace!("flush dropped: no handler");
        }
    }

    pub fn emit_ssl(&self) {
        if !self.ssl.emit() {
            trace!("ssl dropped: no handler");
        }
    }

    /// Drop every registered handler.
    pub fn clear(&self) {
        self.connect.clear();
        self.data.clear();
        self.error.clear();
        self.flush.clear();
        self.ssl.clear();
    }
}

/// An asynchronous, callback-driven connection.
///
/// Every event kind has at most one handler; registering another replaces
/// it. Handlers run on the event loop thread, one event at a time, in the
/// order the underlying events occur. `send` never blocks: bytes are queued
/// and the flush handler fires once they have been written.
///
/// Failures detected synchronously (sending after `close`, for example) are
/// returned to the caller. Failures detected while handling I/O events
/// (timeouts, protocol violations, proxy rejections) are delivered to the
/// error handler.
pub trait Transport {
    fn on_connect(&self, handler: ConnectFn);
    fn on_data(&self, handler: DataFn);
    fn on_error(&self, handler: ErrorFn);
    fn on_flush(&self, handler: FlushFn);
    fn on_ssl(&self, handler: SslFn);

    /// Upcall into the connect handler.
    fn emit_connect(&self);
    /// Upcall into the data handler.
    fn emit_data(&self, data: SharedBuffer);
    /// Upcall into the error handler.
    fn emit_error(&self, err: Error);
    /// Upcall into the flush handler.
    fn emit_flush(&self);

    /// Queue `data` for transmission.
    fn send(&self, data: Bytes) -> Result<(), Error>;

    /// Queue a copy of `data` for transmission.
    fn send_slice(&self, data: &[u8]) -> Result<(), Error> {
        self.send(Bytes::copy_from_slice(data))
    }

    /// Move every byte of `data` into the send queue.
    fn send_buffer(&self, data: &mut ByteBuffer) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        for extent in data.take_extents() {
            self.send(extent)?;
        }
        Ok(())
    }

    /// Arm a timeout that, on expiry, delivers [Error::Timeout] to the error handler.
    fn set_timeout(&self, timeout: Duration);

    /// Disarm the timeout armed by [Transport::set_timeout].
    fn clear_timeout(&self);

    /// Tear down the connection immediately, without flushing queued bytes.
    ///
    /// Only the first call has an effect. Any later `send` fails with
    /// [Error::Closed].
    fn close(&self);

    /// Returns true once the transport can no longer send.
    fn is_closed(&self) -> bool;

    /// Address of the SOCKS5 proxy this transport tunnels through, if any.
    fn socks5_address(&self) -> Option<&str> {
        None
    }

    /// Port of the SOCKS5 proxy this transport tunnels through, if any.
    fn socks5_port(&self) -> Option<u16> {
        None
    }
}
