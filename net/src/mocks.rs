//! A mock implementation of [crate::Transport] for testing decorators.

use crate::{
    transport::{ConnectFn, DataFn, ErrorFn, FlushFn, Handlers, SharedBuffer, SslFn},
    Error,
};
use bytes::Bytes;
use std::{
    cell::{Cell, RefCell},
    time::Duration,
};

/// A simulated underlying [crate::Transport].
///
/// Records every byte passed to `send` and every call to `close`, and lets the
/// test inject the events a real connection would produce.
#[derive(Default)]
pub struct Transport {
    handlers: Handlers,
    sent: RefCell<Vec<Bytes>>,
    closes: Cell<usize>,
    timeout: Cell<Option<Duration>>,
    incoming: SharedBuffer,
}

impl Transport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything sent so far, concatenated.
    pub fn sent(&self) -> Vec<u8> {
        self.sent.borrow().concat()
    }

    /// Everything sent so far, concatenated, clearing the record.
    pub fn take_sent(&self) -> Vec<u8> {
        self.sent.take().concat()
    }

    /// Number of times `close` was called.
    pub fn closes(&self) -> usize {
        self.closes.get()
    }

    /// Timeout currently armed, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.get()
    }

    /// Buffer handed to the data handler.
    pub fn incoming(&self) -> SharedBuffer {
        self.incoming.clone()
    }

    /// Simulate the connection being established.
    pub fn connect(&self) {
        self.handlers.emit_connect();
    }

    /// Simulate `data` arriving from the peer.
    pub fn feed(&self, data: &[u8]) {
        let written = self.incoming.borrow_mut().write(data);
        match written {
            Ok(()) => self.handlers.emit_data(self.incoming.clone()),
            Err(err) => self.handlers.emit_error(err.into()),
        }
    }

    /// Simulate an asynchronous failure.
    pub fn fail(&self, err: Error) {
        self.handlers.emit_error(err);
    }

    /// Simulate the send queue draining.
    pub fn flush(&self) {
        self.handlers.emit_flush();
    }

    /// Simulate a completed TLS handshake.
    pub fn ssl(&self) {
        self.handlers.emit_ssl();
    }
}

impl crate::Transport for Transport {
    fn on_connect(&self, handler: ConnectFn) {
        self.handlers.on_connect(handler);
    }

    fn on_data(&self, handler: DataFn) {
        self.handlers.on_data(handler);
    }

    fn on_error(&self, handler: ErrorFn) {
        self.handlers.on_error(handler);
    }

    fn on_flush(&self, handler: FlushFn) {
        self.handlers.on_flush(handler);
    }

    fn on_ssl(&self, handler: SslFn) {
        self.handlers.on_ssl(handler);
    }

    fn emit_connect(&self) {
        self.handlers.emit_connect();
    }

    fn emit_data(&self, data: SharedBuffer) {
        self.handlers.emit_data(data);
    }

    fn emit_error(&self, err: Error) {
        self.handlers.emit_error(err);
    }

    fn emit_flush(&self) {
        self.handlers.emit_flush();
    }

    fn send(&self, data: Bytes) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.sent.borrow_mut().push(data);
        Ok(())
    }

    fn set_timeout(&self, timeout: Duration) {
        self.timeout.set(Some(timeout));
    }

    fn clear_timeout(&self) {
        self.timeout.set(None);
    }

    fn close(&self) {
        self.closes.set(self.closes.get() + 1);
    }

    fn is_closed(&self) -> bool {
        self.closes.get() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Transport as _;
    use commonware_macros::test_traced;
    use libight_buffer::ByteBuffer;
    use std::rc::Rc;

    #[test_traced]
    fn test_records_sends() {
        let transport = Transport::new();
        transport.send_slice(b"hello ").unwrap();
        let mut buffer = ByteBuffer::new();
        buffer.write("world").unwrap();
        transport.send_buffer(&mut buffer).unwrap();
        assert!(buffer.is_empty());
        assert_eq!(transport.take_sent(), b"hello world");
        assert!(transport.sent().is_empty());

        transport.close();
        assert!(transport.is_closed());
        assert!(matches!(transport.send_slice(b"late"), Err(Error::Closed)));
        assert_eq!(transport.closes(), 1);
    }

    #[test_traced]
    fn test_feed_without_handler_keeps_bytes() {
        let transport = Transport::new();
        transport.feed(b"abc");
        transport.feed(b"def");
        assert_eq!(transport.incoming().borrow_mut().read_all(), "abcdef");
    }

    #[test_traced]
    fn test_feed_reaches_handler() {
        let transport = Transport::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        transport.on_data(Box::new({
            let seen = seen.clone();
            move |data| seen.borrow_mut().push(data.borrow_mut().read_all())
        }));
        transport.feed(b"one");
        transport.feed(b"two");
        assert_eq!(*seen.borrow(), vec![Bytes::from("one"), Bytes::from("two")]);
    }
}
