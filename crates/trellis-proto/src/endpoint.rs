//! Plumbing shared by the client and server drivers.
//!
//! `EndpointCore` owns the transport slot and the read-side bookkeeping: the
//! socket accumulation buffer handed to the state machine, and the
//! application-data buffer used while no read callback is installed. Driver
//! interpreters mutate it under a short borrow and invoke the returned
//! [`ReadDelivery`] values only after that borrow is released, so a callback
//! that re-enters (or destroys) the driver never observes a held borrow.

use std::collections::VecDeque;
use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use tracing::trace;
use trellis_core::error::EndpointError;
use trellis_core::transport::{Transport, TransportObserver, WireWrite};

use crate::callbacks::ReadCallback;

/// Buffered app data beyond this pauses transport reads until a read callback
/// drains the queue.
pub const APP_BUFFER_PAUSE_THRESHOLD: usize = 64 * 1024;

/// A read-callback invocation computed under the driver borrow.
pub enum ReadDelivery {
    Data(Rc<dyn ReadCallback>, Bytes),
    Error(Rc<dyn ReadCallback>, EndpointError),
    Eof(Rc<dyn ReadCallback>),
}

impl ReadDelivery {
    pub fn invoke(self) {
        match self {
            ReadDelivery::Data(cb, data) => cb.read_available(data),
            ReadDelivery::Error(cb, error) => cb.read_error(error),
            ReadDelivery::Eof(cb) => cb.read_eof(),
        }
    }
}

pub struct EndpointCore {
    transport: Option<Box<dyn Transport>>,
    read_callback: Option<Rc<dyn ReadCallback>>,
    app_buffer: VecDeque<Bytes>,
    app_buffered_bytes: usize,
    pending_read_error: Option<EndpointError>,
    pending_eof: bool,
    read_failed: bool,
    reads_paused: bool,
    /// Bytes from the transport not yet consumed by the state machine.
    pub socket_buf: BytesMut,
    /// Set by `WaitForData`; cleared when new bytes arrive.
    pub waiting_for_data: bool,
}

impl EndpointCore {
    pub fn new(transport: Option<Box<dyn Transport>>) -> Self {
        Self {
            transport,
            read_callback: None,
            app_buffer: VecDeque::new(),
            app_buffered_bytes: 0,
            pending_read_error: None,
            pending_eof: false,
            read_failed: false,
            reads_paused: false,
            socket_buf: BytesMut::new(),
            waiting_for_data: false,
        }
    }

    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    pub fn set_transport(&mut self, transport: Box<dyn Transport>) {
        self.transport = Some(transport);
    }

    pub fn install_observer(&mut self, observer: Rc<dyn TransportObserver>) {
        if let Some(transport) = self.transport.as_mut() {
            transport.set_observer(Some(observer));
        }
    }

    pub fn detach_observer(&mut self) {
        if let Some(transport) = self.transport.as_mut() {
            transport.set_observer(None);
        }
    }

    pub fn write_to_socket(&mut self, write: WireWrite) {
        match self.transport.as_mut() {
            Some(transport) => transport.write(write),
            None => {
                if let Some(callback) = write.callback {
                    callback.write_err(0, EndpointError::NoUnderlyingSocket);
                }
            }
        }
    }

    pub fn transport_good(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| t.good())
    }

    pub fn transport_connecting(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| t.connecting())
    }

    pub fn transport_error(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| t.error())
    }

    pub fn transport_detachable(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| t.is_detachable())
    }

    pub fn close_transport(&mut self) {
        if let Some(transport) = self.transport.as_mut() {
            transport.close();
        }
    }

    pub fn close_transport_now(&mut self) {
        if let Some(transport) = self.transport.as_mut() {
            transport.close_now();
        }
    }

    pub fn close_transport_with_reset(&mut self) {
        if let Some(transport) = self.transport.as_mut() {
            transport.close_with_reset();
        }
    }

    /// New bytes from the transport. Clears the wait flag so the dispatch
    /// loop feeds the machine again.
    pub fn append_socket_data(&mut self, data: &[u8]) {
        self.socket_buf.extend_from_slice(data);
        self.waiting_for_data = false;
    }

    /// Everything received but not yet consumed by the machine. Used for
    /// version fallback, where the downstream stack needs a continuous
    /// stream.
    pub fn take_unconsumed(&mut self) -> Bytes {
        self.socket_buf.split().freeze()
    }

    pub fn read_callback_installed(&self) -> bool {
        self.read_callback.is_some()
    }

    pub fn buffered_app_bytes(&self) -> usize {
        self.app_buffered_bytes
    }

    /// Route decrypted app data to the callback, or buffer it until one is
    /// installed.
    pub fn deliver_app_data(&mut self, data: Bytes) -> Option<ReadDelivery> {
        if self.read_failed {
            return None;
        }
        match &self.read_callback {
            Some(cb) => Some(ReadDelivery::Data(Rc::clone(cb), data)),
            None => {
                self.app_buffered_bytes += data.len();
                self.app_buffer.push_back(data);
                if self.app_buffered_bytes > APP_BUFFER_PAUSE_THRESHOLD && !self.reads_paused {
                    trace!(
                        target: "trellis::endpoint",
                        buffered = self.app_buffered_bytes,
                        "pausing transport reads"
                    );
                    self.reads_paused = true;
                    if let Some(transport) = self.transport.as_mut() {
                        transport.pause_reads();
                    }
                }
                None
            }
        }
    }

    /// Route a read-side error; held if no callback is installed. The first
    /// error wins: later read-side events are suppressed.
    pub fn fail_read(&mut self, error: EndpointError) -> Option<ReadDelivery> {
        if self.read_failed {
            return None;
        }
        match &self.read_callback {
            Some(cb) => {
                self.read_failed = true;
                Some(ReadDelivery::Error(Rc::clone(cb), error))
            }
            None => {
                if self.pending_read_error.is_none() {
                    self.pending_read_error = Some(error);
                }
                None
            }
        }
    }

    pub fn deliver_eof(&mut self) -> Option<ReadDelivery> {
        if self.read_failed {
            return None;
        }
        match &self.read_callback {
            Some(cb) => {
                self.read_failed = true;
                Some(ReadDelivery::Eof(Rc::clone(cb)))
            }
            None => {
                self.pending_eof = true;
                None
            }
        }
    }

    /// Install or detach the read callback. Returns buffered deliveries to
    /// run, in order: data first, then any held error or EOF.
    pub fn set_read_callback(
        &mut self,
        callback: Option<Rc<dyn ReadCallback>>,
    ) -> Vec<ReadDelivery> {
        self.read_callback = callback;
        let Some(cb) = self.read_callback.clone() else {
            return Vec::new();
        };
        let mut deliveries = Vec::new();
        while let Some(data) = self.app_buffer.pop_front() {
            self.app_buffered_bytes -= data.len();
            deliveries.push(ReadDelivery::Data(Rc::clone(&cb), data));
        }
        if self.reads_paused {
            self.reads_paused = false;
            if let Some(transport) = self.transport.as_mut() {
                transport.resume_reads();
            }
        }
        if let Some(error) = self.pending_read_error.take() {
            self.read_failed = true;
            deliveries.push(ReadDelivery::Error(Rc::clone(&cb), error));
        } else if self.pending_eof {
            self.pending_eof = false;
            self.read_failed = true;
            deliveries.push(ReadDelivery::Eof(cb));
        }
        deliveries
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct Sink {
        datas: RefCell<Vec<Bytes>>,
        errors: RefCell<Vec<EndpointError>>,
        eofs: RefCell<usize>,
    }

    impl ReadCallback for Sink {
        fn read_available(&self, data: Bytes) {
            self.datas.borrow_mut().push(data);
        }

        fn read_eof(&self) {
            *self.eofs.borrow_mut() += 1;
        }

        fn read_error(&self, error: EndpointError) {
            self.errors.borrow_mut().push(error);
        }
    }

    #[test]
    fn buffers_until_callback_installed_then_flushes_in_order() {
        let mut core = EndpointCore::new(None);
        assert!(core.deliver_app_data(Bytes::from_static(b"one")).is_none());
        assert!(core.deliver_app_data(Bytes::from_static(b"two")).is_none());
        assert_eq!(core.buffered_app_bytes(), 6);

        let sink = Rc::new(Sink::default());
        for delivery in core.set_read_callback(Some(sink.clone())) {
            delivery.invoke();
        }
        assert_eq!(
            sink.datas.borrow().as_slice(),
            &[Bytes::from_static(b"one"), Bytes::from_static(b"two")]
        );
        assert_eq!(core.buffered_app_bytes(), 0);
    }

    #[test]
    fn held_error_delivered_after_buffered_data() {
        let mut core = EndpointCore::new(None);
        assert!(core.deliver_app_data(Bytes::from_static(b"tail")).is_none());
        assert!(core
            .fail_read(EndpointError::Transport("boom".into()))
            .is_none());

        let sink = Rc::new(Sink::default());
        for delivery in core.set_read_callback(Some(sink.clone())) {
            delivery.invoke();
        }
        assert_eq!(sink.datas.borrow().len(), 1);
        assert_eq!(sink.errors.borrow().len(), 1);
    }

    #[test]
    fn first_read_error_wins() {
        let mut core = EndpointCore::new(None);
        let sink = Rc::new(Sink::default());
        core.set_read_callback(Some(sink.clone()));
        core.fail_read(EndpointError::Transport("first".into()))
            .unwrap()
            .invoke();
        assert!(core
            .fail_read(EndpointError::Transport("second".into()))
            .is_none());
        assert!(core.deliver_eof().is_none());
        assert_eq!(sink.errors.borrow().len(), 1);
        assert_eq!(*sink.eofs.borrow(), 0);
    }

    #[test]
    fn append_clears_wait_flag() {
        let mut core = EndpointCore::new(None);
        core.waiting_for_data = true;
        core.append_socket_data(b"hello");
        assert!(!core.waiting_for_data);
        assert_eq!(core.take_unconsumed(), Bytes::from_static(b"hello"));
        assert!(core.socket_buf.is_empty());
    }
}
