//! Tokio-backed implementation of the [`Transport`] contract.
//!
//! `TokioTransport` wraps any async byte stream and pumps it with two
//! `spawn_local` tasks: a reader feeding the registered observer and a writer
//! draining a FIFO queue so write-completion callbacks fire in enqueue order.
//! It must be constructed inside a `tokio::task::LocalSet`, which is also
//! where the owning driver lives.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::EndpointError;
use crate::transport::{Transport, TransportObserver, WireWrite};

const READ_CHUNK: usize = 16 * 1024;

enum WriteOp {
    Data(WireWrite),
    Shutdown,
}

struct IoShared {
    observer: RefCell<Option<Rc<dyn TransportObserver>>>,
    errored: Cell<bool>,
    closed: Cell<bool>,
    eof: Cell<bool>,
    paused: Cell<bool>,
    resume: Notify,
}

impl IoShared {
    fn current_observer(&self) -> Option<Rc<dyn TransportObserver>> {
        self.observer.borrow().clone()
    }
}

pub struct TokioTransport {
    shared: Rc<IoShared>,
    write_tx: mpsc::UnboundedSender<WriteOp>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl TokioTransport {
    /// Wrap an already-connected stream. Must be called on a `LocalSet`.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + 'static,
    {
        let shared = Rc::new(IoShared {
            observer: RefCell::new(None),
            errored: Cell::new(false),
            closed: Cell::new(false),
            eof: Cell::new(false),
            paused: Cell::new(false),
            resume: Notify::new(),
        });
        let (read_half, write_half) = tokio::io::split(stream);
        let (write_tx, write_rx) = mpsc::unbounded_channel();

        let reader = tokio::task::spawn_local(read_loop(Rc::clone(&shared), read_half));
        let writer = tokio::task::spawn_local(write_loop(Rc::clone(&shared), write_half, write_rx));

        Self {
            shared,
            write_tx,
            reader,
            writer,
        }
    }
}

async fn read_loop<R>(shared: Rc<IoShared>, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    loop {
        while shared.paused.get() && !shared.closed.get() {
            shared.resume.notified().await;
        }
        if shared.closed.get() {
            return;
        }
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                shared.eof.set(true);
                trace!(target: "trellis::transport", "read eof");
                if let Some(observer) = shared.current_observer() {
                    observer.read_eof();
                }
                return;
            }
            Ok(n) => {
                trace!(target: "trellis::transport", bytes = n, "read");
                if let Some(observer) = shared.current_observer() {
                    observer.bytes_received(buf.freeze());
                }
            }
            Err(err) => {
                shared.errored.set(true);
                debug!(target: "trellis::transport", error = %err, "read failed");
                if let Some(observer) = shared.current_observer() {
                    observer.transport_error(EndpointError::Transport(err.to_string()));
                }
                return;
            }
        }
    }
}

async fn write_loop<W>(
    shared: Rc<IoShared>,
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<WriteOp>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(op) = rx.recv().await {
        match op {
            WriteOp::Data(write) => {
                if shared.errored.get() {
                    if let Some(callback) = write.callback {
                        callback.write_err(
                            0,
                            EndpointError::Transport("transport already failed".to_string()),
                        );
                    }
                    continue;
                }
                let mut offset = 0;
                let mut failure = None;
                while offset < write.data.len() {
                    match writer.write(&write.data[offset..]).await {
                        Ok(0) => {
                            failure = Some("write returned zero bytes".to_string());
                            break;
                        }
                        Ok(n) => offset += n,
                        Err(err) => {
                            failure = Some(err.to_string());
                            break;
                        }
                    }
                }
                match failure {
                    None => {
                        if !write.flags.cork {
                            let _ = writer.flush().await;
                        }
                        trace!(target: "trellis::transport", bytes = offset, "wrote");
                        if let Some(callback) = write.callback {
                            callback.write_success();
                        }
                    }
                    Some(message) => {
                        shared.errored.set(true);
                        debug!(target: "trellis::transport", error = %message, "write failed");
                        if let Some(callback) = write.callback {
                            callback.write_err(offset, EndpointError::Transport(message));
                        }
                    }
                }
            }
            WriteOp::Shutdown => {
                let _ = writer.shutdown().await;
                return;
            }
        }
    }
}

impl Transport for TokioTransport {
    fn set_observer(&mut self, observer: Option<Rc<dyn TransportObserver>>) {
        *self.shared.observer.borrow_mut() = observer;
    }

    fn write(&mut self, write: WireWrite) {
        if self.shared.closed.get() {
            if let Some(callback) = write.callback {
                callback.write_err(0, EndpointError::closed_locally());
            }
            return;
        }
        if self.write_tx.send(WriteOp::Data(write)).is_err() {
            debug!(target: "trellis::transport", "write after writer task exit");
        }
    }

    fn close(&mut self) {
        if self.shared.closed.replace(true) {
            return;
        }
        // Queued writes flush ahead of the shutdown marker.
        let _ = self.write_tx.send(WriteOp::Shutdown);
        self.reader.abort();
        self.shared.resume.notify_one();
    }

    fn close_now(&mut self) {
        if self.shared.closed.replace(true) {
            return;
        }
        let _ = self.write_tx.send(WriteOp::Shutdown);
        self.reader.abort();
        self.shared.resume.notify_one();
    }

    fn close_with_reset(&mut self) {
        self.shared.closed.set(true);
        self.reader.abort();
        self.writer.abort();
    }

    fn good(&self) -> bool {
        !self.shared.closed.get() && !self.shared.errored.get() && !self.shared.eof.get()
    }

    fn connecting(&self) -> bool {
        false
    }

    fn error(&self) -> bool {
        self.shared.errored.get()
    }

    fn is_detachable(&self) -> bool {
        !self.shared.closed.get() && !self.shared.errored.get()
    }

    fn pause_reads(&mut self) {
        self.shared.paused.set(true);
    }

    fn resume_reads(&mut self) {
        self.shared.paused.set(false);
        self.shared.resume.notify_one();
    }
}

impl Drop for TokioTransport {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}
