//! Asynchronous TLS 1.3 client endpoint driver.
//!
//! `TlsClient` glues a pure client handshake state machine to an asynchronous
//! byte transport: it feeds events in, interprets the returned actions
//! against the transport and the application callbacks, and owns the 0-RTT
//! early-data lifecycle (budget classification, hold queue, rejection
//! recovery, replay-safety signalling).
//!
//! The driver is bound to one event loop. All state lives behind a single
//! `RefCell`; the interpreter applies each action under a short borrow and
//! invokes user callbacks only after releasing it, checking a liveness guard
//! after every invocation so the driver may be destroyed from inside any
//! callback.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use bytes::{Bytes, BytesMut};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

use trellis_core::net::TokioTransport;
use trellis_core::transport::{Transport, TransportObserver};
use trellis_proto::actions::{Action, Actions, MachineOutput};
use trellis_proto::cert::{same_identity, PeerCert};
use trellis_proto::endpoint::EndpointCore;
use trellis_proto::machine::{AppWrite, ClientStateMachine};
use trellis_proto::psk::{CachedPsk, PskType};
use trellis_proto::state::{Phase, State};

pub use trellis_core::error::EndpointError;
pub use trellis_core::transport::{WriteCallback, WriteFlags};
pub use trellis_proto::callbacks::{
    ClientHandshakeCallback, ConnectCallback, ReadCallback, ReplaySafetyCallback,
};
pub use trellis_proto::context::ClientContext;
pub use trellis_proto::ekm::{export_keying_material, ExporterError};

/// Recovery policy applied when the server rejects a 0-RTT flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EarlyDataRejectionPolicy {
    /// Tear the connection down; pending writes and the read callback see
    /// `EarlyDataRejected`.
    #[default]
    FatalConnectionError,
    /// Re-send the rejected early bytes as ordinary application data, provided
    /// the negotiated parameters still match what the flight was promised.
    AutomaticResend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeProgress {
    NotStarted,
    InProgress,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Halt {
    Continue,
    Stop,
}

enum ClientEvent {
    Connect {
        sni: Option<String>,
        psk: Option<CachedPsk>,
    },
    SocketData,
    Write(AppWrite),
    EarlyWrite(AppWrite),
    Close,
}

enum Dispatched {
    Output(MachineOutput),
    Skipped,
}

/// Accounting for the in-flight 0-RTT attempt.
struct EarlyDataState {
    budget: u32,
    bytes_sent: usize,
    /// Payloads already issued as early writes, kept for the resend policy.
    sent: Vec<Bytes>,
    /// Writes over budget, held until the handshake settles. Once one write
    /// is held every later write is held too, preserving send order.
    held: VecDeque<AppWrite>,
}

struct ClientInner {
    machine: Box<dyn ClientStateMachine>,
    context: Rc<ClientContext>,
    state: State,
    core: EndpointCore,
    events: VecDeque<ClientEvent>,
    draining: bool,
    outstanding: bool,
    teardown: bool,
    pending_close: bool,
    finish_close: bool,
    hs_progress: HandshakeProgress,
    hs_callback: Option<Rc<dyn ClientHandshakeCallback>>,
    replay_callback: Option<Rc<dyn ReplaySafetyCallback>>,
    replay_safe: bool,
    policy: EarlyDataRejectionPolicy,
    early: Option<EarlyDataState>,
    psk_identity: Option<String>,
}

struct ClientShared {
    alive: Cell<bool>,
    inner: RefCell<ClientInner>,
}

/// The client endpoint driver. Owns its transport for the connection's
/// lifetime; one instance per connection.
pub struct TlsClient {
    shared: Rc<ClientShared>,
}

struct ClientObserver {
    shared: Weak<ClientShared>,
}

impl TransportObserver for ClientObserver {
    fn bytes_received(&self, data: Bytes) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        {
            let mut inner = shared.inner.borrow_mut();
            if inner.teardown {
                return;
            }
            inner.core.append_socket_data(&data);
        }
        drive(&shared);
    }

    fn read_eof(&self) {
        if let Some(shared) = self.shared.upgrade() {
            transport_failure(&shared, None);
        }
    }

    fn transport_error(&self, error: EndpointError) {
        if let Some(shared) = self.shared.upgrade() {
            transport_failure(&shared, Some(error));
        }
    }
}

impl TlsClient {
    /// Build a driver over an already-connected transport.
    pub fn new(
        transport: Box<dyn Transport>,
        context: Rc<ClientContext>,
        machine: Box<dyn ClientStateMachine>,
    ) -> Self {
        Self::build(Some(transport), context, machine)
    }

    /// Build a driver with no transport yet; [`TlsClient::connect_to`] dials
    /// later on this event loop.
    pub fn unconnected(context: Rc<ClientContext>, machine: Box<dyn ClientStateMachine>) -> Self {
        Self::build(None, context, machine)
    }

    fn build(
        transport: Option<Box<dyn Transport>>,
        context: Rc<ClientContext>,
        machine: Box<dyn ClientStateMachine>,
    ) -> Self {
        let shared = Rc::new(ClientShared {
            alive: Cell::new(true),
            inner: RefCell::new(ClientInner {
                machine,
                context,
                state: State::default(),
                core: EndpointCore::new(transport),
                events: VecDeque::new(),
                draining: false,
                outstanding: false,
                teardown: false,
                pending_close: false,
                finish_close: false,
                hs_progress: HandshakeProgress::NotStarted,
                hs_callback: None,
                replay_callback: None,
                replay_safe: false,
                policy: EarlyDataRejectionPolicy::default(),
                early: None,
                psk_identity: None,
            }),
        });
        TlsClient { shared }
    }

    /// Begin the handshake over the owned transport. Producing the PSK offer
    /// consults the context's cache under `psk_identity`.
    pub fn connect(
        &self,
        callback: Rc<dyn ClientHandshakeCallback>,
        sni: Option<&str>,
        psk_identity: Option<&str>,
    ) {
        let has_transport = self.shared.inner.borrow().core.has_transport();
        if !has_transport {
            debug!(target: "trellis::client", "connect without an underlying transport");
            callback.handshake_error(EndpointError::NoUnderlyingSocket);
            return;
        }
        begin_handshake(
            &self.shared,
            callback,
            sni.map(str::to_string),
            psk_identity.map(str::to_string),
        );
    }

    /// Dial `addr`, then begin the handshake. Dial failures report through
    /// `connect_callback` and never reach the state machine.
    pub fn connect_to(
        &self,
        addr: SocketAddr,
        connect_callback: Rc<dyn ConnectCallback>,
        handshake_callback: Rc<dyn ClientHandshakeCallback>,
        sni: Option<&str>,
        psk_identity: Option<&str>,
    ) {
        if self.shared.inner.borrow().core.has_transport() {
            connect_callback.connect_err(EndpointError::AlreadyOpen);
            return;
        }
        let weak = Rc::downgrade(&self.shared);
        let sni = sni.map(str::to_string);
        let psk_identity = psk_identity.map(str::to_string);
        debug!(target: "trellis::client", %addr, "dialing");
        tokio::task::spawn_local(async move {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    let Some(shared) = weak.upgrade() else {
                        return;
                    };
                    if !shared.alive.get() {
                        return;
                    }
                    shared
                        .inner
                        .borrow_mut()
                        .core
                        .set_transport(Box::new(TokioTransport::new(stream)));
                    connect_callback.connect_success();
                    if !shared.alive.get() || shared.inner.borrow().teardown {
                        return;
                    }
                    begin_handshake(&shared, handshake_callback, sni, psk_identity);
                }
                Err(err) => {
                    debug!(target: "trellis::client", error = %err, "dial failed");
                    let alive = weak.upgrade().is_some_and(|shared| shared.alive.get());
                    if alive {
                        connect_callback.connect_err(EndpointError::Transport(err.to_string()));
                    }
                }
            }
        });
    }

    /// Enqueue application bytes. During the early phase, writes within the
    /// advertised budget go out as 0-RTT; the rest are held until the
    /// handshake settles. Writes are never split across that boundary.
    pub fn write(
        &self,
        callback: Option<Rc<dyn WriteCallback>>,
        data: impl Into<Bytes>,
        flags: WriteFlags,
    ) {
        submit_write(
            &self.shared,
            AppWrite {
                data: data.into(),
                flags,
                callback,
            },
        );
    }

    /// A cheap cloneable handle for use inside callbacks. Operations become
    /// no-ops (failed write callbacks aside) once the owning driver is gone.
    pub fn handle(&self) -> ClientHandle {
        ClientHandle {
            shared: Rc::downgrade(&self.shared),
        }
    }

    /// Graceful close: pending work finishes, the state machine emits its
    /// close alert, the transport flushes and closes.
    pub fn close(&self) {
        request_close(&self.shared);
    }

    /// Immediate close: the close alert is emitted best-effort, pending write
    /// callbacks fail with a cancellation error, the read callback sees EOF,
    /// and an unresolved handshake callback receives an error.
    pub fn close_now(&self) {
        close_immediate(&self.shared, false);
    }

    /// Like [`TlsClient::close_now`], but the transport drops without an
    /// orderly flush.
    pub fn close_with_reset(&self) {
        close_immediate(&self.shared, true);
    }

    pub fn good(&self) -> bool {
        let inner = self.shared.inner.borrow();
        is_good(&inner)
    }

    pub fn readable(&self) -> bool {
        let inner = self.shared.inner.borrow();
        inner.core.buffered_app_bytes() > 0 || inner.core.transport_good()
    }

    pub fn connecting(&self) -> bool {
        let inner = self.shared.inner.borrow();
        inner.core.transport_connecting() || inner.hs_progress == HandshakeProgress::InProgress
    }

    pub fn error(&self) -> bool {
        let inner = self.shared.inner.borrow();
        inner.core.transport_error() || inner.state.phase == Phase::Error
    }

    /// Monotonic: once true, stays true for the connection's lifetime.
    pub fn is_replay_safe(&self) -> bool {
        self.shared.inner.borrow().replay_safe
    }

    pub fn is_detachable(&self) -> bool {
        let inner = self.shared.inner.borrow();
        !inner.outstanding && inner.core.transport_detachable()
    }

    /// The negotiated ALPN protocol, or the promised one while in the early
    /// phase. Empty when none was negotiated.
    pub fn application_protocol(&self) -> String {
        let inner = self.shared.inner.borrow();
        let alpn = match inner.state.phase {
            Phase::EarlyData => inner
                .state
                .early_data_params
                .as_ref()
                .and_then(|params| params.alpn.clone()),
            _ => inner.state.alpn.clone(),
        };
        alpn.unwrap_or_default()
    }

    /// True when the handshake resumed from a cached PSK.
    pub fn psk_resumed(&self) -> bool {
        self.shared.inner.borrow().state.psk_type == Some(PskType::Resumption)
    }

    /// This endpoint's certificate; the promised one while in the early
    /// phase.
    pub fn self_cert(&self) -> Option<Rc<dyn PeerCert>> {
        let inner = self.shared.inner.borrow();
        match inner.state.phase {
            Phase::EarlyData => inner
                .state
                .early_data_params
                .as_ref()
                .and_then(|params| params.client_cert.clone()),
            _ => inner.state.client_cert.clone(),
        }
    }

    /// The peer's certificate; the promised one while in the early phase.
    pub fn peer_cert(&self) -> Option<Rc<dyn PeerCert>> {
        let inner = self.shared.inner.borrow();
        match inner.state.phase {
            Phase::EarlyData => inner
                .state
                .early_data_params
                .as_ref()
                .and_then(|params| params.server_cert.clone()),
            _ => inner.state.server_cert.clone(),
        }
    }

    /// Exported keying material from the established connection.
    pub fn ekm(
        &self,
        label: &str,
        context: Option<&[u8]>,
        length: u16,
    ) -> Result<Bytes, ExporterError> {
        let inner = self.shared.inner.borrow();
        let (Some(secret), Some(cipher)) =
            (&inner.state.exporter_master_secret, inner.state.cipher)
        else {
            return Err(ExporterError::NotEstablished);
        };
        export_keying_material(cipher, secret, label, context, length)
    }

    /// Exported keying material bound to the early (0-RTT) secret.
    pub fn early_ekm(
        &self,
        label: &str,
        context: Option<&[u8]>,
        length: u16,
    ) -> Result<Bytes, ExporterError> {
        let inner = self.shared.inner.borrow();
        let cipher = inner
            .state
            .early_data_params
            .as_ref()
            .map(|params| params.cipher)
            .or(inner.state.cipher);
        let (Some(secret), Some(cipher)) = (&inner.state.early_exporter_master_secret, cipher)
        else {
            return Err(ExporterError::NotEstablished);
        };
        export_keying_material(cipher, secret, label, context, length)
    }

    /// Install or detach the read callback. Buffered application data (then
    /// any held error or EOF) is flushed to a newly installed callback.
    pub fn set_read_callback(&self, callback: Option<Rc<dyn ReadCallback>>) {
        let deliveries = {
            self.shared
                .inner
                .borrow_mut()
                .core
                .set_read_callback(callback)
        };
        for delivery in deliveries {
            delivery.invoke();
            if !self.shared.alive.get() {
                quiet_teardown(&self.shared);
                return;
            }
        }
    }

    /// Register (or clear) the replay-safety notification. It fires at most
    /// once, at the first provably replay-safe moment; a callback registered
    /// after that moment never fires.
    pub fn set_replay_safety_callback(&self, callback: Option<Rc<dyn ReplaySafetyCallback>>) {
        self.shared.inner.borrow_mut().replay_callback = callback;
    }

    pub fn set_early_data_rejection_policy(&self, policy: EarlyDataRejectionPolicy) {
        self.shared.inner.borrow_mut().policy = policy;
    }

    /// Current lifecycle phase, for logging and tests.
    pub fn phase(&self) -> Phase {
        self.shared.inner.borrow().state.phase
    }
}

impl Drop for TlsClient {
    fn drop(&mut self) {
        self.shared.alive.set(false);
        let busy = match self.shared.inner.try_borrow() {
            Ok(inner) => inner.draining || inner.outstanding,
            Err(_) => true,
        };
        // Mid-callback or mid-wait the interpreter (or the deferred
        // continuation) observes the cleared liveness flag and finishes the
        // teardown itself.
        if !busy {
            quiet_teardown(&self.shared);
        }
    }
}

/// Weak handle to a [`TlsClient`], safe to capture in callbacks.
#[derive(Clone)]
pub struct ClientHandle {
    shared: Weak<ClientShared>,
}

impl ClientHandle {
    pub fn write(
        &self,
        callback: Option<Rc<dyn WriteCallback>>,
        data: impl Into<Bytes>,
        flags: WriteFlags,
    ) {
        let write = AppWrite {
            data: data.into(),
            flags,
            callback,
        };
        match self.shared.upgrade() {
            Some(shared) if shared.alive.get() => submit_write(&shared, write),
            _ => {
                if let Some(cb) = write.callback {
                    cb.write_err(0, EndpointError::closed_locally());
                }
            }
        }
    }

    pub fn close(&self) {
        if let Some(shared) = self.shared.upgrade() {
            if shared.alive.get() {
                request_close(&shared);
            }
        }
    }

    pub fn close_now(&self) {
        if let Some(shared) = self.shared.upgrade() {
            if shared.alive.get() {
                close_immediate(&shared, false);
            }
        }
    }

    pub fn close_with_reset(&self) {
        if let Some(shared) = self.shared.upgrade() {
            if shared.alive.get() {
                close_immediate(&shared, true);
            }
        }
    }
}

fn submit_write(shared: &Rc<ClientShared>, write: AppWrite) {
    let rejected = {
        let mut inner = shared.inner.borrow_mut();
        if !writable(&inner) {
            Some(write)
        } else {
            if inner.state.phase == Phase::EarlyData {
                enqueue_early_write(&mut inner, write);
            } else {
                inner.events.push_back(ClientEvent::Write(write));
            }
            None
        }
    };
    match rejected {
        Some(write) => {
            if let Some(cb) = write.callback {
                cb.write_err(
                    0,
                    EndpointError::InvalidState("write on failed connection".to_string()),
                );
            }
        }
        None => drive(shared),
    }
}

fn request_close(shared: &Rc<ClientShared>) {
    let should_drive = {
        let mut inner = shared.inner.borrow_mut();
        if inner.teardown {
            return;
        }
        if inner.outstanding || inner.draining || !inner.events.is_empty() {
            inner.pending_close = true;
            false
        } else {
            inner.events.push_back(ClientEvent::Close);
            true
        }
    };
    if should_drive {
        drive(shared);
    }
}

fn is_good(inner: &ClientInner) -> bool {
    !inner.teardown && !inner.state.phase.is_terminal() && inner.core.transport_good()
}

fn writable(inner: &ClientInner) -> bool {
    is_good(inner) && !inner.core.transport_error()
}

fn begin_handshake(
    shared: &Rc<ClientShared>,
    callback: Rc<dyn ClientHandshakeCallback>,
    sni: Option<String>,
    psk_identity: Option<String>,
) {
    {
        let mut inner = shared.inner.borrow_mut();
        if inner.teardown {
            return;
        }
        if inner.hs_progress != HandshakeProgress::NotStarted {
            drop(inner);
            callback.handshake_error(EndpointError::InvalidState(
                "handshake already started".to_string(),
            ));
            return;
        }
        debug!(target: "trellis::client", sni = ?sni, "starting handshake");
        let psk = psk_identity
            .as_deref()
            .and_then(|identity| inner.context.psk_cache().get(identity));
        inner.hs_callback = Some(callback);
        inner.hs_progress = HandshakeProgress::InProgress;
        inner.psk_identity = psk_identity;
        inner.state.phase = Phase::ClientHandshake;
        let observer: Rc<dyn TransportObserver> = Rc::new(ClientObserver {
            shared: Rc::downgrade(shared),
        });
        inner.core.install_observer(observer);
        inner.events.push_back(ClientEvent::Connect { sni, psk });
    }
    drive(shared);
}

fn enqueue_early_write(inner: &mut ClientInner, write: AppWrite) {
    let Some(early) = inner.early.as_mut() else {
        inner.events.push_back(ClientEvent::Write(write));
        return;
    };
    let len = write.data.len();
    if !early.held.is_empty() || early.bytes_sent + len > early.budget as usize {
        trace!(target: "trellis::client", len, "holding write past early-data budget");
        early.held.push_back(write);
        return;
    }
    early.bytes_sent += len;
    early.sent.push(write.data.clone());
    inner.events.push_back(ClientEvent::EarlyWrite(write));
}

/// Run the event queue until it is empty, an asynchronous machine result is
/// outstanding, or the driver is torn down. Re-entrant calls (from user
/// callbacks) return immediately; the outer loop picks up their events.
fn drive(shared: &Rc<ClientShared>) {
    {
        let mut inner = shared.inner.borrow_mut();
        if inner.draining || inner.outstanding || inner.teardown {
            return;
        }
        inner.draining = true;
    }
    loop {
        if !shared.alive.get() {
            quiet_teardown(shared);
            return;
        }
        let event = {
            let mut inner = shared.inner.borrow_mut();
            if inner.teardown {
                inner.draining = false;
                return;
            }
            if let Some(event) = inner.events.pop_front() {
                event
            } else if !inner.state.phase.is_terminal()
                && !inner.core.socket_buf.is_empty()
                && !inner.core.waiting_for_data
            {
                ClientEvent::SocketData
            } else if inner.pending_close {
                inner.pending_close = false;
                ClientEvent::Close
            } else {
                inner.draining = false;
                return;
            }
        };
        let dispatched = {
            let mut inner = shared.inner.borrow_mut();
            dispatch(&mut inner, event)
        };
        match dispatched {
            Dispatched::Output(MachineOutput::Ready(actions)) => {
                interpret(shared, actions);
                if !shared.alive.get() {
                    quiet_teardown(shared);
                    return;
                }
            }
            Dispatched::Output(MachineOutput::Deferred(pending)) => {
                {
                    let mut inner = shared.inner.borrow_mut();
                    inner.outstanding = true;
                    inner.draining = false;
                }
                let strong = Rc::clone(shared);
                pending.on_ready(move |actions| resolve_deferred(strong, actions));
                return;
            }
            Dispatched::Skipped => {}
        }
        finish_close_if_requested(shared);
        if !shared.alive.get() {
            quiet_teardown(shared);
            return;
        }
    }
}

fn dispatch(inner: &mut ClientInner, event: ClientEvent) -> Dispatched {
    match event {
        ClientEvent::Connect { sni, psk } => {
            let ClientInner {
                machine,
                state,
                context,
                ..
            } = inner;
            Dispatched::Output(machine.process_connect(state, context, sni.as_deref(), psk))
        }
        ClientEvent::SocketData => {
            let ClientInner {
                machine,
                state,
                core,
                ..
            } = inner;
            trace!(target: "trellis::client", buffered = core.socket_buf.len(), "feeding socket data");
            Dispatched::Output(machine.process_socket_data(state, &mut core.socket_buf))
        }
        ClientEvent::Write(write) => {
            let ClientInner { machine, state, .. } = inner;
            Dispatched::Output(machine.process_app_write(state, write))
        }
        ClientEvent::EarlyWrite(write) => {
            let ClientInner { machine, state, .. } = inner;
            if state.phase == Phase::EarlyData {
                Dispatched::Output(machine.process_early_app_write(state, write))
            } else {
                // The connection settled while the write sat queued.
                Dispatched::Output(machine.process_app_write(state, write))
            }
        }
        ClientEvent::Close => {
            inner.finish_close = true;
            if inner.state.phase.is_terminal() {
                Dispatched::Skipped
            } else {
                let ClientInner { machine, state, .. } = inner;
                Dispatched::Output(machine.process_app_close(state))
            }
        }
    }
}

/// Apply one action list: in order, stopping at `ReportError` or teardown,
/// with a liveness check after every user callback.
fn interpret(shared: &Rc<ClientShared>, actions: Actions) {
    for action in actions {
        let mut invocations: Vec<Box<dyn FnOnce()>> = Vec::new();
        let halt = {
            let mut inner = shared.inner.borrow_mut();
            if inner.teardown {
                Halt::Stop
            } else {
                apply_action(&mut inner, action, &mut invocations)
            }
        };
        for invocation in invocations {
            invocation();
            if !shared.alive.get() {
                return;
            }
        }
        if !shared.alive.get() || halt == Halt::Stop {
            return;
        }
    }
}

fn apply_action(
    inner: &mut ClientInner,
    action: Action,
    invocations: &mut Vec<Box<dyn FnOnce()>>,
) -> Halt {
    match action {
        Action::MutateState(mutator) => mutator(&mut inner.state),
        Action::WriteToSocket(write) => inner.core.write_to_socket(write),
        Action::DeliverAppData(data) => {
            if let Some(delivery) = inner.core.deliver_app_data(data) {
                invocations.push(Box::new(move || delivery.invoke()));
            }
        }
        Action::ReportEarlyHandshakeSuccess {
            max_early_data_size,
        } => {
            debug!(target: "trellis::client", max_early_data_size, "early handshake complete");
            inner.state.phase = Phase::EarlyData;
            inner.hs_progress = HandshakeProgress::Done;
            inner.early = Some(EarlyDataState {
                budget: max_early_data_size,
                bytes_sent: 0,
                sent: Vec::new(),
                held: VecDeque::new(),
            });
            if let Some(cb) = inner.hs_callback.take() {
                invocations.push(Box::new(move || cb.handshake_success()));
            }
        }
        Action::ReportHandshakeSuccess {
            early_data_accepted,
        } => handshake_success(inner, early_data_accepted, invocations),
        Action::ReportEarlyWriteFailed(write) => {
            // The write never hit the wire; its callback still resolves
            // successfully (early delivery is best-effort) and the payload
            // drops out of the resend accounting.
            if let Some(early) = inner.early.as_mut() {
                if let Some(pos) = early.sent.iter().position(|sent| *sent == write.data) {
                    early.sent.remove(pos);
                }
            }
            if let Some(cb) = write.callback {
                invocations.push(Box::new(move || cb.write_success()));
            }
        }
        Action::ReportError(error) => {
            inner.state.phase = Phase::Error;
            report_error(inner, error, invocations);
            return Halt::Stop;
        }
        Action::WaitForData => inner.core.waiting_for_data = true,
        Action::AttemptVersionFallback(_) => {
            warn!(target: "trellis::client", "ignoring server-only version fallback action");
        }
    }
    Halt::Continue
}

fn handshake_success(
    inner: &mut ClientInner,
    early_data_accepted: bool,
    invocations: &mut Vec<Box<dyn FnOnce()>>,
) {
    inner.hs_progress = HandshakeProgress::Done;
    inner.state.phase = Phase::Established;
    match inner.early.take() {
        None => {
            debug!(target: "trellis::client", "handshake complete");
            if let Some(cb) = inner.hs_callback.take() {
                invocations.push(Box::new(move || cb.handshake_success()));
            }
            mark_replay_safe(inner, invocations);
        }
        Some(early) if early_data_accepted => {
            debug!(
                target: "trellis::client",
                resumed_writes = early.held.len(),
                "handshake complete, early data accepted"
            );
            for write in early.held {
                inner.events.push_back(ClientEvent::Write(write));
            }
            mark_replay_safe(inner, invocations);
        }
        Some(early) => {
            // Remove the PSK that initiated the flight so the next connection
            // cannot repeat the failure, whatever the recovery policy.
            if let Some(identity) = inner.psk_identity.clone() {
                inner.context.psk_cache().remove(&identity);
            }
            let compatible = early_params_compatible(&inner.state);
            let fatal = match inner.policy {
                EarlyDataRejectionPolicy::FatalConnectionError => true,
                EarlyDataRejectionPolicy::AutomaticResend => !compatible,
            };
            if fatal {
                reject_early_data(inner, early, invocations);
            } else {
                debug!(
                    target: "trellis::client",
                    resend_bytes = early.bytes_sent,
                    "early data rejected, resending"
                );
                if !early.sent.is_empty() {
                    let total = early.sent.iter().map(Bytes::len).sum();
                    let mut combined = BytesMut::with_capacity(total);
                    for chunk in &early.sent {
                        combined.extend_from_slice(chunk);
                    }
                    inner
                        .events
                        .push_back(ClientEvent::Write(AppWrite::new(combined.freeze())));
                }
                for write in early.held {
                    inner.events.push_back(ClientEvent::Write(write));
                }
                mark_replay_safe(inner, invocations);
            }
        }
    }
}

/// Promised-vs-achieved comparison for a rejected 0-RTT flight. A promised
/// certificate requires an achieved certificate with the same identity; a
/// promised absence is compatible with anything.
fn early_params_compatible(state: &State) -> bool {
    let Some(promised) = state.early_data_params.as_ref() else {
        return false;
    };
    if state.version != Some(promised.version) || state.cipher != Some(promised.cipher) {
        return false;
    }
    if state.alpn != promised.alpn {
        return false;
    }
    if promised.client_cert.is_some() && !same_identity(&promised.client_cert, &state.client_cert) {
        return false;
    }
    if promised.server_cert.is_some() && !same_identity(&promised.server_cert, &state.server_cert) {
        return false;
    }
    true
}

fn reject_early_data(
    inner: &mut ClientInner,
    early: EarlyDataState,
    invocations: &mut Vec<Box<dyn FnOnce()>>,
) {
    debug!(
        target: "trellis::client",
        sent = early.sent.len(),
        held = early.held.len(),
        "early data rejected, tearing down"
    );
    let error = EndpointError::EarlyDataRejected;
    for write in early.held {
        if let Some(cb) = write.callback {
            let error = error.clone();
            invocations.push(Box::new(move || cb.write_err(0, error)));
        }
    }
    if let Some(delivery) = inner.core.fail_read(error) {
        invocations.push(Box::new(move || delivery.invoke()));
    }
    inner.state.phase = Phase::Error;
    inner.teardown = true;
    inner.core.close_transport_now();
    // Replay safety is intentionally never signalled on this path.
}

fn mark_replay_safe(inner: &mut ClientInner, invocations: &mut Vec<Box<dyn FnOnce()>>) {
    if inner.replay_safe {
        return;
    }
    inner.replay_safe = true;
    if let Some(cb) = inner.replay_callback.take() {
        invocations.push(Box::new(move || cb.on_replay_safe()));
    }
}

/// Route a `ReportError`: the unresolved handshake callback has priority,
/// then the read callback (or the held-error slot), and every pending write
/// fails. Handshake-phase errors also tear the transport down.
fn report_error(
    inner: &mut ClientInner,
    error: EndpointError,
    invocations: &mut Vec<Box<dyn FnOnce()>>,
) {
    debug!(target: "trellis::client", %error, "state machine reported an error");
    let handshaking = inner.hs_callback.is_some();
    if let Some(cb) = inner.hs_callback.take() {
        let error = error.clone();
        invocations.push(Box::new(move || cb.handshake_error(error)));
    } else if let Some(delivery) = inner.core.fail_read(error.clone()) {
        invocations.push(Box::new(move || delivery.invoke()));
    }
    inner.hs_progress = HandshakeProgress::Done;
    fail_pending_writes(inner, error, invocations);
    if handshaking {
        inner.teardown = true;
        inner.core.close_transport_now();
    }
}

fn fail_pending_writes(
    inner: &mut ClientInner,
    error: EndpointError,
    invocations: &mut Vec<Box<dyn FnOnce()>>,
) {
    let events = std::mem::take(&mut inner.events);
    for event in events {
        match event {
            ClientEvent::Write(write) | ClientEvent::EarlyWrite(write) => {
                if let Some(cb) = write.callback {
                    let error = error.clone();
                    invocations.push(Box::new(move || cb.write_err(0, error)));
                }
            }
            other => inner.events.push_back(other),
        }
    }
    if let Some(early) = inner.early.take() {
        for write in early.held {
            if let Some(cb) = write.callback {
                let error = error.clone();
                invocations.push(Box::new(move || cb.write_err(0, error)));
            }
        }
    }
}

fn finish_close_if_requested(shared: &Rc<ClientShared>) {
    let mut invocations = Vec::new();
    {
        let mut inner = shared.inner.borrow_mut();
        if !inner.finish_close {
            return;
        }
        inner.finish_close = false;
        inner.teardown = true;
        inner.hs_progress = HandshakeProgress::Done;
        let error = EndpointError::closed_locally();
        fail_pending_writes(&mut inner, error.clone(), &mut invocations);
        if let Some(cb) = inner.hs_callback.take() {
            invocations.push(Box::new(move || cb.handshake_error(error)));
        }
        inner.core.close_transport();
        if !inner.state.phase.is_terminal() {
            inner.state.phase = Phase::Closed;
        }
    }
    for invocation in invocations {
        invocation();
        if !shared.alive.get() {
            return;
        }
    }
}

fn close_immediate(shared: &Rc<ClientShared>, reset: bool) {
    let output = {
        let mut inner = shared.inner.borrow_mut();
        if inner.teardown {
            return;
        }
        if !inner.outstanding && !inner.draining && !inner.state.phase.is_terminal() {
            inner.draining = true;
            let ClientInner { machine, state, .. } = &mut *inner;
            Some(machine.process_app_close(state))
        } else {
            None
        }
    };
    match output {
        Some(MachineOutput::Ready(actions)) => {
            interpret(shared, actions);
            if let Ok(mut inner) = shared.inner.try_borrow_mut() {
                inner.draining = false;
            }
            if !shared.alive.get() {
                quiet_teardown(shared);
                return;
            }
        }
        Some(MachineOutput::Deferred(_)) => {
            // An immediate close cannot wait; the deferred close alert is
            // abandoned.
            if let Ok(mut inner) = shared.inner.try_borrow_mut() {
                inner.draining = false;
            }
        }
        None => {}
    }
    let mut invocations = Vec::new();
    {
        let mut inner = shared.inner.borrow_mut();
        if !inner.teardown {
            inner.teardown = true;
            inner.hs_progress = HandshakeProgress::Done;
            let error = EndpointError::closed_locally();
            fail_pending_writes(&mut inner, error.clone(), &mut invocations);
            if let Some(cb) = inner.hs_callback.take() {
                invocations.push(Box::new(move || cb.handshake_error(error)));
            }
            if let Some(delivery) = inner.core.deliver_eof() {
                invocations.push(Box::new(move || delivery.invoke()));
            }
            if reset {
                inner.core.close_transport_with_reset();
            } else {
                inner.core.close_transport_now();
            }
            if !inner.state.phase.is_terminal() {
                inner.state.phase = Phase::Closed;
            }
        }
    }
    for invocation in invocations {
        invocation();
        if !shared.alive.get() {
            quiet_teardown(shared);
            return;
        }
    }
}

fn resolve_deferred(shared: Rc<ClientShared>, actions: Actions) {
    {
        let mut inner = shared.inner.borrow_mut();
        inner.outstanding = false;
        if inner.teardown {
            // Closed while waiting: the resolution's effects are suppressed.
            return;
        }
        if shared.alive.get() {
            inner.draining = true;
        }
    }
    if !shared.alive.get() {
        scan_for_wait(&shared, &actions);
        pump_suppressed(&shared);
        return;
    }
    interpret(&shared, actions);
    {
        if let Ok(mut inner) = shared.inner.try_borrow_mut() {
            inner.draining = false;
        }
    }
    if !shared.alive.get() {
        quiet_teardown(&shared);
        return;
    }
    finish_close_if_requested(&shared);
    drive(&shared);
}

fn scan_for_wait(shared: &Rc<ClientShared>, actions: &Actions) {
    if actions
        .0
        .iter()
        .any(|action| matches!(action, Action::WaitForData))
    {
        if let Ok(mut inner) = shared.inner.try_borrow_mut() {
            inner.core.waiting_for_data = true;
        }
    }
}

/// After destruction mid-wait, keep feeding buffered socket data to the
/// machine with all effects suppressed until it asks to wait; then release.
fn pump_suppressed(shared: &Rc<ClientShared>) {
    loop {
        let output = {
            let mut inner = shared.inner.borrow_mut();
            if inner.outstanding {
                return;
            }
            if inner.teardown
                || inner.state.phase.is_terminal()
                || inner.core.socket_buf.is_empty()
                || inner.core.waiting_for_data
            {
                break;
            }
            let ClientInner {
                machine,
                state,
                core,
                ..
            } = &mut *inner;
            machine.process_socket_data(state, &mut core.socket_buf)
        };
        match output {
            MachineOutput::Ready(actions) => scan_for_wait(shared, &actions),
            MachineOutput::Deferred(pending) => {
                shared.inner.borrow_mut().outstanding = true;
                let strong = Rc::clone(shared);
                pending.on_ready(move |actions| resolve_deferred(strong, actions));
                return;
            }
        }
    }
    quiet_teardown(shared);
}

/// Teardown with no user-visible effects, used once the owner is gone.
fn quiet_teardown(shared: &Rc<ClientShared>) {
    if let Ok(mut inner) = shared.inner.try_borrow_mut() {
        if !inner.teardown {
            inner.teardown = true;
            inner.core.detach_observer();
            inner.core.close_transport_now();
        }
        inner.draining = false;
    }
}

fn transport_failure(shared: &Rc<ClientShared>, error: Option<EndpointError>) {
    let mut invocations: Vec<Box<dyn FnOnce()>> = Vec::new();
    {
        let mut inner = shared.inner.borrow_mut();
        if inner.teardown {
            return;
        }
        let error = error.unwrap_or_else(|| {
            EndpointError::Transport("connection closed by peer".to_string())
        });
        if let Some(cb) = inner.hs_callback.take() {
            inner.hs_progress = HandshakeProgress::Done;
            let error = error.clone();
            invocations.push(Box::new(move || cb.handshake_error(error)));
        } else if let Some(delivery) = inner.core.fail_read(error.clone()) {
            invocations.push(Box::new(move || delivery.invoke()));
        }
        fail_pending_writes(&mut inner, error, &mut invocations);
    }
    for invocation in invocations {
        invocation();
        if !shared.alive.get() {
            quiet_teardown(shared);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::ids::{CipherSuite, ProtocolVersion};
    use trellis_proto::state::EarlyDataParams;
    use trellis_proto::testing::StaticCert;

    fn established(params: EarlyDataParams) -> State {
        let mut state = State::new(Phase::Established);
        state.version = Some(params.version);
        state.cipher = Some(params.cipher);
        state.alpn = params.alpn.clone();
        state.early_data_params = Some(params);
        state
    }

    fn base_params() -> EarlyDataParams {
        EarlyDataParams {
            version: ProtocolVersion::Tls13,
            cipher: CipherSuite::Aes128GcmSha256,
            alpn: Some("h2".to_string()),
            client_cert: None,
            server_cert: None,
        }
    }

    #[test]
    fn matching_params_are_compatible() {
        let state = established(base_params());
        assert!(early_params_compatible(&state));
    }

    #[test]
    fn alpn_change_is_incompatible() {
        let mut state = established(base_params());
        state.alpn = Some("h3".to_string());
        assert!(!early_params_compatible(&state));
    }

    #[test]
    fn promised_cert_requires_matching_identity() {
        let mut params = base_params();
        params.server_cert = Some(StaticCert::new("id1"));
        let mut state = established(params);
        assert!(!early_params_compatible(&state));
        state.server_cert = Some(StaticCert::new("id2"));
        assert!(!early_params_compatible(&state));
        state.server_cert = Some(StaticCert::new("id1"));
        assert!(early_params_compatible(&state));
    }

    #[test]
    fn promised_absent_cert_accepts_any_achieved_cert() {
        let mut state = established(base_params());
        state.client_cert = Some(StaticCert::new("late"));
        assert!(early_params_compatible(&state));
    }
}
