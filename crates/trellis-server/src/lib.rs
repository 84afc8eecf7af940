//! Asynchronous TLS 1.3 server endpoint driver.
//!
//! `TlsServer` mirrors the client driver: it advances a pure server handshake
//! state machine over a byte transport and interprets the returned actions.
//! The server-specific pieces are the accept path and version fallback — when
//! the machine emits `AttemptVersionFallback`, the handshake callback receives
//! the original ClientHello plus everything else already buffered, and the
//! driver never touches the transport again. A server never sends early data,
//! so it is replay-safe from the start and carries no rejection policy.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use trellis_core::transport::{Transport, TransportObserver};
use trellis_proto::actions::{Action, Actions, MachineOutput};
use trellis_proto::cert::PeerCert;
use trellis_proto::endpoint::EndpointCore;
use trellis_proto::machine::{AppWrite, ServerStateMachine};
use trellis_proto::psk::PskType;
use trellis_proto::state::{Phase, State};

pub use trellis_core::error::EndpointError;
pub use trellis_core::transport::{WriteCallback, WriteFlags};
pub use trellis_proto::callbacks::{ReadCallback, ReplaySafetyCallback, ServerHandshakeCallback};
pub use trellis_proto::context::ServerContext;
pub use trellis_proto::ekm::{export_keying_material, ExporterError};

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

enum ServerEvent {
    Accept,
    SocketData,
    Write(AppWrite),
    Close,
}

enum Dispatched {
    Output(MachineOutput),
    Skipped,
}

struct ServerInner {
    machine: Box<dyn ServerStateMachine>,
    context: Rc<ServerContext>,
    state: State,
    core: EndpointCore,
    events: VecDeque<ServerEvent>,
    draining: bool,
    outstanding: bool,
    teardown: bool,
    /// Set once `AttemptVersionFallback` fired; the transport conceptually
    /// belongs to the fallback handler from then on.
    fallen_back: bool,
    pending_close: bool,
    finish_close: bool,
    hs_progress: HandshakeProgress,
    hs_callback: Option<Rc<dyn ServerHandshakeCallback>>,
    max_early_data_size: u32,
}

struct ServerShared {
    alive: Cell<bool>,
    inner: RefCell<ServerInner>,
}

/// The server endpoint driver. Owns its transport until a version fallback
/// hands the connection off.
pub struct TlsServer {
    shared: Rc<ServerShared>,
}

struct ServerObserver {
    shared: Weak<ServerShared>,
}

impl TransportObserver for ServerObserver {
    fn bytes_received(&self, data: Bytes) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        {
            let mut inner = shared.inner.borrow_mut();
            if inner.teardown || inner.fallen_back {
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

impl TlsServer {
    /// Build a driver over an accepted transport.
    pub fn new(
        transport: Box<dyn Transport>,
        context: Rc<ServerContext>,
        machine: Box<dyn ServerStateMachine>,
    ) -> Self {
        let shared = Rc::new(ServerShared {
            alive: Cell::new(true),
            inner: RefCell::new(ServerInner {
                machine,
                context,
                state: State::default(),
                core: EndpointCore::new(Some(transport)),
                events: VecDeque::new(),
                draining: false,
                outstanding: false,
                teardown: false,
                fallen_back: false,
                pending_close: false,
                finish_close: false,
                hs_progress: HandshakeProgress::NotStarted,
                hs_callback: None,
                max_early_data_size: 0,
            }),
        });
        TlsServer { shared }
    }

    /// Begin serving the handshake.
    pub fn accept(&self, callback: Rc<dyn ServerHandshakeCallback>) {
        {
            let mut inner = self.shared.inner.borrow_mut();
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
            debug!(target: "trellis::server", "accepting handshake");
            inner.hs_callback = Some(callback);
            inner.hs_progress = HandshakeProgress::InProgress;
            inner.state.phase = Phase::ServerHandshake;
            let observer: Rc<dyn TransportObserver> = Rc::new(ServerObserver {
                shared: Rc::downgrade(&self.shared),
            });
            inner.core.install_observer(observer);
            inner.events.push_back(ServerEvent::Accept);
        }
        drive(&self.shared);
    }

    /// Enqueue application bytes.
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
        let rejected = {
            let mut inner = self.shared.inner.borrow_mut();
            if !writable(&inner) {
                Some(write)
            } else {
                inner.events.push_back(ServerEvent::Write(write));
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
            None => drive(&self.shared),
        }
    }

    /// Graceful close; see the client driver for the shared semantics.
    pub fn close(&self) {
        let should_drive = {
            let mut inner = self.shared.inner.borrow_mut();
            if inner.teardown || inner.fallen_back {
                return;
            }
            if inner.outstanding || inner.draining || !inner.events.is_empty() {
                inner.pending_close = true;
                false
            } else {
                inner.events.push_back(ServerEvent::Close);
                true
            }
        };
        if should_drive {
            drive(&self.shared);
        }
    }

    pub fn close_now(&self) {
        close_immediate(&self.shared, false);
    }

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

    /// Servers never send early data, so every byte they write is replay-safe.
    pub fn is_replay_safe(&self) -> bool {
        true
    }

    /// Accepted for interface parity with the client; never invoked, since a
    /// server connection is replay-safe from the start.
    pub fn set_replay_safety_callback(&self, _callback: Option<Rc<dyn ReplaySafetyCallback>>) {
        debug!(target: "trellis::server", "replay-safety callback ignored on server");
    }

    pub fn is_detachable(&self) -> bool {
        let inner = self.shared.inner.borrow();
        !inner.outstanding && inner.core.transport_detachable()
    }

    pub fn application_protocol(&self) -> String {
        self.shared
            .inner
            .borrow()
            .state
            .alpn
            .clone()
            .unwrap_or_default()
    }

    pub fn psk_resumed(&self) -> bool {
        self.shared.inner.borrow().state.psk_type == Some(PskType::Resumption)
    }

    pub fn self_cert(&self) -> Option<Rc<dyn PeerCert>> {
        self.shared.inner.borrow().state.server_cert.clone()
    }

    pub fn peer_cert(&self) -> Option<Rc<dyn PeerCert>> {
        self.shared.inner.borrow().state.client_cert.clone()
    }

    /// Early-data budget advertised to the client, once the early handshake
    /// completed.
    pub fn max_early_data_size(&self) -> u32 {
        self.shared.inner.borrow().max_early_data_size
    }

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

    /// Current lifecycle phase, for logging and tests.
    pub fn phase(&self) -> Phase {
        self.shared.inner.borrow().state.phase
    }
}

impl Drop for TlsServer {
    fn drop(&mut self) {
        self.shared.alive.set(false);
        let busy = match self.shared.inner.try_borrow() {
            Ok(inner) => inner.draining || inner.outstanding,
            Err(_) => true,
        };
        if !busy {
            quiet_teardown(&self.shared);
        }
    }
}

fn is_good(inner: &ServerInner) -> bool {
    !inner.teardown
        && !inner.fallen_back
        && !inner.state.phase.is_terminal()
        && inner.core.transport_good()
}

fn writable(inner: &ServerInner) -> bool {
    is_good(inner) && !inner.core.transport_error()
}

fn drive(shared: &Rc<ServerShared>) {
    {
        let mut inner = shared.inner.borrow_mut();
        if inner.draining || inner.outstanding || inner.teardown || inner.fallen_back {
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
            if inner.teardown || inner.fallen_back {
                inner.draining = false;
                return;
            }
            if let Some(event) = inner.events.pop_front() {
                event
            } else if !inner.state.phase.is_terminal()
                && !inner.core.socket_buf.is_empty()
                && !inner.core.waiting_for_data
            {
                ServerEvent::SocketData
            } else if inner.pending_close {
                inner.pending_close = false;
                ServerEvent::Close
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

fn dispatch(inner: &mut ServerInner, event: ServerEvent) -> Dispatched {
    match event {
        ServerEvent::Accept => {
            let ServerInner {
                machine,
                state,
                context,
                ..
            } = inner;
            Dispatched::Output(machine.process_accept(state, context))
        }
        ServerEvent::SocketData => {
            let ServerInner {
                machine,
                state,
                core,
                ..
            } = inner;
            trace!(target: "trellis::server", buffered = core.socket_buf.len(), "feeding socket data");
            Dispatched::Output(machine.process_socket_data(state, &mut core.socket_buf))
        }
        ServerEvent::Write(write) => {
            let ServerInner { machine, state, .. } = inner;
            Dispatched::Output(machine.process_app_write(state, write))
        }
        ServerEvent::Close => {
            inner.finish_close = true;
            if inner.state.phase.is_terminal() {
                Dispatched::Skipped
            } else {
                let ServerInner { machine, state, .. } = inner;
                Dispatched::Output(machine.process_app_close(state))
            }
        }
    }
}

fn interpret(shared: &Rc<ServerShared>, actions: Actions) {
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
    inner: &mut ServerInner,
    action: Action,
    invocations: &mut Vec<Box<dyn FnOnce()>>,
) -> Halt {
    match action {
        Action::MutateState(mutator) => mutator(&mut inner.state),
        Action::WriteToSocket(write) => {
            if inner.fallen_back {
                warn!(target: "trellis::server", "dropping write after version fallback");
            } else {
                inner.core.write_to_socket(write);
            }
        }
        Action::DeliverAppData(data) => {
            if let Some(delivery) = inner.core.deliver_app_data(data) {
                invocations.push(Box::new(move || delivery.invoke()));
            }
        }
        Action::ReportEarlyHandshakeSuccess {
            max_early_data_size,
        } => {
            debug!(target: "trellis::server", max_early_data_size, "early handshake complete");
            inner.state.phase = Phase::EarlyData;
            inner.hs_progress = HandshakeProgress::Done;
            inner.max_early_data_size = max_early_data_size;
            if let Some(cb) = inner.hs_callback.take() {
                invocations.push(Box::new(move || cb.handshake_success()));
            }
        }
        Action::ReportHandshakeSuccess { .. } => {
            debug!(target: "trellis::server", "handshake complete");
            inner.hs_progress = HandshakeProgress::Done;
            inner.state.phase = Phase::Established;
            // Fires once even when an early handshake already reported.
            if let Some(cb) = inner.hs_callback.take() {
                invocations.push(Box::new(move || cb.handshake_success()));
            }
        }
        Action::ReportEarlyWriteFailed(write) => {
            warn!(target: "trellis::server", "ignoring client-only early-write failure action");
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
        Action::AttemptVersionFallback(client_hello) => {
            attempt_fallback(inner, client_hello, invocations);
        }
    }
    Halt::Continue
}

/// Surface a version fallback: the callback receives the ClientHello plus all
/// bytes the transport already delivered, and the driver detaches from the
/// transport for good.
fn attempt_fallback(
    inner: &mut ServerInner,
    client_hello: Bytes,
    invocations: &mut Vec<Box<dyn FnOnce()>>,
) {
    debug!(
        target: "trellis::server",
        hello_len = client_hello.len(),
        buffered = inner.core.socket_buf.len(),
        "attempting version fallback"
    );
    let mut combined = BytesMut::with_capacity(client_hello.len() + inner.core.socket_buf.len());
    combined.extend_from_slice(&client_hello);
    combined.extend_from_slice(&inner.core.take_unconsumed());
    inner.fallen_back = true;
    inner.hs_progress = HandshakeProgress::Done;
    inner.core.detach_observer();
    if let Some(cb) = inner.hs_callback.take() {
        let payload = combined.freeze();
        invocations.push(Box::new(move || cb.handshake_attempt_fallback(payload)));
    }
}

fn report_error(
    inner: &mut ServerInner,
    error: EndpointError,
    invocations: &mut Vec<Box<dyn FnOnce()>>,
) {
    debug!(target: "trellis::server", %error, "state machine reported an error");
    let handshaking = inner.hs_callback.is_some();
    if let Some(cb) = inner.hs_callback.take() {
        let error = error.clone();
        invocations.push(Box::new(move || cb.handshake_error(error)));
    } else if let Some(delivery) = inner.core.fail_read(error.clone()) {
        invocations.push(Box::new(move || delivery.invoke()));
    }
    inner.hs_progress = HandshakeProgress::Done;
    fail_pending_writes(inner, error, invocations);
    if handshaking && !inner.fallen_back {
        inner.teardown = true;
        inner.core.close_transport_now();
    }
}

fn fail_pending_writes(
    inner: &mut ServerInner,
    error: EndpointError,
    invocations: &mut Vec<Box<dyn FnOnce()>>,
) {
    let events = std::mem::take(&mut inner.events);
    for event in events {
        match event {
            ServerEvent::Write(write) => {
                if let Some(cb) = write.callback {
                    let error = error.clone();
                    invocations.push(Box::new(move || cb.write_err(0, error)));
                }
            }
            other => inner.events.push_back(other),
        }
    }
}

fn finish_close_if_requested(shared: &Rc<ServerShared>) {
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
        if !inner.fallen_back {
            inner.core.close_transport();
        }
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

fn close_immediate(shared: &Rc<ServerShared>, reset: bool) {
    let output = {
        let mut inner = shared.inner.borrow_mut();
        if inner.teardown || inner.fallen_back {
            return;
        }
        if !inner.outstanding && !inner.draining && !inner.state.phase.is_terminal() {
            inner.draining = true;
            let ServerInner { machine, state, .. } = &mut *inner;
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
            if !inner.fallen_back {
                if reset {
                    inner.core.close_transport_with_reset();
                } else {
                    inner.core.close_transport_now();
                }
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

fn resolve_deferred(shared: Rc<ServerShared>, actions: Actions) {
    {
        let mut inner = shared.inner.borrow_mut();
        inner.outstanding = false;
        if inner.teardown {
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
    if let Ok(mut inner) = shared.inner.try_borrow_mut() {
        inner.draining = false;
    }
    if !shared.alive.get() {
        quiet_teardown(&shared);
        return;
    }
    finish_close_if_requested(&shared);
    drive(&shared);
}

fn scan_for_wait(shared: &Rc<ServerShared>, actions: &Actions) {
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
fn pump_suppressed(shared: &Rc<ServerShared>) {
    loop {
        let output = {
            let mut inner = shared.inner.borrow_mut();
            if inner.outstanding {
                return;
            }
            if inner.teardown
                || inner.fallen_back
                || inner.state.phase.is_terminal()
                || inner.core.socket_buf.is_empty()
                || inner.core.waiting_for_data
            {
                break;
            }
            let ServerInner {
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

fn quiet_teardown(shared: &Rc<ServerShared>) {
    if let Ok(mut inner) = shared.inner.try_borrow_mut() {
        if !inner.teardown {
            inner.teardown = true;
            if !inner.fallen_back {
                inner.core.detach_observer();
                inner.core.close_transport_now();
            }
        }
        inner.draining = false;
    }
}

fn transport_failure(shared: &Rc<ServerShared>, error: Option<EndpointError>) {
    let mut invocations: Vec<Box<dyn FnOnce()>> = Vec::new();
    {
        let mut inner = shared.inner.borrow_mut();
        if inner.teardown || inner.fallen_back {
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
