//! Test doubles for driver suites: a mock transport with a test-side handle,
//! scripted state machines that replay canned action lists, and recording
//! callbacks.
//!
//! Enabled with the `testing` cargo feature.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use trellis_core::error::EndpointError;
use trellis_core::transport::{Transport, TransportObserver, WireWrite, WriteCallback};

use crate::actions::{Actions, MachineOutput};
use crate::callbacks::{
    ClientHandshakeCallback, ConnectCallback, ReadCallback, ReplaySafetyCallback,
    ServerHandshakeCallback,
};
use crate::cert::PeerCert;
use crate::context::{ClientContext, ServerContext};
use crate::machine::{AppWrite, ClientStateMachine, ServerStateMachine};
use crate::psk::CachedPsk;
use crate::state::State;

/// Shorthand for a ready action list.
pub fn ready(actions: Vec<crate::actions::Action>) -> MachineOutput {
    MachineOutput::Ready(Actions(actions))
}

// ---------------------------------------------------------------------------
// Mock transport

#[derive(Default)]
struct MockTransportState {
    observer: RefCell<Option<Rc<dyn TransportObserver>>>,
    writes: RefCell<Vec<WireWrite>>,
    good: Cell<bool>,
    connecting: Cell<bool>,
    error: Cell<bool>,
    detachable: Cell<bool>,
    paused: Cell<bool>,
    close_calls: Cell<usize>,
    close_now_calls: Cell<usize>,
    reset_calls: Cell<usize>,
}

/// Transport double handed to a driver under test.
pub struct MockTransport {
    state: Rc<MockTransportState>,
}

/// Test-side handle to a [`MockTransport`].
#[derive(Clone)]
pub struct MockTransportHandle {
    state: Rc<MockTransportState>,
}

/// Create a mock transport and its handle. The transport starts `good`.
pub fn mock_transport() -> (Box<dyn Transport>, MockTransportHandle) {
    let state = Rc::new(MockTransportState::default());
    state.good.set(true);
    state.detachable.set(true);
    (
        Box::new(MockTransport {
            state: Rc::clone(&state),
        }),
        MockTransportHandle { state },
    )
}

impl Transport for MockTransport {
    fn set_observer(&mut self, observer: Option<Rc<dyn TransportObserver>>) {
        *self.state.observer.borrow_mut() = observer;
    }

    fn write(&mut self, write: WireWrite) {
        self.state.writes.borrow_mut().push(write);
    }

    fn close(&mut self) {
        self.state.close_calls.set(self.state.close_calls.get() + 1);
        self.state.good.set(false);
    }

    fn close_now(&mut self) {
        self.state
            .close_now_calls
            .set(self.state.close_now_calls.get() + 1);
        self.state.good.set(false);
    }

    fn close_with_reset(&mut self) {
        self.state.reset_calls.set(self.state.reset_calls.get() + 1);
        self.state.good.set(false);
    }

    fn good(&self) -> bool {
        self.state.good.get()
    }

    fn connecting(&self) -> bool {
        self.state.connecting.get()
    }

    fn error(&self) -> bool {
        self.state.error.get()
    }

    fn is_detachable(&self) -> bool {
        self.state.detachable.get()
    }

    fn pause_reads(&mut self) {
        self.state.paused.set(true);
    }

    fn resume_reads(&mut self) {
        self.state.paused.set(false);
    }
}

impl MockTransportHandle {
    pub fn set_good(&self, good: bool) {
        self.state.good.set(good);
    }

    pub fn set_connecting(&self, connecting: bool) {
        self.state.connecting.set(connecting);
    }

    pub fn set_error(&self, error: bool) {
        self.state.error.set(error);
    }

    pub fn set_detachable(&self, detachable: bool) {
        self.state.detachable.set(detachable);
    }

    pub fn has_observer(&self) -> bool {
        self.state.observer.borrow().is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.state.paused.get()
    }

    fn observer(&self) -> Rc<dyn TransportObserver> {
        self.state
            .observer
            .borrow()
            .clone()
            .expect("no observer registered on mock transport")
    }

    /// Push bytes at the driver, as if they arrived from the peer.
    pub fn deliver(&self, data: impl Into<Bytes>) {
        self.observer().bytes_received(data.into());
    }

    pub fn deliver_eof(&self) {
        self.observer().read_eof();
    }

    pub fn deliver_error(&self, error: EndpointError) {
        self.observer().transport_error(error);
    }

    /// Payloads written to the wire so far, in order.
    pub fn written(&self) -> Vec<Bytes> {
        self.state
            .writes
            .borrow()
            .iter()
            .map(|w| w.data.clone())
            .collect()
    }

    /// Drain recorded writes, firing each completion callback with success.
    pub fn complete_writes(&self) {
        let writes: Vec<WireWrite> = self.state.writes.borrow_mut().drain(..).collect();
        for write in writes {
            if let Some(callback) = write.callback {
                callback.write_success();
            }
        }
    }

    pub fn close_calls(&self) -> usize {
        self.state.close_calls.get()
    }

    pub fn close_now_calls(&self) -> usize {
        self.state.close_now_calls.get()
    }

    pub fn reset_calls(&self) -> usize {
        self.state.reset_calls.get()
    }
}

// ---------------------------------------------------------------------------
// Scripted state machines

/// One recorded machine invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineCall {
    Connect { sni: Option<String>, had_psk: bool },
    Accept,
    SocketData(Bytes),
    AppWrite(Bytes),
    EarlyAppWrite(Bytes),
    AppClose,
}

type ConnectFn = Box<dyn FnOnce(&State, Option<&str>, Option<CachedPsk>) -> MachineOutput>;
type AcceptFn = Box<dyn FnOnce(&State) -> MachineOutput>;
type SocketDataFn = Box<dyn FnOnce(&State, &mut BytesMut) -> MachineOutput>;
type WriteFn = Box<dyn FnOnce(&State, AppWrite) -> MachineOutput>;
type CloseFn = Box<dyn FnOnce(&State) -> MachineOutput>;

#[derive(Default)]
struct ScriptedState {
    on_connect: RefCell<VecDeque<ConnectFn>>,
    on_accept: RefCell<VecDeque<AcceptFn>>,
    on_socket_data: RefCell<VecDeque<SocketDataFn>>,
    on_app_write: RefCell<VecDeque<WriteFn>>,
    on_early_app_write: RefCell<VecDeque<WriteFn>>,
    on_app_close: RefCell<VecDeque<CloseFn>>,
    calls: RefCell<Vec<MachineCall>>,
}

impl ScriptedState {
    fn record(&self, call: MachineCall) {
        self.calls.borrow_mut().push(call);
    }
}

/// Test-side handle shared by the client and server scripted machines.
#[derive(Clone)]
pub struct MachineHandle {
    state: Rc<ScriptedState>,
}

impl MachineHandle {
    pub fn expect_connect(
        &self,
        f: impl FnOnce(&State, Option<&str>, Option<CachedPsk>) -> MachineOutput + 'static,
    ) {
        self.state.on_connect.borrow_mut().push_back(Box::new(f));
    }

    pub fn expect_accept(&self, f: impl FnOnce(&State) -> MachineOutput + 'static) {
        self.state.on_accept.borrow_mut().push_back(Box::new(f));
    }

    pub fn expect_socket_data(
        &self,
        f: impl FnOnce(&State, &mut BytesMut) -> MachineOutput + 'static,
    ) {
        self.state.on_socket_data.borrow_mut().push_back(Box::new(f));
    }

    pub fn expect_app_write(&self, f: impl FnOnce(&State, AppWrite) -> MachineOutput + 'static) {
        self.state.on_app_write.borrow_mut().push_back(Box::new(f));
    }

    pub fn expect_early_app_write(
        &self,
        f: impl FnOnce(&State, AppWrite) -> MachineOutput + 'static,
    ) {
        self.state
            .on_early_app_write
            .borrow_mut()
            .push_back(Box::new(f));
    }

    pub fn expect_app_close(&self, f: impl FnOnce(&State) -> MachineOutput + 'static) {
        self.state.on_app_close.borrow_mut().push_back(Box::new(f));
    }

    pub fn calls(&self) -> Vec<MachineCall> {
        self.state.calls.borrow().clone()
    }

    pub fn app_writes(&self) -> Vec<Bytes> {
        self.state
            .calls
            .borrow()
            .iter()
            .filter_map(|call| match call {
                MachineCall::AppWrite(data) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn early_app_writes(&self) -> Vec<Bytes> {
        self.state
            .calls
            .borrow()
            .iter()
            .filter_map(|call| match call {
                MachineCall::EarlyAppWrite(data) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn socket_data_calls(&self) -> usize {
        self.state
            .calls
            .borrow()
            .iter()
            .filter(|call| matches!(call, MachineCall::SocketData(_)))
            .count()
    }

    pub fn app_close_calls(&self) -> usize {
        self.state
            .calls
            .borrow()
            .iter()
            .filter(|call| matches!(call, MachineCall::AppClose))
            .count()
    }
}

/// Client state machine replaying scripted outputs.
pub struct ScriptedClientMachine {
    state: Rc<ScriptedState>,
}

pub fn scripted_client_machine() -> (Box<dyn ClientStateMachine>, MachineHandle) {
    let state = Rc::new(ScriptedState::default());
    (
        Box::new(ScriptedClientMachine {
            state: Rc::clone(&state),
        }),
        MachineHandle { state },
    )
}

impl ClientStateMachine for ScriptedClientMachine {
    fn process_connect(
        &mut self,
        state: &State,
        _context: &Rc<ClientContext>,
        sni: Option<&str>,
        cached_psk: Option<CachedPsk>,
    ) -> MachineOutput {
        self.state.record(MachineCall::Connect {
            sni: sni.map(str::to_string),
            had_psk: cached_psk.is_some(),
        });
        let f = self
            .state
            .on_connect
            .borrow_mut()
            .pop_front()
            .expect("unexpected process_connect");
        f(state, sni, cached_psk)
    }

    fn process_socket_data(&mut self, state: &State, buf: &mut BytesMut) -> MachineOutput {
        self.state
            .record(MachineCall::SocketData(Bytes::copy_from_slice(buf)));
        let f = self
            .state
            .on_socket_data
            .borrow_mut()
            .pop_front()
            .expect("unexpected process_socket_data");
        f(state, buf)
    }

    fn process_app_write(&mut self, state: &State, write: AppWrite) -> MachineOutput {
        self.state.record(MachineCall::AppWrite(write.data.clone()));
        let f = self
            .state
            .on_app_write
            .borrow_mut()
            .pop_front()
            .expect("unexpected process_app_write");
        f(state, write)
    }

    fn process_early_app_write(&mut self, state: &State, write: AppWrite) -> MachineOutput {
        self.state
            .record(MachineCall::EarlyAppWrite(write.data.clone()));
        let f = self
            .state
            .on_early_app_write
            .borrow_mut()
            .pop_front()
            .expect("unexpected process_early_app_write");
        f(state, write)
    }

    fn process_app_close(&mut self, state: &State) -> MachineOutput {
        self.state.record(MachineCall::AppClose);
        let f = self
            .state
            .on_app_close
            .borrow_mut()
            .pop_front()
            .expect("unexpected process_app_close");
        f(state)
    }
}

/// Server state machine replaying scripted outputs.
pub struct ScriptedServerMachine {
    state: Rc<ScriptedState>,
}

pub fn scripted_server_machine() -> (Box<dyn ServerStateMachine>, MachineHandle) {
    let state = Rc::new(ScriptedState::default());
    (
        Box::new(ScriptedServerMachine {
            state: Rc::clone(&state),
        }),
        MachineHandle { state },
    )
}

impl ServerStateMachine for ScriptedServerMachine {
    fn process_accept(&mut self, state: &State, _context: &Rc<ServerContext>) -> MachineOutput {
        self.state.record(MachineCall::Accept);
        let f = self
            .state
            .on_accept
            .borrow_mut()
            .pop_front()
            .expect("unexpected process_accept");
        f(state)
    }

    fn process_socket_data(&mut self, state: &State, buf: &mut BytesMut) -> MachineOutput {
        self.state
            .record(MachineCall::SocketData(Bytes::copy_from_slice(buf)));
        let f = self
            .state
            .on_socket_data
            .borrow_mut()
            .pop_front()
            .expect("unexpected process_socket_data");
        f(state, buf)
    }

    fn process_app_write(&mut self, state: &State, write: AppWrite) -> MachineOutput {
        self.state.record(MachineCall::AppWrite(write.data.clone()));
        let f = self
            .state
            .on_app_write
            .borrow_mut()
            .pop_front()
            .expect("unexpected process_app_write");
        f(state, write)
    }

    fn process_app_close(&mut self, state: &State) -> MachineOutput {
        self.state.record(MachineCall::AppClose);
        let f = self
            .state
            .on_app_close
            .borrow_mut()
            .pop_front()
            .expect("unexpected process_app_close");
        f(state)
    }
}

// ---------------------------------------------------------------------------
// Recording callbacks

type Hook = RefCell<Option<Box<dyn FnOnce()>>>;

fn run_hook(hook: &Hook) {
    if let Some(f) = hook.borrow_mut().take() {
        f();
    }
}

/// Records handshake outcomes; implements both the client and server
/// handshake callback traits.
#[derive(Default)]
pub struct RecordingHandshakeCallback {
    successes: Cell<usize>,
    errors: RefCell<Vec<EndpointError>>,
    fallbacks: RefCell<Vec<Bytes>>,
    on_success: Hook,
    on_error: Hook,
    on_fallback: Hook,
}

impl RecordingHandshakeCallback {
    pub fn successes(&self) -> usize {
        self.successes.get()
    }

    pub fn errors(&self) -> Vec<EndpointError> {
        self.errors.borrow().clone()
    }

    pub fn fallbacks(&self) -> Vec<Bytes> {
        self.fallbacks.borrow().clone()
    }

    /// Run once inside the next `handshake_success`.
    pub fn on_success(&self, f: impl FnOnce() + 'static) {
        *self.on_success.borrow_mut() = Some(Box::new(f));
    }

    pub fn on_error(&self, f: impl FnOnce() + 'static) {
        *self.on_error.borrow_mut() = Some(Box::new(f));
    }

    pub fn on_fallback(&self, f: impl FnOnce() + 'static) {
        *self.on_fallback.borrow_mut() = Some(Box::new(f));
    }
}

impl ClientHandshakeCallback for RecordingHandshakeCallback {
    fn handshake_success(&self) {
        self.successes.set(self.successes.get() + 1);
        run_hook(&self.on_success);
    }

    fn handshake_error(&self, error: EndpointError) {
        self.errors.borrow_mut().push(error);
        run_hook(&self.on_error);
    }
}

impl ServerHandshakeCallback for RecordingHandshakeCallback {
    fn handshake_success(&self) {
        self.successes.set(self.successes.get() + 1);
        run_hook(&self.on_success);
    }

    fn handshake_error(&self, error: EndpointError) {
        self.errors.borrow_mut().push(error);
        run_hook(&self.on_error);
    }

    fn handshake_attempt_fallback(&self, client_hello: Bytes) {
        self.fallbacks.borrow_mut().push(client_hello);
        run_hook(&self.on_fallback);
    }
}

/// Records read-side deliveries.
#[derive(Default)]
pub struct RecordingReadCallback {
    datas: RefCell<Vec<Bytes>>,
    errors: RefCell<Vec<EndpointError>>,
    eofs: Cell<usize>,
}

impl RecordingReadCallback {
    pub fn datas(&self) -> Vec<Bytes> {
        self.datas.borrow().clone()
    }

    pub fn errors(&self) -> Vec<EndpointError> {
        self.errors.borrow().clone()
    }

    pub fn eofs(&self) -> usize {
        self.eofs.get()
    }
}

impl ReadCallback for RecordingReadCallback {
    fn read_available(&self, data: Bytes) {
        self.datas.borrow_mut().push(data);
    }

    fn read_eof(&self) {
        self.eofs.set(self.eofs.get() + 1);
    }

    fn read_error(&self, error: EndpointError) {
        self.errors.borrow_mut().push(error);
    }
}

/// Records write completions.
#[derive(Default)]
pub struct RecordingWriteCallback {
    successes: Cell<usize>,
    errors: RefCell<Vec<(usize, EndpointError)>>,
}

impl RecordingWriteCallback {
    pub fn successes(&self) -> usize {
        self.successes.get()
    }

    pub fn errors(&self) -> Vec<(usize, EndpointError)> {
        self.errors.borrow().clone()
    }
}

impl WriteCallback for RecordingWriteCallback {
    fn write_success(&self) {
        self.successes.set(self.successes.get() + 1);
    }

    fn write_err(&self, bytes_written: usize, error: EndpointError) {
        self.errors.borrow_mut().push((bytes_written, error));
    }
}

/// Records replay-safety notification.
#[derive(Default)]
pub struct RecordingReplayCallback {
    fired: Cell<usize>,
    on_fire: Hook,
}

impl RecordingReplayCallback {
    pub fn fired(&self) -> usize {
        self.fired.get()
    }

    pub fn on_fire(&self, f: impl FnOnce() + 'static) {
        *self.on_fire.borrow_mut() = Some(Box::new(f));
    }
}

impl ReplaySafetyCallback for RecordingReplayCallback {
    fn on_replay_safe(&self) {
        self.fired.set(self.fired.get() + 1);
        run_hook(&self.on_fire);
    }
}

/// Records dial outcomes.
#[derive(Default)]
pub struct RecordingConnectCallback {
    successes: Cell<usize>,
    errors: RefCell<Vec<EndpointError>>,
    on_success: Hook,
}

impl RecordingConnectCallback {
    pub fn successes(&self) -> usize {
        self.successes.get()
    }

    pub fn errors(&self) -> Vec<EndpointError> {
        self.errors.borrow().clone()
    }

    pub fn on_success(&self, f: impl FnOnce() + 'static) {
        *self.on_success.borrow_mut() = Some(Box::new(f));
    }
}

impl ConnectCallback for RecordingConnectCallback {
    fn connect_success(&self) {
        self.successes.set(self.successes.get() + 1);
        run_hook(&self.on_success);
    }

    fn connect_err(&self, error: EndpointError) {
        self.errors.borrow_mut().push(error);
    }
}

/// A certificate handle with a fixed identity.
#[derive(Debug, Clone)]
pub struct StaticCert {
    identity: String,
    der: Option<Bytes>,
}

impl StaticCert {
    pub fn new(identity: impl Into<String>) -> Rc<Self> {
        Rc::new(Self {
            identity: identity.into(),
            der: None,
        })
    }

    pub fn with_der(identity: impl Into<String>, der: impl Into<Bytes>) -> Rc<Self> {
        Rc::new(Self {
            identity: identity.into(),
            der: Some(der.into()),
        })
    }
}

impl PeerCert for StaticCert {
    fn identity(&self) -> String {
        self.identity.clone()
    }

    fn x509(&self) -> Option<Bytes> {
        self.der.clone()
    }
}
