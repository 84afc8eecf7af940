//! Event contract of the handshake state machine collaborator.
//!
//! The machine is pure: it receives events plus a read-only view of the
//! current [`State`] and answers with actions. It never performs I/O and it
//! never mutates state directly.

use std::fmt;
use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use trellis_core::transport::{WriteCallback, WriteFlags};

use crate::actions::MachineOutput;
use crate::context::{ClientContext, ServerContext};
use crate::psk::CachedPsk;
use crate::state::State;

/// One application write travelling toward the machine.
pub struct AppWrite {
    pub data: Bytes,
    pub flags: WriteFlags,
    pub callback: Option<Rc<dyn WriteCallback>>,
}

impl AppWrite {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            flags: WriteFlags::default(),
            callback: None,
        }
    }

    pub fn with_callback(mut self, callback: Rc<dyn WriteCallback>) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn with_flags(mut self, flags: WriteFlags) -> Self {
        self.flags = flags;
        self
    }
}

impl fmt::Debug for AppWrite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppWrite")
            .field("len", &self.data.len())
            .field("flags", &self.flags)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// Client-side handshake state machine.
///
/// `socket_data` receives the driver's accumulation buffer and consumes
/// whatever it can parse; unconsumed bytes stay for the next invocation.
pub trait ClientStateMachine {
    fn process_connect(
        &mut self,
        state: &State,
        context: &Rc<ClientContext>,
        sni: Option<&str>,
        cached_psk: Option<CachedPsk>,
    ) -> MachineOutput;

    fn process_socket_data(&mut self, state: &State, buf: &mut BytesMut) -> MachineOutput;

    fn process_app_write(&mut self, state: &State, write: AppWrite) -> MachineOutput;

    fn process_early_app_write(&mut self, state: &State, write: AppWrite) -> MachineOutput;

    fn process_app_close(&mut self, state: &State) -> MachineOutput;
}

/// Server-side handshake state machine.
pub trait ServerStateMachine {
    fn process_accept(&mut self, state: &State, context: &Rc<ServerContext>) -> MachineOutput;

    fn process_socket_data(&mut self, state: &State, buf: &mut BytesMut) -> MachineOutput;

    fn process_app_write(&mut self, state: &State, write: AppWrite) -> MachineOutput;

    fn process_app_close(&mut self, state: &State) -> MachineOutput;
}
