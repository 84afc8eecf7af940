//! The action vocabulary returned by the handshake state machine.
//!
//! One machine invocation yields an ordered [`Actions`] list, either
//! immediately or through a [`PendingActions`] resolved later on the same
//! loop. The driver applies a list atomically, in order, stopping early only
//! on `ReportError`.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use bytes::Bytes;
use trellis_core::error::EndpointError;
use trellis_core::transport::WireWrite;

use crate::machine::AppWrite;
use crate::state::State;

/// First-class state mutation, applied by the driver as the single writer.
pub type StateMutator = Box<dyn FnOnce(&mut State)>;

pub enum Action {
    /// Apply a mutation to the driver-owned [`State`].
    MutateState(StateMutator),
    /// Enqueue bytes on the transport.
    WriteToSocket(WireWrite),
    /// Hand decrypted application bytes to the read callback.
    DeliverAppData(Bytes),
    /// The full handshake finished.
    ReportHandshakeSuccess { early_data_accepted: bool },
    /// The early (0-RTT) handshake finished; the full handshake continues.
    ReportEarlyHandshakeSuccess { max_early_data_size: u32 },
    /// An early write never made it onto the wire (client only).
    ReportEarlyWriteFailed(AppWrite),
    /// Fatal failure; terminates the current action list.
    ReportError(EndpointError),
    /// No progress without more bytes from the peer.
    WaitForData,
    /// The peer requires a pre-1.3 protocol stack (server only).
    AttemptVersionFallback(Bytes),
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::MutateState(_) => f.write_str("MutateState"),
            Action::WriteToSocket(w) => f.debug_tuple("WriteToSocket").field(w).finish(),
            Action::DeliverAppData(b) => {
                f.debug_tuple("DeliverAppData").field(&b.len()).finish()
            }
            Action::ReportHandshakeSuccess { early_data_accepted } => f
                .debug_struct("ReportHandshakeSuccess")
                .field("early_data_accepted", early_data_accepted)
                .finish(),
            Action::ReportEarlyHandshakeSuccess { max_early_data_size } => f
                .debug_struct("ReportEarlyHandshakeSuccess")
                .field("max_early_data_size", max_early_data_size)
                .finish(),
            Action::ReportEarlyWriteFailed(w) => {
                f.debug_tuple("ReportEarlyWriteFailed").field(w).finish()
            }
            Action::ReportError(e) => f.debug_tuple("ReportError").field(e).finish(),
            Action::WaitForData => f.write_str("WaitForData"),
            Action::AttemptVersionFallback(b) => f
                .debug_tuple("AttemptVersionFallback")
                .field(&b.len())
                .finish(),
        }
    }
}

impl Action {
    /// Convenience for the common mutator shape.
    pub fn mutate(f: impl FnOnce(&mut State) + 'static) -> Self {
        Action::MutateState(Box::new(f))
    }
}

/// An ordered list of actions from one machine invocation.
#[derive(Debug, Default)]
pub struct Actions(pub Vec<Action>);

impl Actions {
    pub fn new() -> Self {
        Actions(Vec::new())
    }

    pub fn one(action: Action) -> Self {
        Actions(vec![action])
    }

    pub fn push(&mut self, action: Action) {
        self.0.push(action);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<Action>> for Actions {
    fn from(actions: Vec<Action>) -> Self {
        Actions(actions)
    }
}

impl FromIterator<Action> for Actions {
    fn from_iter<T: IntoIterator<Item = Action>>(iter: T) -> Self {
        Actions(iter.into_iter().collect())
    }
}

impl IntoIterator for Actions {
    type Item = Action;
    type IntoIter = std::vec::IntoIter<Action>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Result of a machine invocation: actions now, or actions later.
pub enum MachineOutput {
    Ready(Actions),
    Deferred(PendingActions),
}

impl From<Actions> for MachineOutput {
    fn from(actions: Actions) -> Self {
        MachineOutput::Ready(actions)
    }
}

impl From<Vec<Action>> for MachineOutput {
    fn from(actions: Vec<Action>) -> Self {
        MachineOutput::Ready(Actions(actions))
    }
}

struct PendingSlot {
    value: Option<Actions>,
    waiter: Option<Box<dyn FnOnce(Actions)>>,
}

/// Consumer side of a deferred action list.
///
/// This is a same-loop future without an executor: the driver registers a
/// continuation with [`PendingActions::on_ready`], and the producer fulfills
/// through its [`PendingHandle`]. Whichever side arrives second completes the
/// hand-off synchronously.
pub struct PendingActions {
    slot: Rc<RefCell<PendingSlot>>,
}

/// Producer side of a deferred action list.
pub struct PendingHandle {
    slot: Rc<RefCell<PendingSlot>>,
}

/// Create a deferred action list pair.
pub fn pending_actions() -> (PendingActions, PendingHandle) {
    let slot = Rc::new(RefCell::new(PendingSlot {
        value: None,
        waiter: None,
    }));
    (
        PendingActions {
            slot: Rc::clone(&slot),
        },
        PendingHandle { slot },
    )
}

impl PendingActions {
    /// Register the continuation. Runs immediately if already fulfilled.
    pub fn on_ready(self, f: impl FnOnce(Actions) + 'static) {
        let ready = {
            let mut slot = self.slot.borrow_mut();
            match slot.value.take() {
                Some(actions) => Some(actions),
                None => {
                    slot.waiter = Some(Box::new(f));
                    return;
                }
            }
        };
        if let Some(actions) = ready {
            f(actions);
        }
    }
}

impl PendingHandle {
    /// Fulfill with the action list. Consumes the handle; a deferred result
    /// resolves at most once.
    pub fn fulfill(self, actions: Actions) {
        let waiter = {
            let mut slot = self.slot.borrow_mut();
            match slot.waiter.take() {
                Some(waiter) => Some(waiter),
                None => {
                    slot.value = Some(actions);
                    return;
                }
            }
        };
        if let Some(waiter) = waiter {
            waiter(actions);
        }
    }
}

impl fmt::Debug for PendingActions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PendingActions")
    }
}

impl fmt::Debug for PendingHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PendingHandle")
    }
}
