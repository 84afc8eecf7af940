//! Handshake-protocol types shared by the Trellis client and server drivers.
//!
//! The handshake state machine itself is a collaborator: a pure function from
//! events to [`actions::Actions`] that never touches the transport. This crate
//! defines that contract (state, events, actions, deferred resolution), the
//! shared resources drivers hand to it (PSK cache, certificate handles,
//! contexts), the keying-material exporter, and the endpoint plumbing common
//! to both drivers.

pub mod actions;
pub mod callbacks;
pub mod cert;
pub mod context;
pub mod ekm;
pub mod endpoint;
pub mod machine;
pub mod psk;
pub mod state;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use actions::{
    pending_actions, Action, Actions, MachineOutput, PendingActions, PendingHandle, StateMutator,
};
pub use callbacks::{
    ClientHandshakeCallback, ConnectCallback, ReadCallback, ReplaySafetyCallback,
    ServerHandshakeCallback,
};
pub use cert::PeerCert;
pub use context::{ClientContext, ServerContext};
pub use ekm::{export_keying_material, ExporterError};
pub use endpoint::EndpointCore;
pub use machine::{AppWrite, ClientStateMachine, ServerStateMachine};
pub use psk::{CachedPsk, MemoryPskCache, PskCache, PskType};
pub use state::{EarlyDataParams, Phase, State};
