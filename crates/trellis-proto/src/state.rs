use std::rc::Rc;

use bytes::Bytes;
use trellis_core::ids::{CipherSuite, ProtocolVersion, PskKeyExchangeMode};

use crate::cert::PeerCert;
use crate::psk::PskType;

/// Coarse lifecycle phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    ClientHandshake,
    ServerHandshake,
    EarlyData,
    Established,
    Closed,
    Error,
}

impl Phase {
    /// Terminal phases admit no further transitions; actions issued afterwards
    /// are dropped by the driver.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Closed | Phase::Error)
    }
}

/// Snapshot of the parameters promised to the peer for a 0-RTT flight.
#[derive(Debug, Clone)]
pub struct EarlyDataParams {
    pub version: ProtocolVersion,
    pub cipher: CipherSuite,
    pub alpn: Option<String>,
    pub client_cert: Option<Rc<dyn PeerCert>>,
    pub server_cert: Option<Rc<dyn PeerCert>>,
}

/// The connection state record.
///
/// The driver is the single writer: the state machine mutates this only
/// through `MutateState` actions applied by the driver's interpreter.
#[derive(Debug)]
pub struct State {
    pub phase: Phase,
    pub version: Option<ProtocolVersion>,
    pub cipher: Option<CipherSuite>,
    pub alpn: Option<String>,
    pub psk_mode: Option<PskKeyExchangeMode>,
    pub psk_type: Option<PskType>,
    pub exporter_master_secret: Option<Bytes>,
    pub early_exporter_master_secret: Option<Bytes>,
    pub client_cert: Option<Rc<dyn PeerCert>>,
    pub server_cert: Option<Rc<dyn PeerCert>>,
    pub early_data_params: Option<EarlyDataParams>,
}

impl State {
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            version: None,
            cipher: None,
            alpn: None,
            psk_mode: None,
            psk_type: None,
            exporter_master_secret: None,
            early_exporter_master_secret: None,
            client_cert: None,
            server_cert: None,
            early_data_params: None,
        }
    }
}

impl Default for State {
    fn default() -> Self {
        State::new(Phase::Uninitialized)
    }
}
