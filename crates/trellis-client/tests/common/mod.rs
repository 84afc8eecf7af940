#![allow(dead_code)]

use std::rc::Rc;

use bytes::Bytes;
use trellis_client::TlsClient;
use trellis_core::ids::{CipherSuite, ProtocolVersion, PskKeyExchangeMode};
use trellis_proto::actions::Action;
use trellis_proto::cert::PeerCert;
use trellis_proto::context::ClientContext;
use trellis_proto::psk::PskType;
use trellis_proto::state::EarlyDataParams;
use trellis_proto::testing::{
    mock_transport, ready, scripted_client_machine, MachineHandle, MockTransportHandle,
    RecordingHandshakeCallback,
};

pub const SNI: &str = "www.example.com";

pub struct Fixture {
    pub client: TlsClient,
    pub transport: MockTransportHandle,
    pub machine: MachineHandle,
    pub handshake: Rc<RecordingHandshakeCallback>,
}

pub fn fixture() -> Fixture {
    fixture_with_context(Rc::new(ClientContext::new()))
}

pub fn fixture_with_context(context: Rc<ClientContext>) -> Fixture {
    let (transport, transport_handle) = mock_transport();
    let (machine, machine_handle) = scripted_client_machine();
    let client = TlsClient::new(transport, context, machine);
    Fixture {
        client,
        transport: transport_handle,
        machine: machine_handle,
        handshake: Rc::new(RecordingHandshakeCallback::default()),
    }
}

/// Start the handshake; the machine answers the connect event with no
/// actions, as a real machine would while its first flight is in progress.
pub fn connect(fx: &Fixture) {
    fx.machine.expect_connect(|_, _, _| ready(Vec::new()));
    fx.client
        .connect(fx.handshake.clone(), Some(SNI), Some(SNI));
}

pub struct HandshakeParams {
    pub accepted: bool,
    pub alpn: Option<String>,
    pub client_cert: Option<Rc<dyn PeerCert>>,
    pub server_cert: Option<Rc<dyn PeerCert>>,
    pub psk_resumed: bool,
}

impl Default for HandshakeParams {
    fn default() -> Self {
        Self {
            accepted: false,
            alpn: Some("h2".to_string()),
            client_cert: None,
            server_cert: None,
            psk_resumed: false,
        }
    }
}

/// Drive the full handshake to completion with the given negotiated
/// parameters, fed through a `MutateState` ahead of the success report.
pub fn full_handshake_success(fx: &Fixture, params: HandshakeParams) {
    fx.machine.expect_socket_data(move |_, _| {
        let HandshakeParams {
            accepted,
            alpn,
            client_cert,
            server_cert,
            psk_resumed,
        } = params;
        ready(vec![
            Action::mutate(move |state| {
                state.exporter_master_secret =
                    Some(Bytes::from_static(b"12345678901234567890123456789012"));
                state.cipher = Some(CipherSuite::Aes128GcmSha256);
                state.version = Some(ProtocolVersion::Tls13);
                state.alpn = alpn;
                state.client_cert = client_cert;
                state.server_cert = server_cert;
                if accepted || psk_resumed {
                    state.psk_mode = Some(PskKeyExchangeMode::PskKe);
                    state.psk_type = Some(PskType::Resumption);
                }
            }),
            Action::ReportHandshakeSuccess {
                early_data_accepted: accepted,
            },
            Action::WaitForData,
        ])
    });
    fx.transport.deliver(Bytes::from_static(b"ServerData"));
}

pub fn complete_handshake(fx: &Fixture) {
    connect(fx);
    full_handshake_success(fx, HandshakeParams::default());
    assert_eq!(fx.handshake.successes(), 1);
}

pub fn early_params() -> EarlyDataParams {
    EarlyDataParams {
        version: ProtocolVersion::Tls13,
        cipher: CipherSuite::Aes128GcmSha256,
        alpn: Some("h2".to_string()),
        client_cert: None,
        server_cert: None,
    }
}

/// Drive the early (0-RTT) handshake: the promised parameters land in the
/// state, the early success reports a 1000-byte budget, and the full
/// handshake stays in flight.
pub fn complete_early_handshake(fx: &Fixture, params: EarlyDataParams) {
    connect(fx);
    fx.machine.expect_socket_data(move |_, _| {
        ready(vec![
            Action::mutate(move |state| state.early_data_params = Some(params)),
            Action::ReportEarlyHandshakeSuccess {
                max_early_data_size: 1000,
            },
            Action::WaitForData,
        ])
    });
    fx.transport.deliver(Bytes::from_static(b"ServerData"));
    assert_eq!(fx.handshake.successes(), 1);
    assert!(!fx.client.is_replay_safe());
}
