//! Client driver behavior against a scripted state machine and mock
//! transport: event dispatch, action interpretation, lifecycle, and
//! destruction safety.

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;
use trellis_client::{EndpointError, TlsClient, WriteFlags};
use trellis_core::transport::WireWrite;
use trellis_proto::actions::{pending_actions, Action, Actions, MachineOutput};
use trellis_proto::context::ClientContext;
use trellis_proto::ekm::ExporterError;
use trellis_proto::psk::{CachedPsk, MemoryPskCache, PskCache};
use trellis_proto::state::Phase;
use trellis_proto::testing::{
    ready, scripted_client_machine, MachineCall, RecordingHandshakeCallback,
    RecordingReadCallback, RecordingWriteCallback, StaticCert,
};
use trellis_core::ids::{CipherSuite, ProtocolVersion};

use common::{
    complete_handshake, connect, fixture, fixture_with_context, full_handshake_success,
    HandshakeParams, SNI,
};

#[test]
fn connect_feeds_machine_once() {
    let fx = fixture();
    connect(&fx);
    assert_eq!(
        fx.machine.calls(),
        vec![MachineCall::Connect {
            sni: Some(SNI.to_string()),
            had_psk: false,
        }]
    );
    assert!(fx.transport.has_observer());
}

#[test]
fn connect_consults_psk_cache() {
    let cache = Rc::new(MemoryPskCache::default());
    cache.put(
        SNI,
        CachedPsk::resumption(
            &b"secret"[..],
            ProtocolVersion::Tls13,
            CipherSuite::Aes128GcmSha256,
        ),
    );
    let context = Rc::new(ClientContext::new().with_psk_cache(cache));
    let fx = fixture_with_context(context);
    connect(&fx);
    assert_eq!(
        fx.machine.calls(),
        vec![MachineCall::Connect {
            sni: Some(SNI.to_string()),
            had_psk: true,
        }]
    );
}

#[test]
fn connect_without_transport_reports_error() {
    let (machine, _handle) = scripted_client_machine();
    let client = TlsClient::unconnected(Rc::new(ClientContext::new()), machine);
    let handshake = Rc::new(RecordingHandshakeCallback::default());
    client.connect(handshake.clone(), Some(SNI), None);
    assert_eq!(
        handshake.errors(),
        vec![EndpointError::NoUnderlyingSocket]
    );
    assert!(!client.good());
}

#[test]
fn read_single_waits_for_more_data() {
    let fx = fixture();
    connect(&fx);
    fx.machine
        .expect_socket_data(|_, _| ready(vec![Action::WaitForData]));
    fx.transport.deliver(Bytes::from_static(b"ClientHello"));
    assert_eq!(fx.machine.socket_data_calls(), 1);
}

#[test]
fn read_refeeds_until_machine_waits() {
    let fx = fixture();
    connect(&fx);
    fx.machine.expect_socket_data(|_, _| ready(Vec::new()));
    fx.machine
        .expect_socket_data(|_, _| ready(vec![Action::WaitForData]));
    fx.transport.deliver(Bytes::from_static(b"ClientHello"));
    assert_eq!(fx.machine.socket_data_calls(), 2);
}

#[test]
fn writes_reach_machine_in_order() {
    let fx = fixture();
    connect(&fx);
    fx.machine.expect_app_write(|_, _| ready(Vec::new()));
    fx.machine.expect_app_write(|_, _| ready(Vec::new()));
    fx.client
        .write(None, Bytes::from_static(b"HTTP GET"), WriteFlags::default());
    fx.client
        .write(None, Bytes::from_static(b"HTTP POST"), WriteFlags::default());
    assert_eq!(
        fx.machine.app_writes(),
        vec![Bytes::from_static(b"HTTP GET"), Bytes::from_static(b"HTTP POST")]
    );
}

#[test]
fn write_on_errored_transport_fails_callback() {
    let fx = fixture();
    connect(&fx);
    fx.transport.set_error(true);
    let write_cb = Rc::new(RecordingWriteCallback::default());
    fx.client
        .write(Some(write_cb.clone()), Bytes::from_static(b"test"), WriteFlags::default());
    let errors = write_cb.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, 0);
    assert!(fx.machine.app_writes().is_empty());
}

#[test]
fn plain_handshake_is_replay_safe_with_alpn() {
    let fx = fixture();
    complete_handshake(&fx);
    assert!(fx.client.is_replay_safe());
    assert_eq!(fx.client.application_protocol(), "h2");
    assert_eq!(fx.client.phase(), Phase::Established);
}

#[test]
fn application_protocol_empty_when_not_negotiated() {
    let fx = fixture();
    connect(&fx);
    full_handshake_success(
        &fx,
        HandshakeParams {
            alpn: None,
            ..HandshakeParams::default()
        },
    );
    assert_eq!(fx.handshake.successes(), 1);
    assert_eq!(fx.client.application_protocol(), "");
}

#[test]
fn exporter_requires_established_connection() {
    let fx = fixture();
    assert_eq!(
        fx.client.ekm("EXPORTER-Some-Label", None, 32),
        Err(ExporterError::NotEstablished)
    );
    complete_handshake(&fx);
    let ekm = fx.client.ekm("EXPORTER-Some-Label", None, 32).unwrap();
    assert_eq!(ekm.len(), 32);
}

#[test]
fn handshake_error_fires_once_and_fails_later_writes() {
    let fx = fixture();
    connect(&fx);
    fx.machine.expect_socket_data(|_, _| {
        ready(vec![
            Action::ReportError(EndpointError::protocol("unit test")),
            Action::WaitForData,
        ])
    });
    fx.transport.deliver(Bytes::from_static(b"ClientHello"));
    assert_eq!(fx.handshake.errors().len(), 1);
    assert_eq!(fx.handshake.successes(), 0);
    assert!(fx.client.error());

    let write_cb = Rc::new(RecordingWriteCallback::default());
    fx.client
        .write(Some(write_cb.clone()), Bytes::from_static(b"test"), WriteFlags::default());
    let errors = write_cb.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, 0);
}

#[test]
fn driver_may_be_destroyed_inside_handshake_error() {
    let fx = fixture();
    let common::Fixture {
        client,
        transport,
        machine,
        handshake,
    } = fx;
    let slot: Rc<RefCell<Option<TlsClient>>> = Rc::new(RefCell::new(Some(client)));

    machine.expect_connect(|_, _, _| ready(Vec::new()));
    slot.borrow()
        .as_ref()
        .unwrap()
        .connect(handshake.clone(), Some(SNI), None);

    machine.expect_socket_data(|_, _| {
        ready(vec![
            Action::ReportError(EndpointError::protocol("unit test")),
            Action::WaitForData,
        ])
    });
    let slot2 = Rc::clone(&slot);
    handshake.on_error(move || {
        slot2.borrow_mut().take();
    });
    transport.deliver(Bytes::from_static(b"ClientHello"));
    assert!(slot.borrow().is_none());
    assert_eq!(handshake.errors().len(), 1);
}

#[test]
fn app_data_reaches_read_callback() {
    let fx = fixture();
    complete_handshake(&fx);
    let read_cb = Rc::new(RecordingReadCallback::default());
    fx.client.set_read_callback(Some(read_cb.clone()));
    fx.machine.expect_socket_data(|_, _| {
        ready(vec![
            Action::DeliverAppData(Bytes::from_static(b"HI")),
            Action::WaitForData,
        ])
    });
    fx.transport.deliver(Bytes::from_static(b"ClientHello"));
    assert_eq!(read_cb.datas(), vec![Bytes::from_static(b"HI")]);
}

#[test]
fn app_data_buffers_until_read_callback_installed() {
    let fx = fixture();
    complete_handshake(&fx);
    fx.machine.expect_socket_data(|_, _| {
        ready(vec![
            Action::DeliverAppData(Bytes::from_static(b"one")),
            Action::DeliverAppData(Bytes::from_static(b"two")),
            Action::WaitForData,
        ])
    });
    fx.transport.deliver(Bytes::from_static(b"ClientHello"));

    let read_cb = Rc::new(RecordingReadCallback::default());
    fx.client.set_read_callback(Some(read_cb.clone()));
    assert_eq!(
        read_cb.datas(),
        vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]
    );
}

#[test]
fn write_to_socket_action_hits_transport() {
    let fx = fixture();
    complete_handshake(&fx);
    fx.machine.expect_socket_data(|_, _| {
        ready(vec![
            Action::WriteToSocket(WireWrite::new(Bytes::from_static(b"XYZ"))),
            Action::WaitForData,
        ])
    });
    fx.transport.deliver(Bytes::from_static(b"ClientHello"));
    assert_eq!(fx.transport.written(), vec![Bytes::from_static(b"XYZ")]);
}

#[test]
fn state_mutators_run_exactly_once() {
    let fx = fixture();
    complete_handshake(&fx);
    let runs = Rc::new(RefCell::new(0u32));
    let runs2 = Rc::clone(&runs);
    fx.machine.expect_socket_data(move |_, _| {
        ready(vec![
            Action::mutate(move |state| {
                *runs2.borrow_mut() += 1;
                state.phase = Phase::Error;
            }),
            Action::WaitForData,
        ])
    });
    fx.transport.deliver(Bytes::from_static(b"ClientHello"));
    assert_eq!(*runs.borrow(), 1);
    assert_eq!(fx.client.phase(), Phase::Error);
}

#[test]
fn report_error_halts_remaining_actions() {
    let fx = fixture();
    complete_handshake(&fx);
    let read_cb = Rc::new(RecordingReadCallback::default());
    fx.client.set_read_callback(Some(read_cb.clone()));
    fx.machine.expect_socket_data(|_, _| {
        ready(vec![
            Action::ReportError(EndpointError::protocol("unit test")),
            Action::DeliverAppData(Bytes::from_static(b"dropped")),
        ])
    });
    assert!(!fx.client.error());
    fx.transport.deliver(Bytes::from_static(b"Data"));
    assert!(fx.client.error());
    assert!(read_cb.datas().is_empty());
    assert_eq!(read_cb.errors().len(), 1);
}

#[test]
fn close_now_during_handshake_emits_close_alert() {
    let fx = fixture();
    connect(&fx);
    fx.machine.expect_app_close(|_| {
        ready(vec![
            Action::mutate(|state| state.phase = Phase::Error),
            Action::WriteToSocket(WireWrite::new(Bytes::from_static(b"closenotify"))),
        ])
    });
    fx.client.close_now();
    assert_eq!(fx.handshake.errors().len(), 1);
    assert!(fx.transport.close_now_calls() >= 1);
    assert_eq!(fx.transport.written(), vec![Bytes::from_static(b"closenotify")]);
}

#[test]
fn connecting_tracks_transport_and_handshake() {
    let fx = fixture();
    fx.transport.set_connecting(true);
    assert!(fx.client.connecting());
    fx.transport.set_connecting(false);
    connect(&fx);
    assert!(fx.client.connecting());
    fx.machine.expect_socket_data(|_, _| {
        ready(vec![
            Action::ReportHandshakeSuccess {
                early_data_accepted: false,
            },
            Action::WaitForData,
        ])
    });
    fx.transport.deliver(Bytes::from_static(b"ClientHello"));
    assert_eq!(fx.handshake.successes(), 1);
    assert!(!fx.client.connecting());
}

#[test]
fn good_tracks_transport_state() {
    let fx = fixture();
    connect(&fx);
    assert!(fx.client.good());
    fx.transport.set_good(false);
    assert!(!fx.client.good());
}

#[test]
fn good_tracks_machine_phase() {
    let fx = fixture();
    complete_handshake(&fx);
    assert!(fx.client.good());
    fx.machine.expect_socket_data(|_, _| {
        ready(vec![Action::mutate(|state| state.phase = Phase::Error)])
    });
    fx.transport.deliver(Bytes::from_static(b"Data"));
    assert!(!fx.client.good());
}

#[test]
fn certs_default_to_none() {
    let fx = fixture();
    complete_handshake(&fx);
    assert!(fx.client.self_cert().is_none());
    assert!(fx.client.peer_cert().is_none());
}

#[test]
fn negotiated_certs_are_exposed() {
    let fx = fixture();
    connect(&fx);
    full_handshake_success(
        &fx,
        HandshakeParams {
            client_cert: Some(StaticCert::new("client-id")),
            server_cert: Some(StaticCert::new("server-id")),
            ..HandshakeParams::default()
        },
    );
    assert_eq!(fx.client.self_cert().unwrap().identity(), "client-id");
    assert_eq!(fx.client.peer_cert().unwrap().identity(), "server-id");
}

#[test]
fn psk_resumption_is_reported() {
    let fx = fixture();
    connect(&fx);
    full_handshake_success(
        &fx,
        HandshakeParams {
            psk_resumed: true,
            ..HandshakeParams::default()
        },
    );
    assert!(fx.client.psk_resumed());

    let fresh = fixture();
    complete_handshake(&fresh);
    assert!(!fresh.client.psk_resumed());
}

#[test]
fn writes_queue_while_async_result_outstanding() {
    let fx = fixture();
    complete_handshake(&fx);
    let (pending, handle) = pending_actions();
    fx.machine
        .expect_socket_data(move |_, _| MachineOutput::Deferred(pending));
    fx.transport.deliver(Bytes::from_static(b"Data"));
    assert!(!fx.client.is_detachable());

    fx.machine.expect_app_write(|_, _| ready(Vec::new()));
    fx.client
        .write(None, Bytes::from_static(b"queued"), WriteFlags::default());
    assert!(fx.machine.app_writes().is_empty());

    handle.fulfill(Actions::from(vec![Action::WaitForData]));
    assert_eq!(fx.machine.app_writes(), vec![Bytes::from_static(b"queued")]);
    assert!(fx.client.is_detachable());
}

#[test]
fn close_now_with_outstanding_result_suppresses_it() {
    let fx = fixture();
    complete_handshake(&fx);
    let read_cb = Rc::new(RecordingReadCallback::default());
    fx.client.set_read_callback(Some(read_cb.clone()));

    let (pending, handle) = pending_actions();
    fx.machine
        .expect_socket_data(move |_, _| MachineOutput::Deferred(pending));
    fx.transport.deliver(Bytes::from_static(b"Data"));

    let write_cb = Rc::new(RecordingWriteCallback::default());
    fx.client.write(
        Some(write_cb.clone()),
        Bytes::from_static(b"queued write"),
        WriteFlags::default(),
    );

    fx.client.close_now();
    let errors = write_cb.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, 0);
    assert_eq!(read_cb.eofs(), 1);
    assert!(fx.transport.close_now_calls() >= 1);

    // No machine activity may result from the stale resolution.
    handle.fulfill(Actions::from(vec![Action::WaitForData]));
    assert!(fx.machine.app_writes().is_empty());
}

#[test]
fn graceful_close_waits_for_outstanding_result() {
    let fx = fixture();
    complete_handshake(&fx);
    let (pending, handle) = pending_actions();
    fx.machine
        .expect_socket_data(move |_, _| MachineOutput::Deferred(pending));
    fx.transport.deliver(Bytes::from_static(b"Data"));

    fx.machine.expect_app_write(|_, _| ready(Vec::new()));
    fx.client
        .write(None, Bytes::from_static(b"queued write"), WriteFlags::default());
    fx.client.close();
    assert_eq!(fx.machine.app_close_calls(), 0);

    fx.machine.expect_app_close(|_| {
        ready(vec![
            Action::mutate(|state| state.phase = Phase::Error),
            Action::WriteToSocket(WireWrite::new(Bytes::from_static(b"closenotify"))),
        ])
    });
    handle.fulfill(Actions::from(vec![Action::WaitForData]));

    assert_eq!(fx.machine.app_writes(), vec![Bytes::from_static(b"queued write")]);
    assert_eq!(fx.machine.app_close_calls(), 1);
    assert!(fx.transport.close_calls() >= 1);
    assert!(fx
        .transport
        .written()
        .contains(&Bytes::from_static(b"closenotify")));
}

#[test]
fn destroying_mid_wait_suppresses_effects_but_drains_machine() {
    let common::Fixture {
        client,
        transport,
        machine,
        handshake,
    } = fixture();
    machine.expect_connect(|_, _, _| ready(Vec::new()));
    client.connect(handshake.clone(), Some(SNI), None);

    let (p1, h1) = pending_actions();
    machine.expect_socket_data(move |_, _| MachineOutput::Deferred(p1));
    transport.deliver(Bytes::from_static(b"ClientHello"));
    drop(client);

    let (p2, h2) = pending_actions();
    machine.expect_socket_data(move |_, _| MachineOutput::Deferred(p2));
    h1.fulfill(Actions::new());
    h2.fulfill(Actions::from(vec![Action::WaitForData]));
    assert_eq!(machine.socket_data_calls(), 2);
    assert_eq!(handshake.successes(), 0);
    assert_eq!(handshake.errors().len(), 0);
}

#[test]
fn connect_to_on_open_transport_reports_already_open() {
    let fx = fixture();
    let connect_cb = Rc::new(trellis_proto::testing::RecordingConnectCallback::default());
    fx.client.connect_to(
        "127.0.0.1:4433".parse().unwrap(),
        connect_cb.clone(),
        fx.handshake.clone(),
        Some(SNI),
        None,
    );
    assert_eq!(connect_cb.errors(), vec![EndpointError::AlreadyOpen]);
    assert!(fx.machine.calls().is_empty());
}

#[test]
fn transport_error_routes_to_handshake_callback_first() {
    let fx = fixture();
    connect(&fx);
    fx.transport
        .deliver_error(EndpointError::Transport("io failure".to_string()));
    assert_eq!(fx.handshake.errors().len(), 1);
    assert_eq!(fx.handshake.successes(), 0);
}

#[test]
fn transport_eof_after_handshake_reaches_read_callback() {
    let fx = fixture();
    complete_handshake(&fx);
    let read_cb = Rc::new(RecordingReadCallback::default());
    fx.client.set_read_callback(Some(read_cb.clone()));
    fx.transport.deliver_eof();
    assert_eq!(read_cb.eofs(), 1);
}

#[test]
fn early_ekm_uses_early_secret() {
    let fx = fixture();
    connect(&fx);
    assert_eq!(
        fx.client.early_ekm("EXPORTER-Some-Label", None, 32),
        Err(ExporterError::NotEstablished)
    );
    let params = common::early_params();
    fx.machine.expect_socket_data(move |_, _| {
        ready(vec![
            Action::mutate(move |state| {
                state.early_data_params = Some(params);
                state.early_exporter_master_secret =
                    Some(Bytes::from_static(b"abcdefghijklmnopqrstuvwxyz012345"));
            }),
            Action::ReportEarlyHandshakeSuccess {
                max_early_data_size: 1000,
            },
            Action::WaitForData,
        ])
    });
    fx.transport.deliver(Bytes::from_static(b"ServerData"));
    let ekm = fx.client.early_ekm("EXPORTER-Some-Label", None, 32).unwrap();
    assert_eq!(ekm.len(), 32);
}
