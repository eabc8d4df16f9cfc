//! RPC round-trip: the server adds 100 to each byte; the caller's user
//! context survives untouched.

mod common;

use common::{wait_until, PROPAGATION};
use silbus_participant::{
    Participant, ParticipantConfig, RpcCallResult, RpcCallStatus, RpcSpec,
};
use silbus_registry::Registry;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn add100_roundtrip_preserves_user_context() {
    let registry = Registry::start("silkit://127.0.0.1:0").expect("registry");

    let server_participant =
        Participant::connect(ParticipantConfig::default(), "RpcServer", registry.uri())
            .expect("server joins");

    let (call_tx, call_rx) = mpsc::channel();
    let server = server_participant
        .create_rpc_server(
            "AddServer",
            &RpcSpec::new("Add100"),
            Arc::new(move |event| {
                let _ = call_tx.send(event.clone());
            }),
        )
        .expect("create server");

    let client_participant =
        Participant::connect(ParticipantConfig::default(), "RpcClient", registry.uri())
            .expect("client joins");

    let (result_tx, result_rx) = mpsc::channel::<RpcCallResult>();
    let client = client_participant
        .create_rpc_client(
            "AddClient",
            &RpcSpec::new("Add100"),
            Arc::new(move |result| {
                let _ = result_tx.send(result.clone());
            }),
        )
        .expect("create client");

    assert!(
        wait_until(PROPAGATION, || client.matched_server_count() >= 1),
        "client discovered the server"
    );
    // Let the server's attachment to the client network settle.
    std::thread::sleep(Duration::from_millis(300));

    client.call(&[10, 20, 230], 0xCAFE);

    // Serve one call: add 100 to each byte.
    let call = call_rx
        .recv_timeout(PROPAGATION)
        .expect("server received the call");
    let answer: Vec<u8> = call.data.iter().map(|b| b.wrapping_add(100)).collect();
    server.submit_result(call.call_uuid, &answer);

    let result = result_rx
        .recv_timeout(PROPAGATION)
        .expect("client received the result");
    assert_eq!(result.status, RpcCallStatus::Success);
    assert_eq!(result.data, vec![110, 120, 74]);
    assert_eq!(result.user_context, 0xCAFE);
}

#[test]
fn call_without_a_server_fails_fast() {
    let registry = Registry::start("silkit://127.0.0.1:0").expect("registry");
    let participant =
        Participant::connect(ParticipantConfig::default(), "LoneClient", registry.uri())
            .expect("client joins");

    let (result_tx, result_rx) = mpsc::channel::<RpcCallResult>();
    let client = participant
        .create_rpc_client(
            "Client",
            &RpcSpec::new("Nobody"),
            Arc::new(move |result| {
                let _ = result_tx.send(result.clone());
            }),
        )
        .expect("create client");

    client.call(&[1], 7);
    let result = result_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("immediate result");
    assert_eq!(result.status, RpcCallStatus::ServerNotReachable);
    assert_eq!(result.user_context, 7);
}
