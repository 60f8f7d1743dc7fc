//! End-to-end satellite scenarios over the wire: a real satellite process
//! image (CHIRP manager, CSCP socket, heartbeats) driven through CSCP
//! requests like a controller would.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use constellation_core::{Configuration, Dictionary, State, Value};
use constellation_mesh::sockets::ReqSocket;
use constellation_protocol::codec;
use constellation_protocol::cscp::{CscpMessage, CscpMessageType};
use constellation_satellite::{
    CommandRegistry, Satellite, SatelliteError, SatelliteHandle, SatelliteOptions, UserCommandError,
};
use tokio_util::sync::CancellationToken;

/// A test satellite that reads only the `a` key from its configuration.
#[derive(Default)]
struct ProbeSatellite;

#[async_trait]
impl Satellite for ProbeSatellite {
    async fn initializing(&mut self, config: &mut Configuration) -> Result<(), SatelliteError> {
        let _ = config.get::<i64>("a");
        Ok(())
    }

    async fn running(&mut self, stop: CancellationToken) -> Result<(), SatelliteError> {
        loop {
            tokio::select! {
                () = stop.cancelled() => return Ok(()),
                () = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
        }
    }
}

fn options(instance: &str, chirp_port: u16) -> SatelliteOptions {
    let mut options = SatelliteOptions::new("Probe", instance, "lifecycle_tests").unwrap();
    options.broadcast_addr = Ipv4Addr::new(127, 255, 255, 255);
    options.chirp_port = chirp_port;
    options.heartbeat_interval = Duration::from_millis(500);
    options
}

async fn spawn_probe(instance: &str, chirp_port: u16) -> Arc<SatelliteHandle> {
    SatelliteHandle::spawn(options(instance, chirp_port), ProbeSatellite, CommandRegistry::new())
        .await
        .unwrap()
}

async fn connect(handle: &SatelliteHandle) -> ReqSocket {
    ReqSocket::connect(SocketAddr::new(
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        handle.port(),
    ))
    .await
    .unwrap()
}

async fn command(req: &mut ReqSocket, verb: &str, payload: Option<Vec<u8>>) -> CscpMessage {
    let mut message = CscpMessage::request("MissionControl.test", verb);
    if let Some(payload) = payload {
        message = message.with_payload(payload);
    }
    let reply = req.request(&message.assemble().unwrap()).await.unwrap();
    CscpMessage::disassemble(&reply).unwrap()
}

fn dict_payload(entries: &[(&str, i64)]) -> Vec<u8> {
    let mut dict = Dictionary::new();
    for (key, value) in entries {
        dict.insert(*key, *value);
    }
    codec::encode_dictionary(&dict).unwrap()
}

fn run_id_payload(run_id: &str) -> Vec<u8> {
    codec::value_to_bytes(&Value::String(run_id.into())).unwrap()
}

/// Transitions complete asynchronously; poll `get_state` until the target
/// steady state is reported.
async fn wait_for_state(req: &mut ReqSocket, expected: &str) {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let reply = command(req, "get_state", None).await;
            if reply.verb() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for state {expected}"));
}

#[tokio::test]
async fn happy_path_through_a_run() {
    let handle = spawn_probe("happy", 47201).await;
    let mut req = connect(&handle).await;

    let reply = command(&mut req, "initialize", Some(dict_payload(&[]))).await;
    assert_eq!(reply.verb_type(), CscpMessageType::Success);
    wait_for_state(&mut req, "INIT").await;

    let reply = command(&mut req, "launch", None).await;
    assert_eq!(reply.verb_type(), CscpMessageType::Success);
    wait_for_state(&mut req, "ORBIT").await;

    let reply = command(&mut req, "start", Some(run_id_payload("run-7"))).await;
    assert_eq!(reply.verb_type(), CscpMessageType::Success);
    wait_for_state(&mut req, "RUN").await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    let reply = command(&mut req, "get_run_id", None).await;
    assert_eq!(reply.verb(), "run-7");

    let reply = command(&mut req, "stop", None).await;
    assert_eq!(reply.verb_type(), CscpMessageType::Success);
    wait_for_state(&mut req, "ORBIT").await;

    let reply = command(&mut req, "land", None).await;
    assert_eq!(reply.verb_type(), CscpMessageType::Success);
    wait_for_state(&mut req, "INIT").await;

    handle.shutdown();
    handle.join().await.unwrap();
}

#[tokio::test]
async fn illegal_transition_names_the_current_state() {
    let handle = spawn_probe("illegal", 47203).await;
    let mut req = connect(&handle).await;

    let reply = command(&mut req, "launch", None).await;
    assert_eq!(reply.verb_type(), CscpMessageType::Invalid);
    assert!(reply.verb().contains("NEW"), "reply was {:?}", reply.verb());

    handle.shutdown();
    handle.join().await.unwrap();
}

#[tokio::test]
async fn reconfigure_without_opt_in_is_notimplemented() {
    let handle = spawn_probe("noreconf", 47205).await;
    let mut req = connect(&handle).await;

    command(&mut req, "initialize", Some(dict_payload(&[]))).await;
    wait_for_state(&mut req, "INIT").await;
    command(&mut req, "launch", None).await;
    wait_for_state(&mut req, "ORBIT").await;

    let reply = command(&mut req, "reconfigure", Some(dict_payload(&[("x", 1)]))).await;
    assert_eq!(reply.verb_type(), CscpMessageType::NotImplemented);

    let reply = command(&mut req, "get_state", None).await;
    assert_eq!(reply.verb(), "ORBIT");

    handle.shutdown();
    handle.join().await.unwrap();
}

#[tokio::test]
async fn unused_configuration_keys_are_dropped() {
    let handle = spawn_probe("unused", 47207).await;
    let mut req = connect(&handle).await;

    command(&mut req, "initialize", Some(dict_payload(&[("a", 1), ("b", 2)]))).await;
    wait_for_state(&mut req, "INIT").await;

    let reply = command(&mut req, "get_config", None).await;
    assert_eq!(reply.verb_type(), CscpMessageType::Success);
    let stored = codec::decode_dictionary(reply.payload().unwrap()).unwrap();
    assert_eq!(stored.get("a"), Some(&Value::UInt(1)));
    assert!(!stored.contains_key("b"));

    handle.shutdown();
    handle.join().await.unwrap();
}

#[tokio::test]
async fn non_request_messages_are_rejected() {
    let handle = spawn_probe("badtype", 47209).await;
    let mut req = connect(&handle).await;

    let message = CscpMessage::new("MissionControl.test", CscpMessageType::Success, "get_state");
    let reply = req.request(&message.assemble().unwrap()).await.unwrap();
    let reply = CscpMessage::disassemble(&reply).unwrap();
    assert_eq!(reply.verb_type(), CscpMessageType::Error);

    handle.shutdown();
    handle.join().await.unwrap();
}

#[tokio::test]
async fn user_commands_dispatch_over_the_wire() {
    let mut registry = CommandRegistry::new();
    registry
        .add("scale", "scale an integer", &[], |value: i64| {
            Ok::<_, UserCommandError>(value * 10)
        })
        .unwrap();
    let handle = SatelliteHandle::spawn(options("usercmd", 47211), ProbeSatellite, registry)
        .await
        .unwrap();
    let mut req = connect(&handle).await;

    let mut args = constellation_core::List::new();
    args.push(4_i64);
    let reply = command(&mut req, "scale", Some(codec::encode_list(&args).unwrap())).await;
    assert_eq!(reply.verb_type(), CscpMessageType::Success);
    let value = codec::value_from_bytes(reply.payload().unwrap()).unwrap();
    assert_eq!(value.get::<i64>(), Ok(40));

    // The registered command shows up in get_commands.
    let reply = command(&mut req, "get_commands", None).await;
    let dict = codec::decode_dictionary(reply.payload().unwrap()).unwrap();
    assert!(dict.contains_key("scale"));

    handle.shutdown();
    handle.join().await.unwrap();
}

#[tokio::test]
async fn shutdown_command_stops_the_satellite() {
    let handle = spawn_probe("shutdown", 47213).await;
    let mut req = connect(&handle).await;

    command(&mut req, "initialize", Some(dict_payload(&[]))).await;
    wait_for_state(&mut req, "INIT").await;

    let reply = command(&mut req, "shutdown", None).await;
    assert_eq!(reply.verb_type(), CscpMessageType::Success);

    tokio::time::timeout(Duration::from_secs(5), handle.join())
        .await
        .expect("satellite shuts down")
        .unwrap();
    assert!(handle.state().is_steady());
}

#[tokio::test]
async fn shutdown_is_invalid_while_in_orbit() {
    let handle = spawn_probe("noshutdown", 47215).await;
    let mut req = connect(&handle).await;

    command(&mut req, "initialize", Some(dict_payload(&[]))).await;
    wait_for_state(&mut req, "INIT").await;
    command(&mut req, "launch", None).await;
    wait_for_state(&mut req, "ORBIT").await;

    let reply = command(&mut req, "shutdown", None).await;
    assert_eq!(reply.verb_type(), CscpMessageType::Invalid);
    assert!(reply.verb().contains("ORBIT"));

    handle.shutdown();
    handle.join().await.unwrap();
}

#[tokio::test]
async fn heartbeat_loss_drops_the_peer_to_safe() {
    use constellation_mesh::chirp::{ChirpConfig, ChirpManager};
    use constellation_mesh::heartbeat::HeartbeatSend;
    use constellation_mesh::sockets::PubSocket;
    use constellation_protocol::chirp::ServiceIdentifier;

    let chirp_port = 47217;
    let handle = spawn_probe("watcher", chirp_port).await;
    let mut req = connect(&handle).await;

    command(&mut req, "initialize", Some(dict_payload(&[]))).await;
    wait_for_state(&mut req, "INIT").await;
    command(&mut req, "launch", None).await;
    wait_for_state(&mut req, "ORBIT").await;

    // A bare heartbeat peer: CHIRP presence plus a CHP publisher.
    let peer_chirp = ChirpManager::start(ChirpConfig {
        group: "lifecycle_tests".into(),
        host: "Peer.one".into(),
        bind_addr: Ipv4Addr::UNSPECIFIED,
        broadcast_addr: Ipv4Addr::new(127, 255, 255, 255),
        port: chirp_port,
    })
    .unwrap();
    let socket = PubSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
        .await
        .unwrap();
    let peer_port = socket.port();
    let beats = HeartbeatSend::start(
        "Peer.one".into(),
        socket,
        Duration::from_millis(500),
        Arc::new(|| State::Orbit),
        Arc::new(|| None),
    );
    peer_chirp
        .register_service(ServiceIdentifier::Heartbeat, peer_port)
        .await;

    // Let the watcher connect and receive a few beats.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(handle.state(), State::Orbit);

    // Silent death: stop beating without a DEPART.
    beats.stop();

    tokio::time::timeout(Duration::from_millis(3500), async {
        loop {
            if handle.state() == State::Safe {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("watcher interrupts to SAFE after heartbeat loss");

    peer_chirp.shutdown().await;
    handle.shutdown();
    handle.join().await.unwrap();
}
