//! End-to-end satellite scenarios over the CSCP socket.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use constellation_core::chirp::{ChirpConfig, ChirpManager};
use constellation_core::heartbeat::HeartbeatConfig;
use constellation_core::protocol::cscp::{CscpMessage, CscpType};
use constellation_core::protocol::{Configuration, Dictionary, List, State, Value};
use constellation_core::satellite::{
    CommandRegistry, Fsm, Satellite, SatelliteConfig, SatelliteServer,
};
use constellation_core::transport;

const ADDR_A: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);
const ADDR_B: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 2);

fn free_udp_port() -> u16 {
    let probe = std::net::UdpSocket::bind((ADDR_A, 0)).expect("bind probe");
    probe.local_addr().expect("probe addr").port()
}

#[derive(Default)]
struct TestSat;

impl Satellite for TestSat {
    fn initializing(&mut self, config: &mut Configuration) -> anyhow::Result<()> {
        let _x: i64 = config.get_or("x", 0)?;
        Ok(())
    }

    fn running(&mut self, token: &CancellationToken) -> anyhow::Result<()> {
        while !token.is_cancelled() {
            std::thread::sleep(Duration::from_millis(10));
        }
        Ok(())
    }
}

#[derive(Default)]
struct ReconfSat {
    gain: i64,
}

impl Satellite for ReconfSat {
    fn supports_reconfigure(&self) -> bool {
        true
    }

    fn initializing(&mut self, config: &mut Configuration) -> anyhow::Result<()> {
        self.gain = config.get_or("gain", 1)?;
        Ok(())
    }

    fn reconfiguring(&mut self, partial: &Configuration) -> anyhow::Result<()> {
        self.gain = partial.get_or("gain", self.gain)?;
        Ok(())
    }
}

#[derive(Default)]
struct BrokenSat;

impl Satellite for BrokenSat {
    fn launching(&mut self) -> anyhow::Result<()> {
        anyhow::bail!("thruster misaligned")
    }
}

struct Client {
    stream: TcpStream,
}

impl Client {
    async fn connect(port: u16) -> Self {
        let stream = TcpStream::connect((ADDR_A, port)).await.expect("connect");
        Client { stream }
    }

    async fn send_raw(&mut self, msg: CscpMessage) -> CscpMessage {
        transport::write_message(&mut self.stream, &msg.to_frames())
            .await
            .expect("send");
        let frames = tokio::time::timeout(
            Duration::from_secs(2),
            transport::read_message(&mut self.stream),
        )
        .await
        .expect("reply expected")
        .expect("stream intact");
        CscpMessage::from_frames(&frames).expect("valid reply")
    }

    async fn request(&mut self, verb: &str, payload: Option<Vec<u8>>) -> CscpMessage {
        let mut msg = CscpMessage::request("MissionControl", verb);
        if let Some(payload) = payload {
            msg = msg.with_payload(payload);
        }
        self.send_raw(msg).await
    }

    /// Poll `get_state` until the satellite reports `expected`.
    async fn wait_state(&mut self, expected: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            let reply = self.request("get_state", None).await;
            if reply.verb.1 == expected {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "state never became {expected}, last was {}",
                reply.verb.1
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

async fn spawn_satellite(
    satellite: Box<dyn Satellite>,
    commands: CommandRegistry,
) -> (u16, Fsm, Arc<ChirpManager>, JoinHandle<anyhow::Result<()>>) {
    let chirp = ChirpManager::new(
        ChirpConfig::new("testgroup", "sat1")
            .with_listen_address(ADDR_A)
            .with_broadcast_address(ADDR_B)
            .with_port(free_udp_port()),
    )
    .expect("chirp manager");

    let config = SatelliteConfig {
        bind_address: ADDR_A,
        heartbeat: HeartbeatConfig {
            bind_address: ADDR_A,
            ..HeartbeatConfig::default()
        },
    };
    let server = SatelliteServer::new(
        "Demo",
        "sat1",
        satellite,
        Arc::clone(&chirp),
        commands,
        config,
    )
    .await
    .expect("satellite server");

    let port = server.port();
    let fsm = server.fsm().clone();
    let handle = tokio::spawn(server.run());
    (port, fsm, chirp, handle)
}

fn init_payload(pairs: &[(&str, i64)]) -> Vec<u8> {
    let mut dict = Dictionary::new();
    for (key, value) in pairs {
        dict.insert(*key, *value);
    }
    dict.assemble()
}

#[tokio::test]
async fn happy_path_to_shutdown() {
    let (port, _fsm, chirp, handle) = spawn_satellite(Box::<TestSat>::default(), CommandRegistry::new()).await;
    let mut client = Client::connect(port).await;

    let reply = client.request("get_name", None).await;
    assert_eq!(reply.verb.0, CscpType::Success);
    assert_eq!(reply.verb.1, "Demo.sat1");
    assert_eq!(reply.header.sender, "Demo.sat1");

    let reply = client.request("get_state", None).await;
    assert_eq!(reply.verb.1, "NEW");

    let reply = client
        .request("initialize", Some(init_payload(&[("x", 1)])))
        .await;
    assert_eq!(reply.verb.0, CscpType::Success);
    client.wait_state("INIT").await;

    // the used configuration is readable back
    let reply = client.request("get_config", None).await;
    let config = Dictionary::disassemble(reply.payload.as_deref().unwrap()).unwrap();
    assert_eq!(config.get("x").unwrap().as_i64().unwrap(), 1);

    let reply = client.request("launch", None).await;
    assert_eq!(reply.verb.0, CscpType::Success);
    client.wait_state("ORBIT").await;

    let reply = client
        .request("start", Some(Value::UInt64(42).assemble()))
        .await;
    assert_eq!(reply.verb.0, CscpType::Success);
    client.wait_state("RUN").await;

    let reply = client.request("get_run_id", None).await;
    assert_eq!(reply.verb.1, "42");

    let reply = client.request("stop", None).await;
    assert_eq!(reply.verb.0, CscpType::Success);
    client.wait_state("ORBIT").await;

    let reply = client.request("land", None).await;
    assert_eq!(reply.verb.0, CscpType::Success);
    client.wait_state("INIT").await;

    // shutdown is allowed from INIT and stops the command loop
    let reply = client.request("shutdown", None).await;
    assert_eq!(reply.verb.0, CscpType::Success);
    handle.await.expect("loop joined").expect("clean shutdown");
    chirp.shutdown().await;
}

#[tokio::test]
async fn invalid_transition_from_new() {
    let (port, _fsm, chirp, handle) = spawn_satellite(Box::<TestSat>::default(), CommandRegistry::new()).await;
    let mut client = Client::connect(port).await;

    let reply = client
        .request("start", Some(Value::UInt64(42).assemble()))
        .await;
    assert_eq!(reply.verb.0, CscpType::Invalid);

    let reply = client.request("get_state", None).await;
    assert_eq!(reply.verb.1, "NEW");

    client.request("shutdown", None).await;
    handle.await.unwrap().unwrap();
    chirp.shutdown().await;
}

#[tokio::test]
async fn protocol_violations_are_answered() {
    let (port, _fsm, chirp, handle) = spawn_satellite(Box::<TestSat>::default(), CommandRegistry::new()).await;
    let mut client = Client::connect(port).await;

    // unknown verb
    let reply = client.request("warp_drive", None).await;
    assert_eq!(reply.verb.0, CscpType::Unknown);

    // non-REQUEST message
    let reply = client
        .send_raw(CscpMessage::new("MissionControl", CscpType::Success, "hi"))
        .await;
    assert_eq!(reply.verb.0, CscpType::Error);

    // initialize without its mandatory payload
    let reply = client.request("initialize", None).await;
    assert_eq!(reply.verb.0, CscpType::Incomplete);

    // initialize with a garbage payload
    let reply = client.request("initialize", Some(vec![0xc1, 0xff])).await;
    assert_eq!(reply.verb.0, CscpType::Incomplete);

    // shutdown not allowed once in ORBIT
    client
        .request("initialize", Some(init_payload(&[])))
        .await;
    client.wait_state("INIT").await;
    client.request("launch", None).await;
    client.wait_state("ORBIT").await;
    let reply = client.request("shutdown", None).await;
    assert_eq!(reply.verb.0, CscpType::Invalid);

    // wind down
    client.request("land", None).await;
    client.wait_state("INIT").await;
    client.request("shutdown", None).await;
    handle.await.unwrap().unwrap();
    chirp.shutdown().await;
}

#[tokio::test]
async fn user_commands_are_gated() {
    let mut registry = CommandRegistry::new();
    registry.register(
        "get_temperature",
        "Read the instrument temperature",
        vec![State::Orbit, State::Run],
        0,
        Box::new(|_args| Ok(Some(Value::Double(23.5)))),
    );
    registry.register(
        "echo",
        "Echo the first argument",
        Vec::new(),
        1,
        Box::new(|args| Ok(args.get(0).cloned())),
    );

    let (port, _fsm, chirp, handle) = spawn_satellite(Box::<TestSat>::default(), registry).await;
    let mut client = Client::connect(port).await;

    // state gate: not callable before ORBIT
    let reply = client.request("get_temperature", None).await;
    assert_eq!(reply.verb.0, CscpType::Invalid);

    client
        .request("initialize", Some(init_payload(&[])))
        .await;
    client.wait_state("INIT").await;
    client.request("launch", None).await;
    client.wait_state("ORBIT").await;

    let reply = client.request("get_temperature", None).await;
    assert_eq!(reply.verb.0, CscpType::Success);
    let value = Value::disassemble(reply.payload.as_deref().unwrap()).unwrap();
    assert_eq!(value, Value::Double(23.5));

    // arity violation
    let reply = client.request("echo", None).await;
    assert_eq!(reply.verb.0, CscpType::Incomplete);

    let mut args = List::new();
    args.push("ping");
    let reply = client.request("echo", Some(args.assemble())).await;
    assert_eq!(reply.verb.0, CscpType::Success);
    let value = Value::disassemble(reply.payload.as_deref().unwrap()).unwrap();
    assert_eq!(value, Value::String("ping".into()));

    // user commands appear in get_commands
    let reply = client.request("get_commands", None).await;
    let commands = Dictionary::disassemble(reply.payload.as_deref().unwrap()).unwrap();
    assert!(commands.contains_key("get_temperature"));
    assert!(commands.contains_key("initialize"));

    client.request("land", None).await;
    client.wait_state("INIT").await;
    client.request("shutdown", None).await;
    handle.await.unwrap().unwrap();
    chirp.shutdown().await;
}

#[tokio::test]
async fn interrupt_lands_in_safe_and_recovers() {
    let (port, fsm, chirp, handle) = spawn_satellite(Box::<TestSat>::default(), CommandRegistry::new()).await;
    let mut client = Client::connect(port).await;

    client
        .request("initialize", Some(init_payload(&[])))
        .await;
    client.wait_state("INIT").await;
    client.request("launch", None).await;
    client.wait_state("ORBIT").await;
    client
        .request("start", Some(Value::UInt64(7).assemble()))
        .await;
    client.wait_state("RUN").await;

    // what the liveness tracker does on constellation failure
    fsm.request_interrupt();
    client.wait_state("SAFE").await;

    // a second request while already SAFE is a no-op
    fsm.request_interrupt();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let reply = client.request("get_state", None).await;
    assert_eq!(reply.verb.1, "SAFE");

    // recovery path: SAFE -> initializing -> INIT
    let reply = client
        .request("initialize", Some(init_payload(&[])))
        .await;
    assert_eq!(reply.verb.0, CscpType::Success);
    client.wait_state("INIT").await;

    client.request("shutdown", None).await;
    handle.await.unwrap().unwrap();
    chirp.shutdown().await;
}

#[tokio::test]
async fn reconfigure_support_is_optional() {
    // TestSat does not implement reconfigure
    let (port, _fsm, chirp, handle) = spawn_satellite(Box::<TestSat>::default(), CommandRegistry::new()).await;
    let mut client = Client::connect(port).await;

    client
        .request("initialize", Some(init_payload(&[])))
        .await;
    client.wait_state("INIT").await;
    client.request("launch", None).await;
    client.wait_state("ORBIT").await;

    let reply = client
        .request("reconfigure", Some(init_payload(&[("gain", 5)])))
        .await;
    assert_eq!(reply.verb.0, CscpType::NotImplemented);

    client.request("land", None).await;
    client.wait_state("INIT").await;
    client.request("shutdown", None).await;
    handle.await.unwrap().unwrap();
    chirp.shutdown().await;

    // ReconfSat does, and the stored config picks up the partial update
    let (port, _fsm, chirp, handle) =
        spawn_satellite(Box::<ReconfSat>::default(), CommandRegistry::new()).await;
    let mut client = Client::connect(port).await;

    client
        .request("initialize", Some(init_payload(&[("gain", 1)])))
        .await;
    client.wait_state("INIT").await;
    client.request("launch", None).await;
    client.wait_state("ORBIT").await;

    let reply = client
        .request("reconfigure", Some(init_payload(&[("gain", 5)])))
        .await;
    assert_eq!(reply.verb.0, CscpType::Success);
    client.wait_state("ORBIT").await;

    let reply = client.request("get_config", None).await;
    let config = Dictionary::disassemble(reply.payload.as_deref().unwrap()).unwrap();
    assert_eq!(config.get("gain").unwrap().as_i64().unwrap(), 5);

    client.request("land", None).await;
    client.wait_state("INIT").await;
    client.request("shutdown", None).await;
    handle.await.unwrap().unwrap();
    chirp.shutdown().await;
}

#[tokio::test]
async fn failing_transition_moves_to_error() {
    let (port, _fsm, chirp, handle) =
        spawn_satellite(Box::<BrokenSat>::default(), CommandRegistry::new()).await;
    let mut client = Client::connect(port).await;

    client
        .request("initialize", Some(init_payload(&[])))
        .await;
    client.wait_state("INIT").await;
    client.request("launch", None).await;
    client.wait_state("ERROR").await;

    // the diagnostic is surfaced via get_status
    let reply = client.request("get_status", None).await;
    assert!(reply.verb.1.contains("thruster misaligned"));

    // ERROR is terminal except for shutdown
    let reply = client.request("launch", None).await;
    assert_eq!(reply.verb.0, CscpType::Invalid);
    let reply = client
        .request("initialize", Some(init_payload(&[])))
        .await;
    assert_eq!(reply.verb.0, CscpType::Invalid);

    let reply = client.request("shutdown", None).await;
    assert_eq!(reply.verb.0, CscpType::Success);
    handle.await.unwrap().unwrap();
    chirp.shutdown().await;
}
