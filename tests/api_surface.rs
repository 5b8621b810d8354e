//! Observer API tests over a real TCP loopback connection

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use varuna_io::api::{ApiServer, Request, Response};
use varuna_io::command::{CommandDispatcher, CommandKind, CommandStatus};
use varuna_io::config::{ApiConfig, CommandConfig, LinkConfig, VehicleConfig, VideoConfig};
use varuna_io::hub::SubscriptionHub;
use varuna_io::link::transport::{DatagramTransport, MockTransport};
use varuna_io::link::{LinkManager, LinkState, TransportFactory};
use varuna_io::state::{Aggregator, FieldValue, TelemetryField, Unit, VehicleSnapshot};
use varuna_io::video::VideoStreamRegistry;

struct Fixture {
    api: Arc<ApiServer>,
    aggregator: Arc<Aggregator>,
    hub: Arc<SubscriptionHub>,
    running: Arc<AtomicBool>,
    addr: std::net::SocketAddr,
}

fn fixture() -> Fixture {
    let running = Arc::new(AtomicBool::new(true));
    let aggregator = Arc::new(Aggregator::new());
    let mock = Arc::new(MockTransport::new());
    let factory: TransportFactory =
        Box::new(move || Ok(Arc::clone(&mock) as Arc<dyn DatagramTransport>));

    let link = Arc::new(LinkManager::new(
        VehicleConfig {
            name: "test-rov".to_string(),
            address: "192.168.2.2".to_string(),
            port: 14550,
        },
        LinkConfig {
            connect_timeout_ms: 100,
            liveness_window_ms: 5_000,
            heartbeat_interval_ms: 1_000,
            reconnect_backoff_base_ms: 50,
            reconnect_backoff_max_ms: 200,
        },
        factory,
        Arc::clone(&aggregator),
        Arc::clone(&running),
    ));

    let api_config = ApiConfig {
        bind_address: "127.0.0.1:0".to_string(),
        queue_depth: 4,
        tick_interval_ms: 1_000,
        write_timeout_ms: 500,
    };

    let hub = Arc::new(SubscriptionHub::new(
        api_config.clone(),
        Duration::from_secs(5),
        Arc::clone(&aggregator),
        Arc::clone(&running),
    ));

    let dispatcher = Arc::new(CommandDispatcher::new(
        CommandConfig {
            timeout_ms: 1_000,
            retention_ms: 60_000,
        },
        link.clone(),
        Arc::clone(&aggregator),
        Arc::clone(&hub),
        Arc::clone(&running),
    ));

    let video = Arc::new(VideoStreamRegistry::new(
        VideoConfig {
            expiry_ms: 10_000,
            default_stream_port: 5600,
        },
        "192.168.2.2",
    ));

    let api = Arc::new(
        ApiServer::new(
            &api_config,
            Duration::from_secs(5),
            link,
            Arc::clone(&aggregator),
            dispatcher,
            Arc::clone(&hub),
            video,
            Arc::clone(&running),
        )
        .unwrap(),
    );
    api.start().unwrap();
    let addr = api.local_addr().unwrap();

    Fixture {
        api,
        aggregator,
        hub,
        running,
        addr,
    }
}

fn client(fix: &Fixture) -> TcpStream {
    let stream = TcpStream::connect(fix.addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(3)))
        .unwrap();
    stream
}

fn send_request(stream: &mut TcpStream, request: &Request) {
    let payload = serde_json::to_vec(request).unwrap();
    stream
        .write_all(&(payload.len() as u32).to_be_bytes())
        .unwrap();
    stream.write_all(&payload).unwrap();
}

fn read_payload(stream: &mut TcpStream) -> Vec<u8> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).unwrap();
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).unwrap();
    payload
}

fn read_response(stream: &mut TcpStream) -> Response {
    serde_json::from_slice(&read_payload(stream)).unwrap()
}

fn wait_until(deadline_ms: u64, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_millis(deadline_ms);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn status_query_reports_link_state() {
    let fix = fixture();
    let mut stream = client(&fix);

    send_request(&mut stream, &Request::Status);
    match read_response(&mut stream) {
        Response::Status { link, subscribers } => {
            assert_eq!(link.state, LinkState::Disconnected);
            assert_eq!(link.address, "192.168.2.2");
            assert_eq!(subscribers, 0);
        }
        other => panic!("unexpected response: {other:?}"),
    }

    fix.running.store(false, Ordering::Relaxed);
}

#[test]
fn telemetry_query_returns_snapshot_with_staleness() {
    let fix = fixture();
    fix.aggregator.set_link_down(false);
    fix.aggregator.apply(vec![TelemetryField {
        name: "depth",
        value: FieldValue::F64(3.2),
        unit: Unit::Meters,
        seq: 4,
    }]);

    let mut stream = client(&fix);
    send_request(&mut stream, &Request::Telemetry);
    match read_response(&mut stream) {
        Response::Telemetry { snapshot } => {
            assert_eq!(snapshot.version, 1);
            let depth = &snapshot.fields["depth"];
            assert_eq!(depth.value, FieldValue::F64(3.2));
            assert!(!depth.stale);
        }
        other => panic!("unexpected response: {other:?}"),
    }

    fix.running.store(false, Ordering::Relaxed);
}

#[test]
fn command_submission_and_polling() {
    let fix = fixture();
    let mut stream = client(&fix);

    // Link is down, so the request is accepted but lands Failed
    send_request(
        &mut stream,
        &Request::Command {
            command: CommandKind::SetLightsLevel { level: 50 },
        },
    );
    let id = match read_response(&mut stream) {
        Response::CommandAccepted { id } => id,
        other => panic!("unexpected response: {other:?}"),
    };

    send_request(&mut stream, &Request::CommandStatus { id });
    match read_response(&mut stream) {
        Response::CommandStatus { request: Some(view) } => {
            assert_eq!(view.id, id);
            assert_eq!(view.status, CommandStatus::Failed);
        }
        other => panic!("unexpected response: {other:?}"),
    }

    fix.running.store(false, Ordering::Relaxed);
}

#[test]
fn invalid_command_is_rejected() {
    let fix = fixture();
    let mut stream = client(&fix);

    send_request(
        &mut stream,
        &Request::Command {
            command: CommandKind::SetLightsLevel { level: 200 },
        },
    );
    match read_response(&mut stream) {
        Response::Error { message } => assert!(message.contains("lights level")),
        other => panic!("unexpected response: {other:?}"),
    }

    fix.running.store(false, Ordering::Relaxed);
}

#[test]
fn stream_registry_roundtrip() {
    let fix = fixture();
    let mut stream = client(&fix);

    send_request(
        &mut stream,
        &Request::RegisterStream {
            name: "main".to_string(),
            url: "rtsp://192.168.2.2:8554/main".to_string(),
            protocol: None,
        },
    );
    assert!(matches!(
        read_response(&mut stream),
        Response::StreamRegistered
    ));

    send_request(&mut stream, &Request::Streams);
    match read_response(&mut stream) {
        Response::Streams { streams } => {
            assert_eq!(streams.len(), 1);
            assert_eq!(streams[0].name, "main");
            assert!(streams[0].live);
        }
        other => panic!("unexpected response: {other:?}"),
    }

    fix.running.store(false, Ordering::Relaxed);
}

#[test]
fn subscribe_streams_snapshots_and_close_unsubscribes() {
    let fix = fixture();
    fix.aggregator.set_link_down(false);
    let mut stream = client(&fix);

    send_request(&mut stream, &Request::Subscribe);
    assert!(matches!(read_response(&mut stream), Response::Subscribed));
    assert!(wait_until(2_000, || fix.hub.subscriber_count() == 1));

    fix.aggregator.apply(vec![TelemetryField {
        name: "depth",
        value: FieldValue::F64(1.5),
        unit: Unit::Meters,
        seq: 1,
    }]);
    fix.hub.publish();

    // Every frame after Subscribed is a full snapshot
    let snapshot: VehicleSnapshot = serde_json::from_slice(&read_payload(&mut stream)).unwrap();
    assert_eq!(snapshot.version, 1);
    assert!(snapshot.fields.contains_key("depth"));

    // Client closing the connection tears the subscriber down
    drop(stream);
    assert!(wait_until(3_000, || {
        fix.hub.publish();
        fix.hub.subscriber_count() == 0
    }));

    let _ = &fix.api;
    fix.running.store(false, Ordering::Relaxed);
}
