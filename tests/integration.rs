//! End-to-end tests against fake switches
//!
//! The serial variant runs over an in-memory duplex stream, the WiFi bridge
//! variant over a loopback UDP socket. Catalog bundles are built on the fly.

use std::path::Path;

use ciborium::Value as Cbor;
use flate2::Compression;
use flate2::write::GzEncoder;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::UdpSocket;

use tsn_coreconf::coap_types::{Block2, CoapOption, Message, MessageType, Method, QueryParams, ResponseCode, option};
use tsn_coreconf::config::{CatalogConfig, CodecConfig, TransportConfig, TransportTarget};
use tsn_coreconf::frame::{Frame, FrameDecoder, FrameType};
use tsn_coreconf::instance_id::{InstancePath, decode_instances, decode_sequence};
use tsn_coreconf::{
    CatalogManager, CoapClient, Config, CoreconfError, CoreconfModel, Device, OutputFormat,
    SortMode, Transport,
};

const SAMPLE_SID: &str = r#"{
    "assignment-range": [{"entry-point": 60000, "size": 20}],
    "module-name": "example-1",
    "module-revision": "unknown",
    "item": [
        {"namespace": "module", "identifier": "example-1", "sid": 60000},
        {"namespace": "data", "identifier": "/example-1:greeting", "sid": 60001},
        {"namespace": "data", "identifier": "/example-1:greeting/author", "sid": 60002, "type": "string"},
        {"namespace": "data", "identifier": "/example-1:greeting/message", "sid": 60003, "type": "string"},
        {"namespace": "data", "identifier": "/example-1:users", "sid": 60004},
        {"namespace": "data", "identifier": "/example-1:users/user", "sid": 60005},
        {"namespace": "data", "identifier": "/example-1:users/user/id", "sid": 60006, "type": "uint16"},
        {"namespace": "data", "identifier": "/example-1:users/user/level", "sid": 60007, "type": "uint8"},
        {"namespace": "data", "identifier": "/example-1:reboot", "sid": 60010},
        {"namespace": "data", "identifier": "/example-1:reboot/input", "sid": 60011},
        {"namespace": "data", "identifier": "/example-1:reboot/input/delay", "sid": 60012, "type": "uint32"},
        {"namespace": "data", "identifier": "/example-1:reboot/output", "sid": 60013},
        {"namespace": "data", "identifier": "/example-1:reboot/output/status", "sid": 60014, "type": "string"}
    ],
    "key-mapping": {"60005": [60006]}
}"#;

const CHECKSUM: &str = "0a1b2c3d";
const CHECKSUM_SID: i64 = 29304;

fn model() -> CoreconfModel {
    CoreconfModel::from_sid_str(SAMPLE_SID).unwrap()
}

fn cbor_bytes(value: &Cbor) -> Vec<u8> {
    let mut out = Vec::new();
    ciborium::into_writer(value, &mut out).unwrap();
    out
}

fn instance(sid: i64, value: Cbor) -> Vec<u8> {
    cbor_bytes(&Cbor::Map(vec![(Cbor::Integer(sid.into()), value)]))
}

fn reply_to(request: &Message, code: ResponseCode, payload: Vec<u8>) -> Message {
    let mut reply = Message::request(Method::Get, request.message_id, request.token.clone());
    reply.message_type = MessageType::Acknowledgement;
    reply.code = code.0;
    reply.payload = payload;
    reply
}

/// Writes `<source>/<checksum>.tar.gz` holding the sample SID file
fn publish_catalog(source: &Path) {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    let mut header = tar::Header::new_gnu();
    header.set_size(SAMPLE_SID.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, "bundle/sid/example-1@unknown.sid", SAMPLE_SID.as_bytes())
        .unwrap();
    let archive = builder.into_inner().unwrap().finish().unwrap();
    std::fs::write(source.join(format!("{CHECKSUM}.tar.gz")), archive).unwrap();
}

/// Fake switch behind a UDP bridge: announces after the first ping and
/// answers checksum and leaf queries.
async fn run_bridge(bridge: UdpSocket) {
    let checksum_query = InstancePath::new(CHECKSUM_SID).encode_cbor().unwrap();
    let mut buf = [0u8; 2048];
    loop {
        let Ok((n, peer)) = bridge.recv_from(&mut buf).await else {
            return;
        };
        let Ok(frame) = Frame::decode(&buf[..n]) else {
            continue;
        };
        let reply = match frame.frame_type {
            FrameType::Ping => Frame::new(FrameType::Announce, b"tsn-switch 1.0".to_vec()),
            FrameType::Coap => {
                let request = Message::parse(&frame.payload).unwrap();
                let payload = if request.payload == checksum_query {
                    instance(CHECKSUM_SID, Cbor::Bytes(vec![0x0a, 0x1b, 0x2c, 0x3d]))
                } else {
                    let queries = decode_sequence(&request.payload).unwrap();
                    assert_eq!(queries, vec![Cbor::Integer(60002.into())]);
                    instance(60002, Cbor::Text("Obi".into()))
                };
                let reply = reply_to(&request, ResponseCode::CONTENT, payload);
                Frame::new(FrameType::Coap, reply.build().unwrap())
            }
            _ => continue,
        };
        if bridge.send_to(&reply.encode(), peer).await.is_err() {
            return;
        }
    }
}

/// Fake switch on a serial link; every CoAP request goes through `handler`
fn spawn_serial_switch<F>(link: DuplexStream, mut handler: F) -> tokio::task::JoinHandle<Vec<Message>>
where
    F: FnMut(&Message) -> Message + Send + 'static,
{
    tokio::spawn(async move {
        let (mut rx, mut tx) = tokio::io::split(link);
        let mut decoder = FrameDecoder::new();
        let mut seen = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = match rx.read(&mut buf).await {
                Ok(0) | Err(_) => return seen,
                Ok(n) => n,
            };
            for frame in decoder.push(&buf[..n]).into_iter().flatten() {
                let request = Message::parse(&frame.payload).unwrap();
                let reply = handler(&request);
                seen.push(request);
                let out = Frame::new(FrameType::Coap, reply.build().unwrap());
                if tx.write_all(&out.encode()).await.is_err() {
                    return seen;
                }
            }
        }
    })
}

fn serial_device(szx: u8, sort_mode: SortMode) -> (Device, DuplexStream) {
    let transport = Transport::new(TransportConfig {
        request_timeout_ms: 300,
        max_retries: 0,
        ..TransportConfig::default()
    });
    let (ours, theirs) = tokio::io::duplex(8192);
    transport.connect_stream(ours);
    let device = Device::from_parts(CoapClient::new(transport, szx), model(), sort_mode);
    (device, theirs)
}

#[tokio::test]
async fn test_open_over_bridge_loads_catalog() {
    let cache = tempfile::tempdir().unwrap();
    let source = tempfile::tempdir().unwrap();
    publish_catalog(source.path());

    let bridge = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let address = bridge.local_addr().unwrap().to_string();
    tokio::spawn(run_bridge(bridge));

    let config = Config {
        transport: TransportConfig {
            target: TransportTarget::WifiBridge { address },
            request_timeout_ms: 500,
            max_retries: 1,
            ready_timeout_ms: 2000,
        },
        catalog: CatalogConfig {
            cache_dir: Some(cache.path().to_path_buf()),
            source: Some(source.path().display().to_string()),
            ..CatalogConfig::default()
        },
        codec: CodecConfig::default(),
    };

    let device = Device::open(config).await.unwrap();
    assert_eq!(device.checksum(), Some(CHECKSUM));
    assert_eq!(device.model().sids().get_sid("/example-1:greeting/author"), Some(60002));

    let fetched = device
        .fetch(&json!(["/example-1:greeting/author"]), OutputFormat::Rfc7951)
        .await
        .unwrap();
    assert_eq!(fetched, json!({"example-1:greeting": {"author": "Obi"}}));

    let flat = device
        .fetch(&json!(["/example-1:greeting/author"]), OutputFormat::InstanceIdentifier)
        .await
        .unwrap();
    assert_eq!(flat, json!([{"/example-1:greeting/author": "Obi"}]));
    device.close();

    let cached = CatalogManager::new(&CatalogConfig {
        cache_dir: Some(cache.path().to_path_buf()),
        ..CatalogConfig::default()
    })
    .unwrap()
    .list_cached_catalogs()
    .unwrap();
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].checksum, CHECKSUM);
    assert_eq!(cached[0].sid_files, 1);
}

#[tokio::test]
async fn test_open_fails_when_switch_never_announces() {
    let cache = tempfile::tempdir().unwrap();
    // Bound but silent
    let bridge = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let config = Config {
        transport: TransportConfig {
            target: TransportTarget::WifiBridge {
                address: bridge.local_addr().unwrap().to_string(),
            },
            ready_timeout_ms: 100,
            ..TransportConfig::default()
        },
        catalog: CatalogConfig {
            cache_dir: Some(cache.path().to_path_buf()),
            ..CatalogConfig::default()
        },
        ..Config::default()
    };

    let err = Device::open(config).await.unwrap_err();
    assert!(matches!(err, CoreconfError::ReadyTimeout(100)));
    assert!(err.is_timeout());
}

#[tokio::test]
async fn test_datastore_blockwise_get() {
    let tree = json!({
        "example-1:greeting": {"author": "Obi", "message": "Hello there!"},
        "example-1:users": {"user": [{"id": 7, "level": 3}, {"id": 9, "level": 1}]}
    });
    let body = model().encode(&tree, SortMode::Velocity).unwrap();
    assert!(body.len() > 32, "body must span at least three blocks");

    let (device, link) = serial_device(0, SortMode::Velocity);
    let served = body.clone();
    let switch = spawn_serial_switch(link, move |request| {
        let block = Block2::from_option(request.find_option(option::BLOCK2).unwrap()).unwrap();
        let start = block.num as usize * 16;
        let end = (start + 16).min(served.len());
        let mut reply = reply_to(request, ResponseCode::CONTENT, served[start..end].to_vec());
        reply.add_option(Block2::new(block.num, end < served.len(), 0).to_option());
        reply.add_option(CoapOption::uint(option::SIZE2, served.len() as u32));
        reply
    });

    let datastore = device
        .get_datastore(QueryParams::default(), OutputFormat::Rfc7951)
        .await
        .unwrap();
    assert_eq!(datastore, tree);

    device.close();
    let requests = switch.await.unwrap();
    assert_eq!(requests.len(), body.len().div_ceil(16));
}

#[tokio::test]
async fn test_patch_and_rpc_over_serial() {
    let (device, link) = serial_device(4, SortMode::Rfc8949);
    let switch = spawn_serial_switch(link, |request| {
        if request.code == Method::Post.code() {
            let output = instance(60013, Cbor::Map(vec![(Cbor::Integer(60014.into()), Cbor::Text("scheduled".into()))]));
            reply_to(request, ResponseCode::CHANGED, output)
        } else {
            reply_to(request, ResponseCode::CHANGED, Vec::new())
        }
    });

    device
        .patch(&json!([
            {"/example-1:users/user[id='7']/level": 5},
            {"/example-1:greeting/message": null}
        ]))
        .await
        .unwrap();

    let output = device
        .invoke_rpc("/example-1:reboot", Some(&json!({"delay": 30})), OutputFormat::Rfc7951)
        .await
        .unwrap();
    assert_eq!(
        output,
        json!({"example-1:reboot": {"output": {"status": "scheduled"}}})
    );

    device.close();
    let requests = switch.await.unwrap();
    assert_eq!(requests.len(), 2);

    let patch = &requests[0];
    assert_eq!(patch.code, Method::IPatch.code());
    let instances = decode_instances(&patch.payload).unwrap();
    assert_eq!(instances.len(), 2);
    assert_eq!(instances[0].path.sid, 60007);
    assert_eq!(instances[0].path.keys, vec![Cbor::Integer(7.into())]);
    assert_eq!(instances[0].value, Cbor::Integer(5.into()));
    assert_eq!(instances[1].path, InstancePath::new(60003));
    assert_eq!(instances[1].value, Cbor::Null);

    let post = &requests[1];
    assert_eq!(post.code, Method::Post.code());
    let invocation = decode_instances(&post.payload).unwrap();
    assert_eq!(invocation[0].path, InstancePath::new(60010));
    assert_eq!(
        invocation[0].value,
        Cbor::Map(vec![(Cbor::Integer(60012.into()), Cbor::Integer(30.into()))])
    );
}

#[tokio::test]
async fn test_device_error_surfaces_code() {
    let (device, link) = serial_device(4, SortMode::Velocity);
    let _switch = spawn_serial_switch(link, |request| {
        reply_to(request, ResponseCode::NOT_FOUND, b"no such list entry".to_vec())
    });

    let err = device
        .fetch(&json!(["/example-1:users/user[id='99']"]), OutputFormat::Rfc7951)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreconfError::Protocol { ref code, .. } if code == "4.04"));
    assert_eq!(err.kind(), tsn_coreconf::ErrorKind::Protocol);
}

#[tokio::test]
async fn test_reads_drop_unknown_paths_writes_reject_them() {
    // Never connected: any request reaching the transport fails with NotConnected
    let transport = Transport::new(TransportConfig::default());
    let device = Device::from_parts(CoapClient::new(transport, 4), model(), SortMode::Velocity);

    let fetched = device
        .fetch(&json!(["/example-1:nowhere"]), OutputFormat::Rfc7951)
        .await
        .unwrap();
    assert_eq!(fetched, Value::Object(Default::default()));

    let err = device
        .patch(&json!([{"/example-1:nowhere": 1}]))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreconfError::SidNotFound(ref p) if p == "/example-1:nowhere"));

    let err = device
        .fetch(&json!(["/example-1:greeting"]), OutputFormat::Rfc7951)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreconfError::NotConnected));
}
