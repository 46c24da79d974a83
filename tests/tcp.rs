use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use bytes::{BufMut, BytesMut};
use rand::{thread_rng, RngCore};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time,
};

use shadowmux::{
    relay::{socks5::Address, tcprelay::ProxyClientStream},
    AccessKey, CipherKind, Cipher, Keyring, MetricsSink, ReplayProtector, Status, TcpService, Traffic,
};

const TEST_TIMEOUT: Duration = Duration::from_millis(200);

fn make_test_keys(n: usize) -> Vec<AccessKey> {
    (0..n)
        .map(|i| {
            AccessKey::new(
                i.to_string(),
                CipherKind::ChaCha20Poly1305,
                format!("test-secret-{i}"),
            )
        })
        .collect()
}

#[derive(Default)]
struct RecordingMetrics {
    closed: Mutex<Vec<(String, Status, Traffic)>>,
    probes: Mutex<Vec<(Status, u64)>>,
}

impl MetricsSink for RecordingMetrics {
    fn add_closed_tcp_connection(
        &self,
        key_id: &str,
        status: Status,
        traffic: &Traffic,
        _cipher_search: Duration,
        _duration: Duration,
    ) {
        self.closed.lock().unwrap().push((key_id.to_owned(), status, *traffic));
    }

    fn add_tcp_probe(&self, status: Status, drained_bytes: u64) {
        self.probes.lock().unwrap().push((status, drained_bytes));
    }
}

impl RecordingMetrics {
    fn closed(&self) -> Vec<(String, Status, Traffic)> {
        self.closed.lock().unwrap().clone()
    }

    fn probes(&self) -> Vec<(Status, u64)> {
        self.probes.lock().unwrap().clone()
    }
}

async fn start_tcp_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, ..)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

struct TestProxy {
    service: Arc<TcpService>,
    addr: SocketAddr,
    keyring: Arc<Keyring>,
    metrics: Arc<RecordingMetrics>,
}

async fn start_proxy(keys: Vec<AccessKey>, replay_capacity: usize) -> TestProxy {
    let keyring = Arc::new(Keyring::from_source(&keys).unwrap());
    let metrics = Arc::new(RecordingMetrics::default());
    let replay = Arc::new(ReplayProtector::new(replay_capacity));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let service = Arc::new(TcpService::new(
        listener,
        keyring.clone(),
        Some(replay),
        metrics.clone(),
        TEST_TIMEOUT,
    ));
    let starter = service.clone();
    tokio::spawn(async move {
        starter.start().await.unwrap();
    });

    TestProxy {
        service,
        addr,
        keyring,
        metrics,
    }
}

async fn wait_for_closed(metrics: &RecordingMetrics, count: usize) {
    for _ in 0..100 {
        if metrics.closed().len() >= count {
            return;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {count} closed connection record(s), got {:?}", metrics.closed());
}

async fn echo_roundtrip(proxy_addr: SocketAddr, key: &AccessKey, echo_addr: SocketAddr, len: usize) {
    let mut conn = ProxyClientStream::connect(proxy_addr, key, Address::from(echo_addr))
        .await
        .unwrap();

    let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
    conn.write_all(&payload).await.unwrap();

    let mut down = vec![0u8; len];
    conn.read_exact(&mut down).await.unwrap();
    assert_eq!(payload, down, "echo mismatch");

    conn.shutdown().await.unwrap();
}

#[tokio::test]
async fn tcp_echo() {
    let _ = env_logger::try_init();

    let echo_addr = start_tcp_echo_server().await;
    let keys = make_test_keys(1);
    let proxy = start_proxy(keys.clone(), 16).await;

    echo_roundtrip(proxy.addr, &keys[0], echo_addr, 1000).await;

    wait_for_closed(&proxy.metrics, 1).await;
    let closed = proxy.metrics.closed();
    let (key_id, status, traffic) = &closed[0];
    assert_eq!(key_id, "0");
    assert_eq!(*status, Status::Ok);
    assert_eq!(traffic.proxy_target, 1000);
    assert_eq!(traffic.target_proxy, 1000);
    // wire overhead: salt plus a tagged length and payload per chunk
    assert!(traffic.client_proxy > traffic.proxy_target);
    assert!(traffic.proxy_client > traffic.target_proxy);

    proxy.service.stop();
}

#[tokio::test]
async fn tcp_multi_key_fan_out() {
    let _ = env_logger::try_init();

    let echo_addr = start_tcp_echo_server().await;
    let keys = make_test_keys(100);
    let proxy = start_proxy(keys.clone(), 1000).await;

    let mut handles = Vec::new();
    for key in keys {
        let proxy_addr = proxy.addr;
        handles.push(tokio::spawn(async move {
            echo_roundtrip(proxy_addr, &key, echo_addr, 1000).await;
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    wait_for_closed(&proxy.metrics, 100).await;
    let closed = proxy.metrics.closed();
    assert_eq!(closed.len(), 100);
    assert!(closed.iter().all(|(_, status, ..)| *status == Status::Ok));

    let mut seen: Vec<&str> = closed.iter().map(|(id, ..)| id.as_str()).collect();
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen.len(), 100, "every key relayed exactly one connection");

    proxy.service.stop();
}

#[tokio::test]
async fn tcp_probe_resistance() {
    let _ = env_logger::try_init();

    let keys = make_test_keys(1);
    let proxy = start_proxy(keys, 16).await;

    let mut noise = [0u8; 64];
    thread_rng().fill_bytes(&mut noise);

    let started = Instant::now();
    let mut conn = TcpStream::connect(proxy.addr).await.unwrap();
    conn.write_all(&noise).await.unwrap();

    // the server must stay silent and keep the connection open until its
    // deadline, then close without having written a single byte
    let mut buf = [0u8; 1];
    let n = time::timeout(TEST_TIMEOUT * 4, conn.read(&mut buf))
        .await
        .expect("server did not close the probe connection")
        .unwrap();
    assert_eq!(n, 0, "server wrote to an unauthenticated prober");
    assert!(
        started.elapsed() >= TEST_TIMEOUT / 2,
        "probe connection closed too early to be indistinguishable"
    );

    wait_for_closed(&proxy.metrics, 1).await;
    assert_eq!(proxy.metrics.probes(), vec![(Status::ErrCipher, 64)]);
    let closed = proxy.metrics.closed();
    assert_eq!(closed[0].0, "");
    assert_eq!(closed[0].1, Status::ErrCipher);

    // noise never lands in the replay set: the same bytes still classify as
    // a cipher mismatch, not a replay
    let mut conn = TcpStream::connect(proxy.addr).await.unwrap();
    conn.write_all(&noise).await.unwrap();
    let n = time::timeout(TEST_TIMEOUT * 4, conn.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(n, 0);
    wait_for_closed(&proxy.metrics, 2).await;
    assert_eq!(proxy.metrics.probes()[1].0, Status::ErrCipher);

    proxy.service.stop();
}

/// Hand-build the first wire bytes of a connection: salt, sealed length,
/// sealed address header plus payload, all in one chunk.
fn build_handshake(key: &AccessKey, target: SocketAddr, payload: &[u8]) -> (Vec<u8>, Cipher) {
    let method = key.method();

    let mut salt = vec![0u8; method.salt_len()];
    thread_rng().fill_bytes(&mut salt);
    let mut cipher = Cipher::new(method, key.key(), &salt);

    let mut plain = BytesMut::new();
    Address::from(target).write_to_buf(&mut plain);
    plain.put_slice(payload);

    let mut packet = Vec::new();
    packet.extend_from_slice(&salt);
    append_chunk(&mut cipher, &plain, &mut packet);
    (packet, cipher)
}

fn append_chunk(cipher: &mut Cipher, plain: &[u8], packet: &mut Vec<u8>) {
    let tag_len = cipher.tag_len();

    let mut length_block = vec![0u8; 2 + tag_len];
    length_block[..2].copy_from_slice(&(plain.len() as u16).to_be_bytes());
    cipher.encrypt_packet(&mut length_block);
    packet.extend_from_slice(&length_block);

    let mut payload_block = vec![0u8; plain.len() + tag_len];
    payload_block[..plain.len()].copy_from_slice(plain);
    cipher.encrypt_packet(&mut payload_block);
    packet.extend_from_slice(&payload_block);
}

/// Read and decrypt one chunk of the server's response stream.
async fn read_response_chunk(
    conn: &mut TcpStream,
    key: &AccessKey,
    response_cipher: &mut Option<Cipher>,
) -> Vec<u8> {
    let method = key.method();

    if response_cipher.is_none() {
        let mut salt = vec![0u8; method.salt_len()];
        conn.read_exact(&mut salt).await.unwrap();
        *response_cipher = Some(Cipher::new(method, key.key(), &salt));
    }
    let cipher = response_cipher.as_mut().unwrap();

    let mut length_block = vec![0u8; 2 + method.tag_len()];
    conn.read_exact(&mut length_block).await.unwrap();
    assert!(cipher.decrypt_packet(&mut length_block));
    let length = u16::from_be_bytes([length_block[0], length_block[1]]) as usize;

    let mut payload_block = vec![0u8; length + method.tag_len()];
    conn.read_exact(&mut payload_block).await.unwrap();
    assert!(cipher.decrypt_packet(&mut payload_block));
    payload_block.truncate(length);
    payload_block
}

#[tokio::test]
async fn tcp_replay_rejected() {
    let _ = env_logger::try_init();

    let echo_addr = start_tcp_echo_server().await;
    let keys = make_test_keys(1);
    let proxy = start_proxy(keys.clone(), 16).await;

    let (handshake, mut request_cipher) = build_handshake(&keys[0], echo_addr, b"hello echo");

    // the legitimate connection works
    let mut original = TcpStream::connect(proxy.addr).await.unwrap();
    original.write_all(&handshake).await.unwrap();
    let mut response_cipher = None;
    let echoed = read_response_chunk(&mut original, &keys[0], &mut response_cipher).await;
    assert_eq!(echoed, b"hello echo");

    // replaying the captured handshake gets absorbed without a reply
    let mut replayed = TcpStream::connect(proxy.addr).await.unwrap();
    replayed.write_all(&handshake).await.unwrap();
    let mut buf = [0u8; 1];
    let n = time::timeout(TEST_TIMEOUT * 4, replayed.read(&mut buf))
        .await
        .expect("server did not close the replayed connection")
        .unwrap();
    assert_eq!(n, 0, "server answered a replayed handshake");

    // the original connection keeps relaying
    let mut second = Vec::new();
    append_chunk(&mut request_cipher, b"still alive", &mut second);
    original.write_all(&second).await.unwrap();
    let echoed = read_response_chunk(&mut original, &keys[0], &mut response_cipher).await;
    assert_eq!(echoed, b"still alive");

    let probes = proxy.metrics.probes();
    assert_eq!(probes.len(), 1);
    assert_eq!(probes[0], (Status::ErrReplay, handshake.len() as u64));

    proxy.service.stop();
}

#[tokio::test]
async fn tcp_affinity_moves_key_to_front() {
    let _ = env_logger::try_init();

    let echo_addr = start_tcp_echo_server().await;
    let keys = make_test_keys(100);
    let proxy = start_proxy(keys.clone(), 1000).await;

    let client_ip = "127.0.0.1".parse().unwrap();
    assert_eq!(proxy.keyring.snapshot_for(client_ip)[0].id(), "0");

    echo_roundtrip(proxy.addr, &keys[73], echo_addr, 1000).await;

    // the used key is now first in the trial order, so the next connection
    // from this client authenticates on the first attempt
    assert_eq!(proxy.keyring.snapshot_for(client_ip)[0].id(), "73");

    echo_roundtrip(proxy.addr, &keys[73], echo_addr, 1000).await;
    assert_eq!(proxy.keyring.snapshot_for(client_ip)[0].id(), "73");

    wait_for_closed(&proxy.metrics, 2).await;
    let closed = proxy.metrics.closed();
    assert!(closed.iter().all(|(id, status, ..)| id == "73" && *status == Status::Ok));

    proxy.service.stop();
}

#[tokio::test]
async fn tcp_service_lifecycle_is_idempotent() {
    let _ = env_logger::try_init();

    let echo_addr = start_tcp_echo_server().await;
    let keys = make_test_keys(1);
    let proxy = start_proxy(keys.clone(), 16).await;

    echo_roundtrip(proxy.addr, &keys[0], echo_addr, 100).await;

    proxy.service.stop();
    proxy.service.stop();

    // a second start after the listener was consumed returns immediately
    proxy.service.start().await.unwrap();

    // the listening socket is gone
    time::sleep(Duration::from_millis(50)).await;
    assert!(TcpStream::connect(proxy.addr).await.is_err());
}
