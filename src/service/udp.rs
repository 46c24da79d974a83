//! Multi-key shadowsocks UDP server
//!
//! A single listening socket serves every client. Each inbound datagram is
//! matched to its access key by trial decryption, then forwarded through a
//! per-client NAT association: an unconnected target-side socket plus one
//! task reading replies from it. Associations expire when no client packet
//! has refreshed them for the configured timeout; eviction aborts the
//! reader task and drops the association's half of the target socket.

use std::{
    collections::HashMap,
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use bytes::BytesMut;
use log::{debug, error, info, trace, warn};
use tokio::{
    net::{lookup_host, UdpSocket},
    task::JoinHandle,
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::{
    keyring::{KeyEntry, Keyring},
    metrics::{MetricsSink, Status},
    relay::{
        socks5::Address,
        udprelay::{
            crypto_io::{decrypt_payload, encrypt_payload},
            DEFAULT_TIMEOUT, MAXIMUM_UDP_PAYLOAD_SIZE,
        },
    },
    service::{allow_all, prohibited_target, ClientFilter},
};

type NatMap = Arc<Mutex<HashMap<SocketAddr, NatEntry>>>;

/// One client's association: the target-side socket and its reader task
struct NatEntry {
    key_id: String,
    socket: Arc<UdpSocket>,
    last_seen: Arc<Mutex<Instant>>,
    handle: JoinHandle<()>,
    metrics: Arc<dyn MetricsSink>,
}

impl Drop for NatEntry {
    fn drop(&mut self) {
        self.handle.abort();
        self.metrics.remove_udp_nat_entry();
    }
}

/// UDP proxy service over a pre-bound socket
pub struct UdpService {
    socket: Arc<UdpSocket>,
    context: Arc<ServiceContext>,
    shutdown: CancellationToken,
    running: AtomicBool,
}

struct ServiceContext {
    keyring: Arc<Keyring>,
    metrics: Arc<dyn MetricsSink>,
    timeout: Duration,
    filter: ClientFilter,
    nat: NatMap,
}

impl UdpService {
    /// Creates a service. `timeout` is the NAT association idle expiry,
    /// [`DEFAULT_TIMEOUT`] when not given.
    pub fn new(
        socket: UdpSocket,
        keyring: Arc<Keyring>,
        metrics: Arc<dyn MetricsSink>,
        timeout: Option<Duration>,
    ) -> UdpService {
        UdpService {
            socket: Arc::new(socket),
            context: Arc::new(ServiceContext {
                keyring,
                metrics,
                timeout: timeout.unwrap_or(DEFAULT_TIMEOUT),
                filter: allow_all(),
                nat: Arc::new(Mutex::new(HashMap::new())),
            }),
            shutdown: CancellationToken::new(),
            running: AtomicBool::new(false),
        }
    }

    /// Replaces the client admission predicate. Only effective before
    /// `start`.
    pub fn with_client_filter(mut self, filter: ClientFilter) -> UdpService {
        Arc::get_mut(&mut self.context)
            .expect("client filter must be set before start")
            .filter = filter;
        self
    }

    /// Local address of the listening socket
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receives and relays datagrams until [`stop`](Self::stop) is called.
    /// Idempotent: a second concurrent call returns immediately.
    pub async fn start(&self) -> io::Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Ok(addr) = self.socket.local_addr() {
            info!("shadowmux udp server listening on {}", addr);
        }

        let mut buffer = [0u8; MAXIMUM_UDP_PAYLOAD_SIZE];
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = self.socket.recv_from(&mut buffer) => {
                    let (n, peer_addr) = match received {
                        Ok(r) => r,
                        Err(err) => {
                            error!("udp server recv_from failed with error: {}", err);
                            continue;
                        }
                    };

                    serve_packet(&self.socket, &self.context, &buffer[..n], peer_addr).await;
                }
            }
        }

        // Dropping the associations closes their target sockets and stops
        // the readers.
        self.context.nat.lock().unwrap().clear();
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Stops the receive loop and removes every association. Idempotent.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

async fn serve_packet(listener: &Arc<UdpSocket>, context: &Arc<ServiceContext>, data: &[u8], peer_addr: SocketAddr) {
    if let Some(reason) = (context.filter)(peer_addr.ip()) {
        warn!("udp client {} rejected: {}", peer_addr, reason);
        context
            .metrics
            .add_udp_packet_from_client("", Status::ErrAddress, data.len(), 0, Duration::ZERO);
        return;
    }

    // Trial-decrypt against the affinity-ordered snapshot. The open is in
    // place, every attempt gets a fresh copy.
    let search_started = Instant::now();
    let snapshot = context.keyring.snapshot_for(peer_addr.ip());
    let mut scratch = vec![0u8; data.len()];
    let mut found = None;
    for entry in snapshot {
        scratch.copy_from_slice(data);
        match decrypt_payload(entry.method(), entry.key(), &mut scratch) {
            Ok((target_addr, payload)) => {
                found = Some((entry, target_addr, payload.to_vec()));
                break;
            }
            Err(..) => continue,
        }
    }

    let (entry, target_addr, payload) = match found {
        Some(f) => f,
        None => {
            debug!(
                "udp client {} matched no access key, dropping datagram of {} bytes",
                peer_addr,
                data.len()
            );
            context
                .metrics
                .add_udp_packet_from_client("", Status::ErrCipher, data.len(), 0, search_started.elapsed());
            return;
        }
    };
    context.keyring.mark_used(&entry, peer_addr.ip());
    let time_to_cipher = search_started.elapsed();

    if prohibited_target(&target_addr) {
        warn!("udp client {} requested prohibited destination {}", peer_addr, target_addr);
        context
            .metrics
            .add_udp_packet_from_client(entry.id(), Status::ErrAddress, data.len(), 0, time_to_cipher);
        return;
    }

    // Resolve before touching the NAT table, the target socket's address
    // family follows the destination.
    let target_sa = match resolve_target(&target_addr).await {
        Ok(sa) => sa,
        Err(err) => {
            debug!("udp client {} target {} did not resolve: {}", peer_addr, target_addr, err);
            context
                .metrics
                .add_udp_packet_from_client(entry.id(), Status::ErrDial, data.len(), 0, time_to_cipher);
            return;
        }
    };

    let association = lookup_association(context, peer_addr, &entry);
    let (target_socket, last_seen) = match association {
        Some(a) => a,
        None => match create_association(listener, context, peer_addr, &entry, target_sa).await {
            Ok(a) => a,
            Err(err) => {
                error!("udp failed to open target socket for {}: {}", peer_addr, err);
                context
                    .metrics
                    .add_udp_packet_from_client(entry.id(), Status::ErrDial, data.len(), 0, time_to_cipher);
                return;
            }
        },
    };

    *last_seen.lock().unwrap() = Instant::now();

    match target_socket.send_to(&payload, target_sa).await {
        Ok(n) => {
            trace!("udp relay {} -> {} with {} bytes", peer_addr, target_addr, n);
            context
                .metrics
                .add_udp_packet_from_client(entry.id(), Status::Ok, data.len(), n, time_to_cipher);
        }
        Err(err) => {
            error!("udp relay {} -> {} failed: {}", peer_addr, target_addr, err);
            context
                .metrics
                .add_udp_packet_from_client(entry.id(), Status::ErrRelay, data.len(), 0, time_to_cipher);
        }
    }
}

/// Returns the live association for `peer_addr`, dropping it first if it was
/// authenticated with a different key
fn lookup_association(
    context: &ServiceContext,
    peer_addr: SocketAddr,
    entry: &Arc<KeyEntry>,
) -> Option<(Arc<UdpSocket>, Arc<Mutex<Instant>>)> {
    let mut nat = context.nat.lock().unwrap();
    match nat.get(&peer_addr) {
        Some(existing) if existing.key_id == entry.id() => {
            Some((existing.socket.clone(), existing.last_seen.clone()))
        }
        Some(..) => {
            debug!("udp client {} switched access keys, replacing association", peer_addr);
            nat.remove(&peer_addr);
            None
        }
        None => None,
    }
}

async fn create_association(
    listener: &Arc<UdpSocket>,
    context: &Arc<ServiceContext>,
    peer_addr: SocketAddr,
    entry: &Arc<KeyEntry>,
    target_sa: SocketAddr,
) -> io::Result<(Arc<UdpSocket>, Arc<Mutex<Instant>>)> {
    let bind_addr: SocketAddr = if target_sa.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
    let last_seen = Arc::new(Mutex::new(Instant::now()));

    let handle = tokio::spawn(relay_target_to_client(
        listener.clone(),
        socket.clone(),
        peer_addr,
        entry.clone(),
        last_seen.clone(),
        context.timeout,
        context.metrics.clone(),
        context.nat.clone(),
    ));

    debug!("created udp association for {} with key {}", peer_addr, entry.id());
    context.metrics.add_udp_nat_entry();

    let nat_entry = NatEntry {
        key_id: entry.id().to_owned(),
        socket: socket.clone(),
        last_seen: last_seen.clone(),
        handle,
        metrics: context.metrics.clone(),
    };
    context.nat.lock().unwrap().insert(peer_addr, nat_entry);

    Ok((socket, last_seen))
}

/// Reads replies from the target socket, re-encrypts them with a fresh salt
/// and sends them back to the client over the listening socket. The source
/// header always carries the socket-reported remote address. Exits, removing
/// the association, when no client packet has refreshed `last_seen` within
/// `timeout`.
#[allow(clippy::too_many_arguments)]
async fn relay_target_to_client(
    listener: Arc<UdpSocket>,
    target_socket: Arc<UdpSocket>,
    peer_addr: SocketAddr,
    entry: Arc<KeyEntry>,
    last_seen: Arc<Mutex<Instant>>,
    timeout: Duration,
    metrics: Arc<dyn MetricsSink>,
    nat: NatMap,
) {
    let mut buffer = vec![0u8; MAXIMUM_UDP_PAYLOAD_SIZE];

    loop {
        let deadline = *last_seen.lock().unwrap() + timeout;
        let (n, src_addr) = match time::timeout_at(deadline, target_socket.recv_from(&mut buffer)).await {
            Err(..) => {
                // Only client packets refresh last_seen, it may have moved
                // while we were waiting.
                if *last_seen.lock().unwrap() + timeout <= Instant::now() {
                    break;
                }
                continue;
            }
            Ok(Err(err)) => {
                debug!("udp relay {} <- ... target socket failed: {}", peer_addr, err);
                break;
            }
            Ok(Ok(r)) => r,
        };

        let source = Address::from(src_addr);
        let mut packet = BytesMut::new();
        encrypt_payload(entry.method(), entry.key(), &source, &buffer[..n], &mut packet);

        match listener.send_to(&packet, peer_addr).await {
            Ok(..) => {
                trace!("udp relay {} <- {} with {} bytes", peer_addr, source, n);
                metrics.add_udp_packet_from_target(entry.id(), Status::Ok, n, packet.len());
            }
            Err(err) => {
                warn!("udp failed to send back to client {}, from target {}: {}", peer_addr, source, err);
                metrics.add_udp_packet_from_target(entry.id(), Status::ErrRelay, n, 0);
            }
        }
    }

    // Idle or dead: retire the association if it is still ours.
    let mut nat = nat.lock().unwrap();
    if let Some(existing) = nat.get(&peer_addr) {
        if Arc::ptr_eq(&existing.socket, &target_socket) {
            nat.remove(&peer_addr);
            debug!("udp association for {} expired", peer_addr);
        }
    }
}

async fn resolve_target(addr: &Address) -> io::Result<SocketAddr> {
    match *addr {
        Address::SocketAddress(sa) => Ok(sa),
        Address::DomainNameAddress(ref domain, port) => match lookup_host((domain.as_str(), port)).await?.next() {
            Some(sa) => Ok(sa),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "no addresses resolved")),
        },
    }
}
