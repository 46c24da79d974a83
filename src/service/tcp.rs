//! Multi-key shadowsocks TCP server
//!
//! Each accepted connection walks the session states
//! `Accepted → Identified → Addressed → Relaying → Closed`. Identification
//! trial-decrypts the first sealed length block against every registered
//! key, ordered by client-IP affinity; a connection that no key can open, or
//! that replays a previously seen handshake, is treated as a probe: the
//! server keeps reading and discarding until the deadline and never writes
//! first, so close timing does not reveal the listener.

use std::{
    io,
    net::{IpAddr, SocketAddr},
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use log::{debug, error, info, trace, warn};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    net::{TcpListener, TcpStream},
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::{
    crypto::Cipher,
    keyring::{KeyEntry, Keyring},
    metrics::{MetricsSink, Status, Traffic},
    net::{FlowStat, MonStream},
    relay::{
        socks5::{self, Address},
        tcprelay::{crypto_io::CryptoStream, utils::copy_encrypted_bidirectional},
    },
    security::replay::ReplayProtector,
    service::{allow_all, prohibited_target, ClientFilter},
};

/// Why a session terminated before completing
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("no access key decrypted the initial bytes")]
    CipherMismatch,
    #[error("repeated initial ciphertext")]
    Replay,
    #[error("bad destination address: {0}")]
    Address(#[from] socks5::Error),
    #[error("prohibited destination {0}")]
    ProhibitedTarget(Address),
    #[error("failed to reach target: {0}")]
    Dial(io::Error),
    #[error("relay failed: {0}")]
    Relay(io::Error),
    #[error("idle deadline exceeded")]
    Timeout,
}

impl RelayError {
    /// Metric status label for this error kind
    pub fn status(&self) -> Status {
        match *self {
            RelayError::CipherMismatch => Status::ErrCipher,
            RelayError::Replay => Status::ErrReplay,
            RelayError::Address(..) | RelayError::ProhibitedTarget(..) => Status::ErrAddress,
            RelayError::Dial(..) => Status::ErrDial,
            RelayError::Relay(..) => Status::ErrRelay,
            RelayError::Timeout => Status::ErrTimeout,
        }
    }
}

/// TCP proxy service over a pre-bound listener
pub struct TcpService {
    listener: Mutex<Option<TcpListener>>,
    context: Arc<ServiceContext>,
    shutdown: CancellationToken,
}

struct ServiceContext {
    keyring: Arc<Keyring>,
    replay: Option<Arc<ReplayProtector>>,
    metrics: Arc<dyn MetricsSink>,
    timeout: Duration,
    filter: ClientFilter,
}

impl TcpService {
    /// Creates a service. `replay` of `None` disables replay defense,
    /// `timeout` is the handshake and relay idle deadline.
    pub fn new(
        listener: TcpListener,
        keyring: Arc<Keyring>,
        replay: Option<Arc<ReplayProtector>>,
        metrics: Arc<dyn MetricsSink>,
        timeout: Duration,
    ) -> TcpService {
        TcpService {
            listener: Mutex::new(Some(listener)),
            context: Arc::new(ServiceContext {
                keyring,
                replay,
                metrics,
                timeout,
                filter: allow_all(),
            }),
            shutdown: CancellationToken::new(),
        }
    }

    /// Replaces the client admission predicate. Only effective before
    /// `start`.
    pub fn with_client_filter(mut self, filter: ClientFilter) -> TcpService {
        Arc::get_mut(&mut self.context)
            .expect("client filter must be set before start")
            .filter = filter;
        self
    }

    /// Accepts and serves connections until [`stop`](Self::stop) is called,
    /// then closes the listening socket. Idempotent: a second call returns
    /// immediately.
    pub async fn start(&self) -> io::Result<()> {
        let listener = match self.listener.lock().unwrap().take() {
            Some(listener) => listener,
            None => return Ok(()),
        };

        if let Ok(addr) = listener.local_addr() {
            info!("shadowmux tcp server listening on {}", addr);
        }

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(s) => s,
                        Err(err) => {
                            error!("tcp server accept failed with error: {}", err);
                            time::sleep(Duration::from_secs(1)).await;
                            continue;
                        }
                    };

                    trace!("accepted tcp client connection {}", peer_addr);

                    let context = self.context.clone();
                    let cancel = self.shutdown.child_token();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            _ = serve(context, stream, peer_addr) => {}
                        }
                    });
                }
            }
        }

        Ok(())
    }

    /// Stops the accept loop and tears down open connections. Idempotent.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

/// The selected access key and everything learned while selecting it
struct FoundKey {
    entry: Arc<KeyEntry>,
    salt: Bytes,
    /// Ciphertext consumed from the stream past the salt, to be replayed
    /// into the session reader
    buffered: BytesMut,
    /// The sealed length block, used as the replay tag
    replay_tag: Bytes,
    time_to_cipher: Duration,
    trials: usize,
}

async fn serve(context: Arc<ServiceContext>, stream: TcpStream, peer_addr: SocketAddr) {
    context.metrics.add_open_tcp_connection();

    let started = Instant::now();
    let deadline = started + context.timeout;
    let flow = Arc::new(FlowStat::new());
    let mut stream = MonStream::from_stream(stream, flow.clone());

    let close = |key_id: &str, status: Status, copied: (u64, u64), cipher_search: Duration| {
        let traffic = Traffic {
            client_proxy: flow.rx(),
            proxy_target: copied.0,
            target_proxy: copied.1,
            proxy_client: flow.tx(),
        };
        context
            .metrics
            .add_closed_tcp_connection(key_id, status, &traffic, cipher_search, started.elapsed());
    };

    if let Some(reason) = (context.filter)(peer_addr.ip()) {
        warn!("tcp client {} rejected: {}", peer_addr, reason);
        close("", Status::ErrAddress, (0, 0), Duration::ZERO);
        return;
    }

    // Step 1: identify the access key.
    let found = match time::timeout_at(deadline, find_access_key(&mut stream, peer_addr.ip(), &context.keyring)).await
    {
        Ok(Ok(Some(found))) => found,
        Ok(Ok(None)) => {
            debug!("tcp client {} matched no access key", peer_addr);
            absorb_probe(&context, &mut stream, Status::ErrCipher, &flow, deadline).await;
            close("", Status::ErrCipher, (0, 0), Duration::ZERO);
            return;
        }
        Ok(Err(err)) => {
            debug!("tcp client {} sent unreadable initial bytes: {}", peer_addr, err);
            absorb_probe(&context, &mut stream, Status::ErrCipher, &flow, deadline).await;
            close("", Status::ErrCipher, (0, 0), Duration::ZERO);
            return;
        }
        Err(..) => {
            debug!("tcp client {} sent nothing before the deadline", peer_addr);
            close("", Status::ErrTimeout, (0, 0), Duration::ZERO);
            return;
        }
    };

    // Step 2: replay defense, keyed by the sealed length block.
    if let Some(ref replay) = context.replay {
        if replay.check_and_set(&found.replay_tag) {
            debug!(
                "tcp client {} replayed a previous handshake of key {}",
                peer_addr,
                found.entry.id()
            );
            absorb_probe(&context, &mut stream, Status::ErrReplay, &flow, deadline).await;
            close(found.entry.id(), Status::ErrReplay, (0, 0), found.time_to_cipher);
            return;
        }
    }

    let FoundKey {
        entry,
        salt,
        buffered,
        time_to_cipher,
        trials,
        ..
    } = found;

    trace!(
        "tcp client {} authenticated with key {} after {} trial(s)",
        peer_addr,
        entry.id(),
        trials
    );

    let mut client = CryptoStream::from_identified(stream, entry.method(), entry.key(), &salt, &buffered);

    // Steps 3 and 4: destination address, dial, relay.
    match establish_and_relay(&context, &mut client, peer_addr, entry.id(), deadline).await {
        Ok(copied) => close(entry.id(), Status::Ok, copied, time_to_cipher),
        Err(err) => {
            debug!("tcp client {} session ended: {}", peer_addr, err);
            close(entry.id(), err.status(), (0, 0), time_to_cipher);
        }
    }
}

/// Reads the destination header, dials it and relays both directions until
/// they finish
async fn establish_and_relay(
    context: &ServiceContext,
    client: &mut CryptoStream<MonStream<TcpStream>>,
    peer_addr: SocketAddr,
    key_id: &str,
    deadline: Instant,
) -> Result<(u64, u64), RelayError> {
    let target_addr = match time::timeout_at(deadline, Address::read_from(client)).await {
        Ok(Ok(addr)) => addr,
        Ok(Err(err)) => return Err(RelayError::Address(err)),
        Err(..) => return Err(RelayError::Timeout),
    };

    if prohibited_target(&target_addr) {
        return Err(RelayError::ProhibitedTarget(target_addr));
    }

    let mut remote = match time::timeout_at(deadline, connect_target(&target_addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => return Err(RelayError::Dial(err)),
        Err(..) => return Err(RelayError::Dial(io::ErrorKind::TimedOut.into())),
    };

    debug!(
        "established tcp tunnel {} <-> {} with key {}",
        peer_addr, target_addr, key_id
    );

    match copy_encrypted_bidirectional(client, &mut remote, Some(context.timeout)).await {
        Ok(copied) => {
            trace!("tcp tunnel {} <-> {} closed", peer_addr, target_addr);
            Ok(copied)
        }
        Err(ref err) if err.kind() == io::ErrorKind::TimedOut => Err(RelayError::Timeout),
        Err(err) => Err(RelayError::Relay(err)),
    }
}

/// Walks the affinity-ordered registry snapshot and trial-opens the first
/// sealed length block with each candidate until one verifies.
///
/// Returns `Ok(None)` when no key matches. On success the consumed
/// ciphertext (everything past the salt) is handed back for the session
/// reader to replay.
async fn find_access_key<S>(stream: &mut S, client_ip: IpAddr, keyring: &Keyring) -> io::Result<Option<FoundKey>>
where
    S: AsyncRead + Unpin,
{
    let snapshot = keyring.snapshot_for(client_ip);

    // Enough initial bytes to trial-open the length block of every candidate.
    let probe_len = snapshot
        .iter()
        .map(|entry| {
            let method = entry.method();
            method.salt_len() + 2 + method.tag_len()
        })
        .max();
    let probe_len = match probe_len {
        Some(n) => n,
        None => return Ok(None),
    };

    let mut first_bytes = vec![0u8; probe_len];
    stream.read_exact(&mut first_bytes).await?;

    let search_started = Instant::now();
    for (index, entry) in snapshot.iter().enumerate() {
        let method = entry.method();
        let salt_len = method.salt_len();
        let block_len = 2 + method.tag_len();

        let salt = &first_bytes[..salt_len];
        let mut cipher = Cipher::new(method, entry.key(), salt);
        let mut block = first_bytes[salt_len..salt_len + block_len].to_vec();
        if !cipher.decrypt_packet(&mut block) {
            continue;
        }

        keyring.mark_used(entry, client_ip);

        return Ok(Some(FoundKey {
            entry: entry.clone(),
            salt: Bytes::copy_from_slice(salt),
            buffered: BytesMut::from(&first_bytes[salt_len..]),
            replay_tag: Bytes::copy_from_slice(&first_bytes[salt_len..salt_len + block_len]),
            time_to_cipher: search_started.elapsed(),
            trials: index + 1,
        }));
    }

    Ok(None)
}

/// Keeps reading and discarding a failed-probe connection until the deadline
/// or the prober gives up. Nothing is ever written back.
async fn absorb_probe(
    context: &ServiceContext,
    stream: &mut MonStream<TcpStream>,
    status: Status,
    flow: &FlowStat,
    deadline: Instant,
) {
    let _ = time::timeout_at(deadline, ignore_until_end(stream)).await;
    context.metrics.add_tcp_probe(status, flow.rx());
}

/// Consumes all data from `reader` and throws away until EOF
async fn ignore_until_end<R>(reader: &mut R) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = [0u8; 2048];

    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
    }

    Ok(())
}

async fn connect_target(addr: &Address) -> io::Result<TcpStream> {
    match *addr {
        Address::SocketAddress(sa) => TcpStream::connect(sa).await,
        Address::DomainNameAddress(ref domain, port) => TcpStream::connect((domain.as_str(), port)).await,
    }
}
