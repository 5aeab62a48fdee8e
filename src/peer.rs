//! Client-to-client NMDC sessions.
//!
//! Both rendezvous directions end up in the same state machine: a "dialer"
//! dialed out after a remote `$ConnectToMe`, a "listener" accepted the
//! connection a remote made after our own `$ConnectToMe`. The session walks
//! NICK-WAIT, LOCK-WAIT, DIRECTION-NEGOTIATED and TRANSFER: nick exchange,
//! Lock/Key challenge, direction election, then either ADCGET requests with
//! binary downloads into `Incomplete/`, or upload serving out of the peer's
//! group share.

use std::{
    collections::{HashMap, HashSet},
    io::SeekFrom,
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::{
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task,
    time::timeout,
};
use tokio_util::codec::Framed;

use crate::{
    codec::{Frame, NmdcCodec},
    download::{QueueItem, RebuildCtx},
    engine::Shared,
    error::{Error, Result},
    proto,
};

/// How many random ports are tried before giving up on binding a listener.
const MAX_BIND_ATTEMPTS: u32 = 32;

/// Invoked once when a rendezvous or transfer attempt is abandoned.
pub(crate) type FailAction = Box<dyn FnOnce() + Send>;

/// The commands a peer session can receive from the engine.
pub(crate) enum Command {
    /// Eventually shut down the peer session.
    Shutdown,
}

pub(crate) type TransferId = u64;

struct TransferEntry {
    nick: Option<String>,
    cmd: UnboundedSender<Command>,
    task: Option<task::JoinHandle<()>>,
}

/// The registry of live peer sessions, owned by the engine. Sessions are
/// registered before their task starts and remove themselves when they end.
pub(crate) struct TransferRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    next_id: TransferId,
    entries: HashMap<TransferId, TransferEntry>,
}

impl TransferRegistry {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    pub(crate) fn register(&self, nick: Option<String>) -> (TransferId, UnboundedReceiver<Command>) {
        let (cmd, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.insert(
            id,
            TransferEntry {
                nick,
                cmd,
                task: None,
            },
        );
        (id, rx)
    }

    pub(crate) fn set_nick(&self, id: TransferId, nick: &str) {
        if let Some(entry) = self.inner.lock().unwrap().entries.get_mut(&id) {
            entry.nick = Some(nick.to_owned());
        }
    }

    pub(crate) fn set_task(&self, id: TransferId, task: task::JoinHandle<()>) {
        if let Some(entry) = self.inner.lock().unwrap().entries.get_mut(&id) {
            entry.task = Some(task);
        }
    }

    pub(crate) fn remove(&self, id: TransferId) {
        self.inner.lock().unwrap().entries.remove(&id);
    }

    /// The nicks of all peers we currently hold a session with.
    pub(crate) fn nicks(&self) -> HashSet<String> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .values()
            .filter_map(|entry| entry.nick.clone())
            .collect()
    }

    /// Tells every session to shut down and hands back their tasks for
    /// joining.
    pub(crate) fn shutdown_all(&self) -> Vec<task::JoinHandle<()>> {
        let mut inner = self.inner.lock().unwrap();
        let mut tasks = Vec::new();
        for (_, mut entry) in inner.entries.drain() {
            let _ = entry.cmd.send(Command::Shutdown);
            if let Some(task) = entry.task.take() {
                tasks.push(task);
            }
        }
        tasks
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Role {
    /// We connected outward, answering a remote `$ConnectToMe`.
    Dialer,
    /// We accepted the connection a remote made after our `$ConnectToMe`.
    Listener,
}

/// At any given time, a connection with a peer is in one of the below
/// states, entered strictly in order.
#[derive(Clone, Copy, Debug, PartialEq)]
enum State {
    /// Waiting for the peer to introduce itself with `$MyNick`.
    NickWait,
    /// Nick known; waiting for the `$Lock` challenge.
    LockWait,
    /// Supports, direction and key are being exchanged.
    DirectionNegotiated,
    /// One side is moving file content.
    Transfer,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Direction {
    Download,
    Upload,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Flow {
    Continue,
    Close,
}

/// Dials a peer that asked us to connect and runs the session.
pub(crate) fn spawn_dialer(shared: Arc<Shared>, host: String, port: u16) {
    let (id, rx) = shared.transfers.register(None);
    let task_shared = shared.clone();
    let handle = tokio::spawn(async move {
        match TcpStream::connect((host.as_str(), port)).await {
            Ok(stream) => {
                let addr = stream
                    .peer_addr()
                    .unwrap_or_else(|_| SocketAddr::new([0, 0, 0, 0].into(), port));
                PeerSession::new(task_shared, Role::Dialer, addr, id, rx)
                    .run(stream)
                    .await;
            }
            Err(e) => {
                log::warn!("Failed to connect to peer {}:{}: {}", host, port, e);
                task_shared.transfers.remove(id);
            }
        }
    });
    shared.transfers.set_task(id, handle);
}

/// Sets up a rendezvous with a peer so that it connects back to us.
///
/// In active mode this binds a listener on a random port, sends
/// `$ConnectToMe` up to `retry` times and waits `wait` seconds for the peer
/// each time; the accepted connection becomes a listener-role session. In
/// passive mode a `$RevConnectToMe` is sent instead (or nothing, when the
/// reverse path was already tried: passive cannot meet passive).
pub(crate) async fn connect_remote(
    shared: Arc<Shared>,
    nick: String,
    rev: bool,
    on_fail: Option<FailAction>,
) {
    let (active_mode, me, localhost, retry, wait) = {
        let config = shared.config.read().unwrap();
        (
            config.active_mode,
            config.nick.clone(),
            config.localhost,
            config.retry,
            config.wait,
        )
    };
    if !active_mode {
        if rev {
            shared.hub_send(format!("$RevConnectToMe {} {}", me, nick));
        }
        return;
    }

    let listener = match bind_ephemeral_tcp().await {
        Ok(listener) => listener,
        Err(e) => {
            log::warn!("Could not bind a transfer port for {}: {}", nick, e);
            if let Some(fail) = on_fail {
                fail();
            }
            return;
        }
    };
    let port = match listener.local_addr() {
        Ok(addr) => addr.port(),
        Err(_) => return,
    };

    log::debug!("Sending connection request to {}", nick);
    let (id, rx) = shared.transfers.register(Some(nick.clone()));
    let mut rx = Some(rx);
    for _ in 0..retry {
        shared.hub_send(format!("$ConnectToMe {} {}:{}", nick, localhost, port));
        match timeout(Duration::from_secs(wait), listener.accept()).await {
            Ok(Ok((stream, addr))) => {
                let rx = rx.take().expect("accept loop runs once");
                let session = PeerSession::new(shared.clone(), Role::Listener, addr, id, rx);
                let handle = tokio::spawn(session.run(stream));
                shared.transfers.set_task(id, handle);
                return;
            }
            Ok(Err(e)) => {
                log::warn!("Accept failed while waiting for {}: {}", nick, e);
                break;
            }
            Err(_) => {
                log::debug!("No response from {} after waiting for {} seconds", nick, wait);
            }
        }
    }
    log::debug!("Connection to {} failed - timeout", nick);
    shared.transfers.remove(id);
    if let Some(fail) = on_fail {
        fail();
    }
}

/// Binds a TCP listener on a randomly drawn non-privileged port, retrying on
/// contention.
async fn bind_ephemeral_tcp() -> Result<TcpListener> {
    for _ in 0..MAX_BIND_ATTEMPTS {
        let port: u16 = {
            let mut rng = rand::thread_rng();
            rng.gen_range(1025..=u16::MAX)
        };
        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => return Ok(listener),
            Err(_) => continue,
        }
    }
    Err(Error::Bind("tcp"))
}

pub(crate) struct PeerSession {
    shared: Arc<Shared>,
    role: Role,
    /// The remote address of the peer.
    addr: SocketAddr,
    /// Our entry in the transfer registry.
    transfer_id: TransferId,
    /// The port on which the peer session receives commands.
    cmd_rx: UnboundedReceiver<Command>,
    state: State,
    peer_nick: Option<String>,
    /// The peer's lock, kept raw for the key derivation.
    peer_lock: Option<Vec<u8>>,
    /// Support tokens the peer advertised.
    peer_supports: Vec<String>,
    peer_dir: Option<Direction>,
    peer_rand: i32,
    my_rand: i32,
    /// The queue item this session currently owns, if any.
    get: Option<QueueItem>,
    /// Outstanding payload bytes of the active download.
    more: u64,
    /// The open `.partN` file of the active download.
    sink: Option<tokio::fs::File>,
    /// Set when the transfer failed; suppresses the reconnect-on-close path.
    error: bool,
}

impl PeerSession {
    pub(crate) fn new(
        shared: Arc<Shared>,
        role: Role,
        addr: SocketAddr,
        transfer_id: TransferId,
        cmd_rx: UnboundedReceiver<Command>,
    ) -> Self {
        Self {
            shared,
            role,
            addr,
            transfer_id,
            cmd_rx,
            state: State::NickWait,
            peer_nick: None,
            peer_lock: None,
            peer_supports: Vec::new(),
            peer_dir: None,
            peer_rand: -1,
            my_rand: -1,
            get: None,
            more: 0,
            sink: None,
            error: false,
        }
    }

    /// Runs the session until the peer closes, an error occurs or the engine
    /// asks for shutdown.
    pub(crate) async fn run(mut self, stream: TcpStream) {
        log::info!("Starting peer {} session as {:?}", self.addr, self.role);
        if let Err(e) = self.drive(stream).await {
            log::debug!("Peer {} session ended with error: {}", self.addr, e);
            self.error = true;
        }
        self.finish();
    }

    async fn drive(&mut self, stream: TcpStream) -> Result<()> {
        let mut framed = Framed::new(stream, NmdcCodec::default());
        if self.role == Role::Dialer {
            let nick = self.shared.config.read().unwrap().nick.clone();
            framed
                .send(Frame::command(format!("$MyNick {}", proto::escape(&nick))))
                .await?;
        }
        loop {
            tokio::select! {
                frame = framed.next() => match frame {
                    Some(Ok(Frame::Command(cmd))) => {
                        if self.handle_command(&mut framed, cmd).await? == Flow::Close {
                            break;
                        }
                    }
                    Some(Ok(Frame::Data(chunk))) => {
                        if self.handle_data(&mut framed, chunk).await? == Flow::Close {
                            break;
                        }
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        log::debug!("Peer {} closed the connection", self.addr);
                        break;
                    }
                },
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Shutdown) | None => {
                        log::info!("Shutting down peer {} session", self.addr);
                        break;
                    }
                },
            }
        }
        Ok(())
    }

    /// Releases whatever the session still holds. A borrowed queue item goes
    /// back for another peer, its failure callback fires, and unless the
    /// transfer failed outright we ask the same peer for a fresh rendezvous.
    fn finish(mut self) {
        if let Some(get) = self.get.take() {
            self.shared.queue.release(&get);
            get.fire_failure();
            if !self.error {
                if let Some(nick) = self.peer_nick.clone() {
                    let shared = self.shared.clone();
                    tokio::spawn(async move {
                        connect_remote(shared, nick, true, None).await;
                    });
                }
            }
        }
        self.shared.transfers.remove(self.transfer_id);
        log::info!("Terminated peer {} session", self.addr);
    }

    fn set_state(&mut self, state: State) {
        self.state = state;
        log::debug!("Peer {} session state: {:?}", self.addr, self.state);
    }

    async fn handle_command(
        &mut self,
        framed: &mut Framed<TcpStream, NmdcCodec>,
        cmd: Bytes,
    ) -> Result<Flow> {
        // $Key and $Lock payloads are raw bytes; everything else is text
        if let Some(key) = cmd.strip_prefix(b"$Key ") {
            let key = key.to_vec();
            return self.on_key(framed, key).await;
        }
        if let Some(rest) = cmd.strip_prefix(b"$Lock ") {
            let end = rest
                .iter()
                .position(|&b| b == b' ')
                .unwrap_or(rest.len());
            let lock = rest[..end].to_vec();
            return self.on_lock(framed, lock).await;
        }

        let text = String::from_utf8_lossy(&cmd).into_owned();
        let tokens: Vec<&str> = text.split_whitespace().collect();
        match tokens.first().copied() {
            Some("$MyNick") if tokens.len() >= 2 => self.on_mynick(framed, tokens[1]).await,
            Some("$Supports") => {
                self.peer_supports = tokens[1..].iter().map(|s| s.to_string()).collect();
                Ok(Flow::Continue)
            }
            Some("$Direction") if tokens.len() >= 3 => {
                self.peer_dir = Some(match tokens[1] {
                    "Upload" => Direction::Upload,
                    _ => Direction::Download,
                });
                self.peer_rand = tokens[2].parse().unwrap_or(-1);
                Ok(Flow::Continue)
            }
            Some("$ADCGET") => self.serve_upload(framed, &tokens).await,
            Some("$ADCSND") if tokens.len() >= 5 => self.on_adcsnd(framed, &tokens).await,
            Some("$Error") | Some("$MaxedOut") => {
                let reason = if tokens.first() == Some(&"$Error") {
                    text.trim_start_matches("$Error ").to_owned()
                } else {
                    "No slots available.".to_owned()
                };
                Ok(self.on_transfer_error(&reason))
            }
            _ => {
                log::debug!("Unrecognized command from {}: {}", self.addr, text);
                Ok(Flow::Continue)
            }
        }
    }

    async fn on_mynick(
        &mut self,
        framed: &mut Framed<TcpStream, NmdcCodec>,
        nick: &str,
    ) -> Result<Flow> {
        let nick = proto::unescape(nick);
        self.peer_nick = Some(nick.clone());
        self.shared.userips.insert(&nick, self.addr.ip());
        self.shared.transfers.set_nick(self.transfer_id, &nick);
        self.set_state(State::LockWait);
        if self.role == Role::Listener {
            let (me, lock, signature) = {
                let config = self.shared.config.read().unwrap();
                (
                    config.nick.clone(),
                    config.lock.clone(),
                    config.signature.clone(),
                )
            };
            framed
                .send(Frame::command(format!("$MyNick {}", proto::escape(&me))))
                .await?;
            framed
                .send(Frame::command(format!("$Lock {} Pk={}", lock, signature)))
                .await?;
        }
        Ok(Flow::Continue)
    }

    async fn on_lock(
        &mut self,
        framed: &mut Framed<TcpStream, NmdcCodec>,
        lock: Vec<u8>,
    ) -> Result<Flow> {
        self.peer_lock = Some(lock);
        match self.role {
            Role::Dialer => {
                let (lock, signature) = {
                    let config = self.shared.config.read().unwrap();
                    (config.lock.clone(), config.signature.clone())
                };
                framed
                    .send(Frame::command(format!("$Lock {} Pk={}", lock, signature)))
                    .await?;
            }
            Role::Listener => {
                // declare our direction: Download iff we have work for this peer
                self.pick_item().await;
                self.my_rand = {
                    let mut rng = rand::thread_rng();
                    rng.gen_range(0..=32767)
                };
                self.send_negotiation(framed).await?;
                self.set_state(State::DirectionNegotiated);
            }
        }
        Ok(Flow::Continue)
    }

    /// Selects a queue item for the connected peer and processes any entries
    /// that turned out to be complete.
    async fn pick_item(&mut self) {
        let nick = match &self.peer_nick {
            Some(nick) => nick.clone(),
            None => return,
        };
        let (get, rebuilds) = self.shared.queue.transfer_next(&nick, &self.shared.layout);
        log::debug!(
            "Items downloadable from {}: {:?}",
            nick,
            get.as_ref().map(|item| &item.id)
        );
        self.get = get;
        self.process_rebuilds(rebuilds).await;
    }

    async fn process_rebuilds(&self, rebuilds: Vec<QueueItem>) {
        if rebuilds.is_empty() {
            return;
        }
        let shared = self.shared.clone();
        let ctx = RebuildCtx::from_shared(&shared);
        let _ = task::spawn_blocking(move || {
            for item in rebuilds {
                if let Some(path) = shared.queue.rebuild(&item, &ctx) {
                    item.fire_success(&path);
                }
            }
        })
        .await;
    }

    /// Emits our `$Supports`, `$Direction` and `$Key` triple.
    async fn send_negotiation(
        &mut self,
        framed: &mut Framed<TcpStream, NmdcCodec>,
    ) -> Result<Flow> {
        let support = self.shared.config.read().unwrap().support.clone();
        let direction = if self.get.is_some() {
            "Download"
        } else {
            "Upload"
        };
        framed
            .send(Frame::command(format!("$Supports {}", support)))
            .await?;
        framed
            .send(Frame::command(format!("$Direction {} {}", direction, self.my_rand)))
            .await?;
        let peer_lock = self.peer_lock.clone().unwrap_or_default();
        let mut key_cmd = b"$Key ".to_vec();
        key_cmd.extend_from_slice(&proto::lock2key(&peer_lock));
        framed.send(Frame::Command(Bytes::from(key_cmd))).await?;
        Ok(Flow::Continue)
    }

    async fn on_key(
        &mut self,
        framed: &mut Framed<TcpStream, NmdcCodec>,
        key: Vec<u8>,
    ) -> Result<Flow> {
        let expected = self.shared.config.read().unwrap().key();
        if key != expected {
            log::warn!("Peer {} presented a mismatched key", self.addr);
            return Ok(Flow::Close);
        }
        if self.role == Role::Dialer {
            // re-roll until our number is distinct from the peer's
            self.my_rand = {
                let mut rng = rand::thread_rng();
                loop {
                    let roll = rng.gen_range(0..=32767);
                    if roll != self.peer_rand {
                        break roll;
                    }
                }
            };
            self.pick_item().await;
            self.send_negotiation(framed).await?;
            self.set_state(State::DirectionNegotiated);
        }

        // direction election: we download iff we have work and either the
        // peer only uploads or our number outranks theirs
        let peer_uploads = self.peer_dir == Some(Direction::Upload);
        if self.get.is_some() && (peer_uploads || self.my_rand > self.peer_rand) {
            if let Some(request) = self.build_request() {
                framed.send(request).await?;
            }
        } else if self.get.is_some() {
            // lost the election; hand the item back so another session can
            // pick it up while we serve the peer's download
            if let Some(get) = self.get.take() {
                self.shared.queue.release(&get);
            }
        } else if peer_uploads {
            log::debug!("Neither side of {} wants to download", self.addr);
            return Ok(Flow::Close);
        }
        Ok(Flow::Continue)
    }

    /// Builds the `$ADCGET` for the currently selected item, folding any
    /// partially downloaded `.partN` bytes into the requested range.
    fn build_request(&mut self) -> Option<Frame> {
        let layout = self.shared.layout.clone();
        let filelist_name = self.shared.config.read().unwrap().filelist_name.clone();
        let zlig = self.peer_supports.iter().any(|s| s == "ZLIG");
        let get = self.get.as_mut()?;
        let part = get.part?;
        if let Ok(meta) = std::fs::metadata(layout.part_path(&get.incomplete, part)) {
            get.offset += meta.len();
            if get.length >= 0 {
                get.length -= meta.len() as i64;
            }
        }
        let path = if get.id == filelist_name {
            get.id.clone()
        } else {
            format!("TTH/{}", get.id)
        };
        log::debug!("Requesting {} {}+{} from {:?}", path, get.offset, get.length, self.peer_nick);
        Some(Frame::command(format!(
            "$ADCGET file {} {} {}{}",
            path,
            get.offset,
            get.length,
            if zlig { " ZL1" } else { "" }
        )))
    }

    async fn on_adcsnd(
        &mut self,
        framed: &mut Framed<TcpStream, NmdcCodec>,
        tokens: &[&str],
    ) -> Result<Flow> {
        let size: u64 = match tokens[4].parse() {
            Ok(size) => size,
            Err(_) => return Ok(Flow::Close),
        };
        let part = {
            let get = match self.get.as_mut() {
                Some(get) => get,
                None => {
                    log::warn!("Peer {} sent unsolicited $ADCSND", self.addr);
                    return Ok(Flow::Close);
                }
            };
            if get.size < 0 {
                get.size = size as i64;
            }
            get.part.unwrap_or(0)
        };
        let incomplete = self.get.as_ref().map(|get| get.incomplete.clone()).unwrap_or_default();
        let path = self.shared.layout.part_path(&incomplete, part);
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        self.sink = Some(file);
        self.more = size;
        framed.codec_mut().set_binary(size);
        self.set_state(State::Transfer);
        log::debug!(
            "Starting download of {:?} from {}",
            self.get.as_ref().map(|get| &get.id),
            self.addr
        );
        if size == 0 {
            return self.finish_segment(framed).await;
        }
        Ok(Flow::Continue)
    }

    /// Writes a binary chunk of the active download through to its `.partN`
    /// file.
    async fn handle_data(
        &mut self,
        framed: &mut Framed<TcpStream, NmdcCodec>,
        chunk: Bytes,
    ) -> Result<Flow> {
        match self.sink.as_mut() {
            Some(sink) => {
                sink.write_all(&chunk).await?;
                self.more = self.more.saturating_sub(chunk.len() as u64);
                if self.more == 0 {
                    return self.finish_segment(framed).await;
                }
                Ok(Flow::Continue)
            }
            None => {
                log::warn!("Dropping unexpected binary data from {}", self.addr);
                Ok(Flow::Continue)
            }
        }
    }

    /// Completes the active segment: closes the part file, retires the queue
    /// entry, attempts reassembly and either reuses the session for the next
    /// item or closes it.
    async fn finish_segment(
        &mut self,
        framed: &mut Framed<TcpStream, NmdcCodec>,
    ) -> Result<Flow> {
        if let Some(mut sink) = self.sink.take() {
            sink.flush().await?;
        }
        let get = match self.get.take() {
            Some(get) => get,
            None => return Ok(Flow::Close),
        };
        log::info!("Segment of {} complete from {}", get.id, self.addr);
        self.shared.queue.remove(&get);

        let shared = self.shared.clone();
        let ctx = RebuildCtx::from_shared(&shared);
        let rebuild_item = get.clone();
        let assembled = task::spawn_blocking(move || shared.queue.rebuild(&rebuild_item, &ctx))
            .await
            .unwrap_or(None);
        if let Some(path) = assembled {
            get.fire_success(&path);
        }

        // reuse the session for the next item this peer can serve
        self.pick_item().await;
        if self.get.is_some() {
            if let Some(request) = self.build_request() {
                framed.send(request).await?;
                return Ok(Flow::Continue);
            }
        }
        Ok(Flow::Close)
    }

    /// Handles a failed download: the item goes back to the queue for
    /// another peer and the session ends.
    fn on_transfer_error(&mut self, reason: &str) -> Flow {
        log::debug!("Error downloading from {}: {}", self.addr, reason);
        self.error = true;
        if let Some(get) = self.get.take() {
            self.shared.queue.release(&get);
            get.fire_failure();
        }
        Flow::Close
    }

    /// Serves an `$ADCGET` request out of the requesting peer's group share.
    async fn serve_upload(
        &mut self,
        framed: &mut Framed<TcpStream, NmdcCodec>,
        tokens: &[&str],
    ) -> Result<Flow> {
        if tokens.len() < 5 {
            framed
                .send(Frame::command("$Error Unsupported Request".to_owned()))
                .await?;
            return Ok(Flow::Continue);
        }
        let kind = tokens[1];
        let path = tokens[2];
        let offset: u64 = tokens[3].parse().unwrap_or(0);
        let length: i64 = tokens[4].parse().unwrap_or(-1);

        let (filelist_name, maxupslots, segment_size) = {
            let config = self.shared.config.read().unwrap();
            (
                config.filelist_name.clone(),
                config.maxupslots,
                config.segment_size,
            )
        };
        if self.shared.upslots.current() >= maxupslots {
            framed
                .send(Frame::command(
                    "$Error All download slots already taken.".to_owned(),
                ))
                .await?;
            return Ok(Flow::Continue);
        }

        let nick = self.peer_nick.clone().unwrap_or_default();
        let group = self.shared.groups.find(&nick);
        let target: PathBuf = if kind == "file" && path == filelist_name {
            self.shared.layout.filelist_bz2(&group)
        } else if kind == "file" && path.starts_with("TTH/") {
            let root = &path[4..];
            let resolved = self
                .shared
                .filelists
                .find_tth(&group, root)
                .and_then(|relative| self.shared.filelists.resolve_physical(&group, &relative));
            match resolved {
                Some(target) => target,
                None => {
                    framed
                        .send(Frame::command("$Error File not found.".to_owned()))
                        .await?;
                    return Ok(Flow::Continue);
                }
            }
        } else {
            framed
                .send(Frame::command("$Error Unsupported Request".to_owned()))
                .await?;
            return Ok(Flow::Continue);
        };

        let filesize = match std::fs::metadata(&target) {
            Ok(meta) => meta.len(),
            Err(e) => {
                log::warn!("Upload target {:?} inaccessible: {}", target, e);
                framed
                    .send(Frame::command("$Error File Access Error.".to_owned()))
                    .await?;
                return Ok(Flow::Continue);
            }
        };
        let start = offset.min(filesize);
        let to_send = if length < 0 {
            filesize - start
        } else {
            (length as u64).min(filesize - start)
        };

        framed
            .send(Frame::command(format!(
                "$ADCSND {} {} {} {}",
                kind, path, start, to_send
            )))
            .await?;
        log::info!(
            "Uploading {:?} ({} bytes from {}) to {}",
            target,
            to_send,
            start,
            self.addr
        );
        self.shared.upslots.acquire();
        let result = stream_file(framed, &target, start, to_send, segment_size).await;
        self.shared.upslots.release();
        result?;
        Ok(Flow::Continue)
    }
}

/// Streams a byte range of a file into the session in `segment_size` chunks.
async fn stream_file(
    framed: &mut Framed<TcpStream, NmdcCodec>,
    target: &std::path::Path,
    start: u64,
    to_send: u64,
    segment_size: u64,
) -> Result<()> {
    let mut file = tokio::fs::File::open(target).await?;
    file.seek(SeekFrom::Start(start)).await?;
    let mut buf = vec![0u8; segment_size.min(1024 * 1024) as usize];
    let mut remaining = to_send;
    while remaining > 0 {
        let take = buf.len().min(remaining as usize);
        let n = file.read(&mut buf[..take]).await?;
        if n == 0 {
            break;
        }
        framed
            .send(Frame::Data(Bytes::copy_from_slice(&buf[..n])))
            .await?;
        remaining -= n as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{conf::Layout, engine::Shared};
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    fn test_shared(base: &std::path::Path) -> Arc<Shared> {
        let layout = Layout::new(base).unwrap();
        let shared = Shared::for_tests(layout);
        {
            let mut config = shared.config.write().unwrap();
            config.nick = "me".into();
            config.segment_size = 4;
            config.ready = true;
        }
        shared
    }

    async fn read_command(stream: &mut TcpStream) -> Vec<u8> {
        let mut command = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            stream.read_exact(&mut byte).await.unwrap();
            if byte[0] == b'|' {
                return command;
            }
            command.push(byte[0]);
        }
    }

    #[test]
    fn test_registry_tracks_nicks() {
        let registry = TransferRegistry::new();
        let (id, _rx) = registry.register(None);
        registry.set_nick(id, "alice");
        let (other, _rx2) = registry.register(Some("bob".into()));
        assert!(registry.nicks().contains("alice"));
        assert!(registry.nicks().contains("bob"));
        registry.remove(other);
        assert!(!registry.nicks().contains("bob"));
    }

    #[tokio::test]
    async fn test_dialer_session_closes_when_neither_side_downloads() {
        let tmp = tempfile::tempdir().unwrap();
        let shared = test_shared(tmp.path());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (id, rx) = shared.transfers.register(None);
        let session_shared = shared.clone();
        let session = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let peer_addr = stream.peer_addr().unwrap();
            PeerSession::new(session_shared, Role::Dialer, peer_addr, id, rx)
                .run(stream)
                .await;
        });

        let (mut remote, _) = listener.accept().await.unwrap();
        assert_eq!(read_command(&mut remote).await, b"$MyNick me".to_vec());
        remote
            .write_all(b"$MyNick peer|$Lock EXTENDEDPROTOCOLMajestic12 Pk=ref|")
            .await
            .unwrap();
        let lock_reply = read_command(&mut remote).await;
        assert!(lock_reply.starts_with(b"$Lock Majestic12 Pk="));

        // neither we nor the peer have anything to download
        let mut negotiation = b"$Supports XmlBZList ADCGet TTHF|$Direction Upload 100|$Key ".to_vec();
        negotiation.extend_from_slice(&proto::lock2key(b"Majestic12"));
        negotiation.push(b'|');
        remote.write_all(&negotiation).await.unwrap();

        // our triple arrives before the session closes
        let supports = read_command(&mut remote).await;
        assert_eq!(supports, b"$Supports XmlBZList ADCGet TTHF".to_vec());
        let direction = read_command(&mut remote).await;
        assert!(direction.starts_with(b"$Direction Upload "));
        let key = read_command(&mut remote).await;
        assert_eq!(&key[..5], b"$Key ");
        assert_eq!(
            &key[5..],
            &proto::lock2key(b"EXTENDEDPROTOCOLMajestic12")[..]
        );

        // the session must now close on its own
        session.await.unwrap();
        let mut rest = Vec::new();
        remote.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_dialer_session_downloads_segment() {
        let tmp = tempfile::tempdir().unwrap();
        let shared = test_shared(tmp.path());
        let root = "B".repeat(39);
        shared.queue.push_tth(&root, None, None, None, None);
        shared
            .queue
            .expand_tth(&root, "f.bin".into(), 4, vec!["peer".into()], 4);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (id, rx) = shared.transfers.register(None);
        let session_shared = shared.clone();
        let session = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let peer_addr = stream.peer_addr().unwrap();
            PeerSession::new(session_shared, Role::Dialer, peer_addr, id, rx)
                .run(stream)
                .await;
        });

        let (mut remote, _) = listener.accept().await.unwrap();
        assert_eq!(read_command(&mut remote).await, b"$MyNick me".to_vec());
        remote
            .write_all(b"$MyNick peer|$Lock EXTENDEDPROTOCOLMajestic12 Pk=ref|")
            .await
            .unwrap();
        read_command(&mut remote).await; // our $Lock

        let mut negotiation = b"$Supports XmlBZList|$Direction Upload 100|$Key ".to_vec();
        negotiation.extend_from_slice(&proto::lock2key(b"Majestic12"));
        negotiation.push(b'|');
        remote.write_all(&negotiation).await.unwrap();

        read_command(&mut remote).await; // $Supports
        read_command(&mut remote).await; // $Direction Download N
        read_command(&mut remote).await; // $Key

        // the peer only uploads, so our request must arrive
        let request = read_command(&mut remote).await;
        assert_eq!(
            request,
            format!("$ADCGET file TTH/{} 0 4", root).into_bytes()
        );
        remote
            .write_all(format!("$ADCSND file TTH/{} 0 4|DATA", root).as_bytes())
            .await
            .unwrap();

        // no further queue items: the session closes after reassembly
        session.await.unwrap();
        let assembled = shared.layout.downloads.join("f.bin");
        assert_eq!(std::fs::read(&assembled).unwrap(), b"DATA");
        // no part files survive reassembly
        assert!(!shared.layout.part_path(&root, 0).exists());
        assert_eq!(shared.queue.len(), 0);
        assert_eq!(shared.queue.downslots(), 0);
    }
}
