//! The hub session: NMDC handshake, user roster and command dispatch.
//!
//! The session owns the TCP connection to the hub and runs a select loop
//! over the framed socket and an engine command channel. All roster state
//! lives in registries shared with the rest of the engine, so searches and
//! the download manager observe a consistent view of who is online.

use std::{
    collections::{HashMap, HashSet},
    net::IpAddr,
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use regex::Regex;
use tokio::{net::TcpStream, sync::mpsc::UnboundedReceiver};
use tokio_util::codec::Framed;

use crate::{
    codec::{Frame, NmdcCodec},
    engine::Shared,
    error::Result,
    peer, proto, search,
};

lazy_static! {
    static ref MYINFO_RE: Regex =
        Regex::new(r"^\$MyINFO \$ALL ([^ ]*) ([^\$]*)\$ \$([^\$]*)([^\$])\$([^\$]*)\$([^\$]*)\$$")
            .unwrap();
    static ref TO_RE: Regex = Regex::new(r"^\$To: ([^ ]*) From: ([^ ]*) \$(.*)$").unwrap();
    static ref HUBCOUNT_RE: Regex = Regex::new(r"^[0-9]+/[0-9]+/[0-9]+$").unwrap();
}

/// Validates the `seen/registered/op` hub-count triple.
pub(crate) fn is_valid_hubcount(hubcount: &str) -> bool {
    HUBCOUNT_RE.is_match(hubcount)
}

/// What is known about one peer on the hub.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UserInfo {
    pub operator: bool,
    pub bot: bool,
    pub desc: String,
    pub conn: String,
    pub flag: u8,
    pub email: String,
    pub share: u64,
    pub ip: Option<IpAddr>,
}

/// The roster of users currently on the hub.
///
/// Merges from `$NickList`/`$OpList`/`$BotList` run under one lock so that
/// snapshot readers observe a consistent view.
pub(crate) struct Roster {
    inner: Mutex<HashMap<String, UserInfo>>,
}

impl Roster {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Inserts an empty record for a nick we only just heard of.
    pub(crate) fn insert_skeleton(&self, nick: &str) {
        self.inner
            .lock()
            .unwrap()
            .entry(nick.to_owned())
            .or_default();
    }

    /// Merges a `$$`-separated nick list, attaching any durably known IPs.
    pub(crate) fn merge_nicklist(&self, nicks: &[&str], userips: &UserIps) {
        let mut inner = self.inner.lock().unwrap();
        for nick in nicks {
            if nick.is_empty() {
                continue;
            }
            let entry = inner.entry((*nick).to_owned()).or_default();
            if let Some(ip) = userips.get(nick) {
                entry.ip = Some(ip);
            }
        }
    }

    /// Replaces the operator flags: exactly the listed nicks are operators.
    pub(crate) fn set_operators(&self, ops: &[&str]) {
        let ops: HashSet<&str> = ops.iter().copied().collect();
        let mut inner = self.inner.lock().unwrap();
        for (nick, info) in inner.iter_mut() {
            info.operator = ops.contains(nick.as_str());
        }
    }

    /// Replaces the bot flags: exactly the listed nicks are bots.
    pub(crate) fn set_bots(&self, bots: &[&str]) {
        let bots: HashSet<&str> = bots.iter().copied().collect();
        let mut inner = self.inner.lock().unwrap();
        for (nick, info) in inner.iter_mut() {
            info.bot = bots.contains(nick.as_str());
        }
    }

    pub(crate) fn apply_myinfo(
        &self,
        nick: &str,
        desc: &str,
        conn: &str,
        flag: u8,
        email: &str,
        share: u64,
    ) {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entry(nick.to_owned()).or_default();
        entry.desc = desc.to_owned();
        entry.conn = conn.to_owned();
        entry.flag = flag;
        entry.email = email.to_owned();
        entry.share = share;
    }

    pub(crate) fn set_ip(&self, nick: &str, ip: IpAddr) {
        if let Some(entry) = self.inner.lock().unwrap().get_mut(nick) {
            entry.ip = Some(ip);
        }
    }

    pub(crate) fn remove(&self, nick: &str) {
        self.inner.lock().unwrap().remove(nick);
    }

    pub(crate) fn contains(&self, nick: &str) -> bool {
        self.inner.lock().unwrap().contains_key(nick)
    }

    /// A deep copy of the roster for presentation or matching.
    pub(crate) fn snapshot(&self) -> HashMap<String, UserInfo> {
        self.inner.lock().unwrap().clone()
    }

    pub(crate) fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}

/// The durable nick-to-IP map. Unlike the roster it survives users leaving
/// the hub, which is what makes IP-based group resolution possible; an
/// inverted index keeps that lookup cheap.
pub(crate) struct UserIps {
    inner: Mutex<IpInner>,
}

#[derive(Default)]
struct IpInner {
    by_nick: HashMap<String, IpAddr>,
    by_ip: HashMap<IpAddr, HashSet<String>>,
}

impl UserIps {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(IpInner::default()),
        }
    }

    pub(crate) fn insert(&self, nick: &str, ip: IpAddr) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(old) = inner.by_nick.insert(nick.to_owned(), ip) {
            if old != ip {
                if let Some(nicks) = inner.by_ip.get_mut(&old) {
                    nicks.remove(nick);
                }
            }
        }
        inner.by_ip.entry(ip).or_default().insert(nick.to_owned());
    }

    pub(crate) fn get(&self, nick: &str) -> Option<IpAddr> {
        self.inner.lock().unwrap().by_nick.get(nick).copied()
    }

    pub(crate) fn nicks_for(&self, ip: IpAddr) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .by_ip
            .get(&ip)
            .map(|nicks| nicks.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn snapshot(&self) -> HashMap<String, IpAddr> {
        self.inner.lock().unwrap().by_nick.clone()
    }

    pub(crate) fn restore(&self, snapshot: HashMap<String, IpAddr>) {
        let mut inner = self.inner.lock().unwrap();
        inner.by_nick.clear();
        inner.by_ip.clear();
        for (nick, ip) in snapshot {
            inner.by_ip.entry(ip).or_default().insert(nick.clone());
            inner.by_nick.insert(nick, ip);
        }
    }
}

/// The commands the hub session can receive from the engine.
pub(crate) enum HubCommand {
    /// Write one command frame to the hub.
    Send(Bytes),
    /// Eventually shut down the hub session.
    Shutdown,
}

/// Why the session loop returned.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum SessionEnd {
    /// The connection is gone for good (transport closure, `$BadPass` or an
    /// explicit shutdown).
    Closed,
    /// `$ForceMove` redirected us; the config already carries the new
    /// endpoint.
    Reconnect,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Flow {
    Continue,
    Close,
    Reconnect,
}

pub(crate) struct HubSession {
    shared: Arc<Shared>,
    framed: Framed<TcpStream, NmdcCodec>,
    cmd_rx: UnboundedReceiver<HubCommand>,
}

impl HubSession {
    /// Dials the configured hub.
    pub(crate) async fn connect(
        shared: Arc<Shared>,
        cmd_rx: UnboundedReceiver<HubCommand>,
    ) -> Result<Self> {
        let (host, port) = {
            let config = shared.config.read().unwrap();
            (config.host.clone(), config.port)
        };
        log::info!("Connecting to hub {}:{}", host, port);
        let stream = TcpStream::connect((host.as_str(), port)).await?;
        log::info!("Connected to hub {}:{}", host, port);
        Ok(Self {
            shared,
            framed: Framed::new(stream, NmdcCodec::default()),
            cmd_rx,
        })
    }

    /// Runs the session until closure, handing the command channel back so a
    /// redirect can reuse it.
    pub(crate) async fn run(mut self) -> (SessionEnd, UnboundedReceiver<HubCommand>) {
        let end = loop {
            tokio::select! {
                frame = self.framed.next() => match frame {
                    Some(Ok(Frame::Command(cmd))) => match self.handle(cmd).await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Close) => break SessionEnd::Closed,
                        Ok(Flow::Reconnect) => break SessionEnd::Reconnect,
                        Err(e) => {
                            log::warn!("Hub session error: {}", e);
                            break SessionEnd::Closed;
                        }
                    },
                    Some(Ok(Frame::Data(_))) => {
                        log::warn!("Hub sent unexpected binary data");
                    }
                    Some(Err(e)) => {
                        log::warn!("Hub transport error: {}", e);
                        break SessionEnd::Closed;
                    }
                    None => {
                        log::info!("Hub closed the connection");
                        break SessionEnd::Closed;
                    }
                },
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(HubCommand::Send(bytes)) => {
                        if let Err(e) = self.framed.send(Frame::Command(bytes)).await {
                            log::warn!("Failed to write to hub: {}", e);
                            break SessionEnd::Closed;
                        }
                    }
                    Some(HubCommand::Shutdown) | None => {
                        log::info!("Shutting down hub session");
                        break SessionEnd::Closed;
                    }
                },
            }
        };
        (end, self.cmd_rx)
    }

    async fn send(&mut self, cmd: impl Into<Bytes>) -> Result<()> {
        self.framed.send(Frame::Command(cmd.into())).await?;
        Ok(())
    }

    async fn handle(&mut self, cmd: Bytes) -> Result<Flow> {
        // the $Lock challenge carries raw bytes the key is derived from
        if let Some(rest) = cmd.strip_prefix(b"$Lock ") {
            let end = rest.iter().position(|&b| b == b' ').unwrap_or(rest.len());
            let key = proto::lock2key(&rest[..end]);
            let nick = self.shared.config.read().unwrap().nick.clone();
            self.send("$Supports UserCommand UserIP2 TTHSearch ZPipe0 GetZBlock")
                .await?;
            let mut key_cmd = b"$Key ".to_vec();
            key_cmd.extend_from_slice(&key);
            self.send(key_cmd).await?;
            self.send(format!("$ValidateNick {}", nick)).await?;
            return Ok(Flow::Continue);
        }

        let line = String::from_utf8_lossy(&cmd).into_owned();
        if line.starts_with('<') {
            self.shared.links.mainchat(&line);
            return Ok(Flow::Continue);
        }
        if !line.starts_with('$') {
            log::debug!("Unrecognized hub data: {}", line);
            return Ok(Flow::Continue);
        }

        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.first().copied() {
            Some("$Supports") => {
                let mut config = self.shared.config.write().unwrap();
                config.hub_supports = tokens[1..].iter().map(|s| s.to_string()).collect();
            }
            Some("$HubName") => {
                let name = line["$HubName".len()..].trim_start().to_owned();
                self.shared.links.mainchat(&format!("Hub Name : {}", name));
                self.shared.config.write().unwrap().hubname = name;
            }
            Some("$GetPass") => {
                let pass = self.shared.config.read().unwrap().pass.clone();
                self.send(format!("$MyPass {}", pass)).await?;
            }
            Some("$BadPass") => {
                log::warn!("Hub rejected our password");
                return Ok(Flow::Close);
            }
            Some("$Hello") if tokens.len() >= 2 => {
                let me = {
                    let config = self.shared.config.read().unwrap();
                    config.nick.clone()
                };
                if tokens[1] == me {
                    self.send_login_info().await?;
                } else {
                    // $OpList and $BotList will follow if flags matter
                    self.shared.roster.insert_skeleton(tokens[1]);
                }
            }
            Some("$LogedIn") => {
                self.shared.config.write().unwrap().operator = true;
            }
            Some("$HubTopic") => {
                let topic = line["$HubTopic".len()..].trim_start().to_owned();
                self.shared.links.mainchat(&format!("Hub Topic : {}", topic));
                self.shared.config.write().unwrap().topic = topic;
            }
            Some("$NickList") => {
                let payload = line["$NickList ".len().min(line.len())..].to_owned();
                let nicks: Vec<&str> = payload.split("$$").collect();
                self.shared
                    .roster
                    .merge_nicklist(&nicks, &self.shared.userips);
                // ask the hub for everyone's addresses
                self.send(format!("$UserIP {}", payload)).await?;
            }
            Some("$UserIP") => {
                let payload = &line["$UserIP ".len().min(line.len())..];
                for item in payload.split("$$") {
                    let mut parts = item.split_whitespace();
                    if let (Some(nick), Some(ip)) = (parts.next(), parts.next()) {
                        if let Ok(ip) = ip.parse::<IpAddr>() {
                            self.shared.userips.insert(nick, ip);
                            self.shared.roster.set_ip(nick, ip);
                        }
                    }
                }
            }
            Some("$OpList") => {
                let payload = &line["$OpList ".len().min(line.len())..];
                let ops: Vec<&str> = payload.split("$$").filter(|s| !s.is_empty()).collect();
                self.shared.roster.set_operators(&ops);
            }
            Some("$BotList") => {
                let payload = &line["$BotList ".len().min(line.len())..];
                let bots: Vec<&str> = payload.split("$$").filter(|s| !s.is_empty()).collect();
                self.shared.roster.set_bots(&bots);
            }
            Some("$MyINFO") => {
                if let Some((nick, desc, conn, flag, email, share)) = parse_myinfo(&line) {
                    self.shared
                        .roster
                        .apply_myinfo(&nick, &desc, &conn, flag, &email, share);
                } else {
                    log::debug!("Malformed $MyINFO ignored: {}", line);
                }
            }
            Some("$To:") => {
                if let Some((to, from, body)) = parse_pm(&line) {
                    let me = self.shared.config.read().unwrap().nick.clone();
                    if to == me {
                        self.shared.links.pm(&from, &body);
                    }
                }
            }
            Some("$Quit") if tokens.len() >= 2 => {
                self.shared.roster.remove(tokens[1]);
            }
            Some("$ForceMove") if tokens.len() >= 2 => {
                return Ok(self.on_force_move(tokens[1]));
            }
            Some("$Search") => {
                tokio::spawn(search::respond(self.shared.clone(), line.clone()));
            }
            Some("$SR") => {
                search::forward_passive(&self.shared, &line);
            }
            Some("$ConnectToMe") if tokens.len() >= 3 => {
                // our mode does not matter here; the peer asked us to dial
                if let Some((host, port)) = split_host_port(tokens[2]) {
                    peer::spawn_dialer(self.shared.clone(), host, port);
                }
            }
            Some("$RevConnectToMe") if tokens.len() >= 2 => {
                let active = self.shared.config.read().unwrap().active_mode;
                if active {
                    let nick = tokens[1].to_owned();
                    tokio::spawn(peer::connect_remote(
                        self.shared.clone(),
                        nick,
                        false,
                        None,
                    ));
                }
                // passive cannot meet passive; nothing to do otherwise
            }
            _ => log::debug!("Unrecognized command: {}", line),
        }
        Ok(Flow::Continue)
    }

    /// Replies to our own `$Hello`: version, `$MyINFO` and the nick list
    /// request.
    async fn send_login_info(&mut self) -> Result<()> {
        let myinfo = {
            let config = self.shared.config.read().unwrap();
            let mut myinfo = Vec::new();
            myinfo.extend_from_slice(
                format!(
                    "$MyINFO $ALL {} {} <{} V:{},M:{},H:{},S:{}>$ ${}",
                    config.nick,
                    config.desc,
                    config.client,
                    config.version,
                    config.mode_letter(),
                    config.hubcount,
                    config.maxupslots,
                    config.connection
                )
                .as_bytes(),
            );
            // the status flag is a raw byte, not a character
            myinfo.push(config.status);
            myinfo
                .extend_from_slice(format!("${}${}$", config.email, config.sharesize).as_bytes());
            myinfo
        };
        let version = self.shared.config.read().unwrap().version.clone();
        self.send(format!("$Version {}", version)).await?;
        self.send(myinfo).await?;
        self.send("$GetNickList").await?;
        Ok(())
    }

    fn on_force_move(&mut self, target: &str) -> Flow {
        let (host, port) = match split_host_port(target) {
            Some((host, port)) => (host, port),
            None if !target.contains(':') => (target.to_owned(), 411),
            _ => {
                log::debug!("Invalid redirection address: {}", target);
                return Flow::Continue;
            }
        };
        let mut config = self.shared.config.write().unwrap();
        if config.host == host && config.port == port {
            log::debug!("Redirected to the same hub: {}", target);
            return Flow::Continue;
        }
        log::info!("Hub redirected us to {}:{}", host, port);
        config.host = host;
        config.port = port;
        Flow::Reconnect
    }
}

fn split_host_port(addr: &str) -> Option<(String, u16)> {
    let mut parts = addr.split(':');
    let host = parts.next()?.to_owned();
    let port = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((host, port))
}

fn parse_myinfo(line: &str) -> Option<(String, String, String, u8, String, u64)> {
    let caps = MYINFO_RE.captures(line)?;
    Some((
        caps[1].to_owned(),
        caps[2].to_owned(),
        caps[3].to_owned(),
        caps[4].bytes().next().unwrap_or(0),
        caps[5].to_owned(),
        caps[6].parse().unwrap_or(0),
    ))
}

fn parse_pm(line: &str) -> Option<(String, String, String)> {
    let caps = TO_RE.captures(line)?;
    Some((caps[1].to_owned(), caps[2].to_owned(), caps[3].to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{conf::Layout, engine::Shared};
    use pretty_assertions::assert_eq;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        sync::mpsc,
    };

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
    fn test_hubcount_validation() {
        assert!(is_valid_hubcount("0/1/0"));
        assert!(is_valid_hubcount("10/2/33"));
        assert!(!is_valid_hubcount("1/2"));
        assert!(!is_valid_hubcount("a/b/c"));
    }

    #[test]
    fn test_parse_myinfo() {
        let line = "$MyINFO $ALL peer some description$ $100\u{1}$peer@example.com$1073741824$";
        let (nick, desc, conn, flag, email, share) = parse_myinfo(line).unwrap();
        assert_eq!(nick, "peer");
        assert_eq!(desc, "some description");
        assert_eq!(conn, "100");
        assert_eq!(flag, 1);
        assert_eq!(email, "peer@example.com");
        assert_eq!(share, 1_073_741_824);

        assert!(parse_myinfo("$MyINFO garbage").is_none());
    }

    #[test]
    fn test_parse_pm() {
        let (to, from, body) =
            parse_pm("$To: me From: peer $<peer> hello there").unwrap();
        assert_eq!(to, "me");
        assert_eq!(from, "peer");
        assert_eq!(body, "<peer> hello there");
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("10.0.0.1:4000"),
            Some(("10.0.0.1".into(), 4000))
        );
        assert_eq!(split_host_port("no-port"), None);
        assert_eq!(split_host_port("a:b:c"), None);
    }

    #[test]
    fn test_roster_merge_and_flags() {
        let roster = Roster::new();
        let userips = UserIps::new();
        userips.insert("alice", "10.0.0.1".parse().unwrap());
        roster.merge_nicklist(&["alice", "bob", ""], &userips);
        assert!(roster.contains("alice"));
        assert!(roster.contains("bob"));
        assert!(!roster.contains(""));
        assert_eq!(
            roster.snapshot()["alice"].ip,
            Some("10.0.0.1".parse().unwrap())
        );

        roster.set_operators(&["alice"]);
        roster.set_bots(&["bob"]);
        let snapshot = roster.snapshot();
        assert!(snapshot["alice"].operator);
        assert!(!snapshot["alice"].bot);
        assert!(snapshot["bob"].bot);
        assert!(!snapshot["bob"].operator);

        // flags are replaced wholesale on the next list
        roster.set_operators(&[]);
        assert!(!roster.snapshot()["alice"].operator);

        roster.remove("bob");
        assert!(!roster.contains("bob"));
    }

    #[test]
    fn test_userips_inverted_index() {
        let userips = UserIps::new();
        let ip1: IpAddr = "10.0.0.1".parse().unwrap();
        let ip2: IpAddr = "10.0.0.2".parse().unwrap();
        userips.insert("alice", ip1);
        userips.insert("bob", ip1);
        let mut nicks = userips.nicks_for(ip1);
        nicks.sort();
        assert_eq!(nicks, vec!["alice".to_string(), "bob".to_string()]);

        // moving a nick to a new address updates both indexes
        userips.insert("alice", ip2);
        assert_eq!(userips.nicks_for(ip1), vec!["bob".to_string()]);
        assert_eq!(userips.nicks_for(ip2), vec!["alice".to_string()]);
        assert_eq!(userips.get("alice"), Some(ip2));
    }

    #[tokio::test]
    async fn test_hub_handshake_reply_sequence() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = Layout::new(tmp.path()).unwrap();
        let shared = Shared::for_tests(layout);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        {
            let mut config = shared.config.write().unwrap();
            config.nick = "tester".into();
            config.host = addr.ip().to_string();
            config.port = addr.port();
            config.hubcount = "0/1/0".into();
            config.ready = true;
        }

        let (_tx, rx) = mpsc::unbounded_channel();
        let session = HubSession::connect(shared.clone(), rx).await.unwrap();
        let task = tokio::spawn(session.run());

        let (mut hub, _) = listener.accept().await.unwrap();
        hub.write_all(b"$Lock EXTENDEDPROTOCOLMajestic12 Pk=hubsoft|")
            .await
            .unwrap();

        // the client replies, in order: $Supports, $Key, $ValidateNick
        assert_eq!(
            read_command(&mut hub).await,
            b"$Supports UserCommand UserIP2 TTHSearch ZPipe0 GetZBlock".to_vec()
        );
        let key = read_command(&mut hub).await;
        let mut expected = b"$Key ".to_vec();
        expected.extend_from_slice(&proto::lock2key(b"EXTENDEDPROTOCOLMajestic12"));
        assert_eq!(key, expected);
        assert_eq!(
            read_command(&mut hub).await,
            b"$ValidateNick tester".to_vec()
        );

        // a $Hello for our own nick triggers login info
        hub.write_all(b"$Hello tester|").await.unwrap();
        assert_eq!(read_command(&mut hub).await, b"$Version 1".to_vec());
        let myinfo = read_command(&mut hub).await;
        let myinfo_text = String::from_utf8_lossy(&myinfo).into_owned();
        assert!(myinfo_text.starts_with("$MyINFO $ALL tester "));
        assert!(myinfo_text.contains("M:A"));
        assert!(myinfo_text.contains("H:0/1/0"));
        assert_eq!(read_command(&mut hub).await, b"$GetNickList".to_vec());

        // a $Hello for someone else only seeds the roster
        hub.write_all(b"$Hello somebody|").await.unwrap();
        // and $Quit removes them again
        hub.write_all(b"$Quit somebody|").await.unwrap();

        drop(hub);
        let (end, _rx) = task.await.unwrap();
        assert_eq!(end, SessionEnd::Closed);
        assert!(!shared.roster.contains("somebody"));
    }
}
