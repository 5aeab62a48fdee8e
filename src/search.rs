//! The search engine: issuing queries, responding to hub-relayed `$Search`
//! frames and validating `$SR` results.
//!
//! Searches are keyed by their serialized query tuple
//! `<T|F>?<T|F>?<size>?<type>?<term>`. In active mode every search owns a
//! freshly bound UDP listener that collects results until its time budget
//! runs out; in passive mode the hub relays a bounded number of results back
//! over the TCP session.

use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use rand::{seq::SliceRandom, Rng};
use regex::Regex;
use tokio::{net::UdpSocket, task::JoinHandle, time::timeout};

use crate::{
    engine::Shared,
    error::{Error, Result},
    filelist::Node,
    proto,
};

/// How many random ports are tried before giving up on binding a listener.
const MAX_BIND_ATTEMPTS: u32 = 64;

lazy_static! {
    static ref ACTIVE_SEARCH_RE: Regex = Regex::new(
        r"^\$Search ([0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}):([0-9]{1,5}) ([TF])\?([TF])\?([0-9]*)\?([0-9])\?(.*)$"
    )
    .unwrap();
    static ref PASSIVE_SEARCH_RE: Regex =
        Regex::new(r"^\$Search Hub:([^ ]*) ([TF])\?([TF])\?([0-9]*)\?([0-9])\?(.*)$").unwrap();
    static ref QUERY_RE: Regex =
        Regex::new(r"^([TF])\?([TF])\?([0-9]*)\?([0-9])\?(.*)$").unwrap();
}

/// Extensions accepted for each searchable file type.
fn extensions(ftype: u8) -> Option<&'static str> {
    match ftype {
        2 => Some("mp mp wav au rm mid sm"),
        3 => Some("zip arj rar lzh gz z arc pak"),
        4 => Some("doc txt wri pdf ps tex"),
        5 => Some("pm exe bat com"),
        6 => Some("gif jpg jpeg bmp pcx png wmf psd"),
        7 => Some("mpg mpeg avi asf mov"),
        _ => None,
    }
}

/// How a search was initiated. Automatic searches look for download sources
/// and wait a much shorter time for results.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchMode {
    Manual,
    Auto,
}

impl Default for SearchMode {
    fn default() -> Self {
        SearchMode::Manual
    }
}

/// Whether a size bound is a lower or an upper limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizeLimit {
    Min,
    Max,
}

/// The closed set of searchable file types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FileType {
    Any = 1,
    Audio = 2,
    Compressed = 3,
    Document = 4,
    Executable = 5,
    Image = 6,
    Video = 7,
    Folder = 8,
    Tth = 9,
}

/// Options accepted by [`crate::Client::search`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SearchOptions {
    pub limit: Option<SizeLimit>,
    pub size: Option<u64>,
    pub file_type: Option<FileType>,
    pub mode: SearchMode,
}

/// One validated search result delivered to a result sink.
#[derive(Clone, Debug, PartialEq)]
pub enum SearchRow {
    File {
        nick: String,
        path: String,
        size: u64,
        slots_used: u32,
        slots_max: u32,
        /// The content identifier as received, `TTH:`-prefixed.
        tth: String,
    },
    Folder {
        nick: String,
        path: String,
        slots_used: u32,
        slots_max: u32,
        hubname: String,
    },
}

/// The callback invoked once per validated result row.
pub type ResultSink = Arc<dyn Fn(SearchRow) + Send + Sync>;

/// A deserialized query tuple.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Query {
    pub size_restricted: bool,
    pub is_max: bool,
    pub size: u64,
    pub ftype: u8,
    /// The decoded term: spaces restored and entities resolved, except for
    /// TTH queries, which keep the bare root.
    pub term: String,
}

impl Query {
    /// Parses a serialized query tuple.
    pub(crate) fn parse(ss: &str) -> Option<Self> {
        let caps = QUERY_RE.captures(ss)?;
        let ftype: u8 = caps[4].parse().ok()?;
        let term = decode_term(&caps[5], ftype);
        Some(Self {
            size_restricted: &caps[1] == "T",
            is_max: &caps[2] == "T",
            size: caps[3].parse().unwrap_or(0),
            ftype,
            term,
        })
    }

    /// Whether every space-separated term token occurs in the name.
    fn matches_name(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        self.term
            .to_lowercase()
            .split_whitespace()
            .all(|word| name.contains(word))
    }

    fn matches_size(&self, size: u64) -> bool {
        if !self.size_restricted {
            return true;
        }
        if self.is_max {
            size <= self.size
        } else {
            size >= self.size
        }
    }

    /// Whether the name carries an extension from the type's whitelist.
    /// Types without a whitelist accept everything.
    fn matches_extension(&self, name: &str) -> bool {
        match extensions(self.ftype) {
            Some(list) => {
                let name = name.to_lowercase();
                list.split_whitespace()
                    .any(|ext| name.ends_with(&format!(".{}", ext)))
            }
            None => true,
        }
    }
}

/// The decoded term of a query: `$` becomes a space and entities are
/// resolved, except for TTH queries, which strip the four-byte prefix and
/// keep the literal root.
fn decode_term(raw: &str, ftype: u8) -> String {
    if ftype == 9 {
        raw.get(4..).unwrap_or("").to_owned()
    } else {
        proto::unescape(&raw.replace('$', " "))
    }
}

/// Serializes a query tuple for the wire.
fn build_query(pattern: &str, options: &SearchOptions) -> String {
    let size_restricted = if options.limit.is_some() { "T" } else { "F" };
    let is_max = if options.limit == Some(SizeLimit::Max) {
        "T"
    } else {
        "F"
    };
    let size = options.size.unwrap_or(0);
    let ftype = options.file_type.unwrap_or(FileType::Any) as u8;
    let term = proto::escape(pattern).replace(' ', "$");
    format!(
        "{}?{}?{}?{}?{}",
        size_restricted, is_max, size, ftype, term
    )
}

/// One file or directory hit produced by a tree walk.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum TreeHit {
    File { path: String, size: u64, tth: String },
    Dir { path: String },
}

/// Recursively matches a query against a listing, building `/`-separated
/// paths relative to the listing root.
pub(crate) fn match_tree(children: &[Node], query: &Query, prefix: &str) -> Vec<TreeHit> {
    let mut hits = Vec::new();
    for node in children {
        match node {
            Node::File { name, size, tth } => {
                // folder searches never return files
                if query.ftype == 8 {
                    continue;
                }
                if query.ftype == 9 {
                    if tth == &query.term {
                        hits.push(TreeHit::File {
                            path: format!("{}{}", prefix, name),
                            size: *size,
                            tth: tth.clone(),
                        });
                    }
                    continue;
                }
                if !query.matches_name(name)
                    || !query.matches_size(*size)
                    || !query.matches_extension(name)
                {
                    continue;
                }
                hits.push(TreeHit::File {
                    path: format!("{}{}", prefix, name),
                    size: *size,
                    tth: tth.clone(),
                });
            }
            Node::Directory { name, children } => {
                let nested = format!("{}{}/", prefix, name);
                hits.extend(match_tree(children, query, &nested));
                // directories carry neither a TTH nor an extension
                if query.ftype != 1 && query.ftype != 8 {
                    continue;
                }
                if query.matches_name(name) {
                    hits.push(TreeHit::Dir {
                        path: format!("{}{}", prefix, name),
                    });
                }
            }
        }
    }
    hits
}

struct SearchEntry {
    #[allow(dead_code)]
    mode: SearchMode,
    sink: ResultSink,
    stop: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

/// The registry of in-flight and completed searches. Entries stay registered
/// after their listener times out so late hub-relayed results still find
/// their sink.
pub(crate) struct SearchRegistry {
    inner: Mutex<HashMap<String, SearchEntry>>,
}

impl SearchRegistry {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn register(&self, ss: &str, mode: SearchMode, sink: ResultSink) -> Arc<AtomicBool> {
        let stop = Arc::new(AtomicBool::new(false));
        let mut inner = self.inner.lock().unwrap();
        // a repeated identical query replaces the previous record
        if let Some(old) = inner.insert(
            ss.to_owned(),
            SearchEntry {
                mode,
                sink,
                stop: stop.clone(),
                task: None,
            },
        ) {
            old.stop.store(true, Ordering::SeqCst);
        }
        stop
    }

    fn set_task(&self, ss: &str, task: JoinHandle<()>) {
        if let Some(entry) = self.inner.lock().unwrap().get_mut(ss) {
            entry.task = Some(task);
        }
    }

    fn sink(&self, ss: &str) -> Option<ResultSink> {
        self.inner
            .lock()
            .unwrap()
            .get(ss)
            .map(|entry| entry.sink.clone())
    }

    pub(crate) fn keys(&self) -> Vec<String> {
        self.inner.lock().unwrap().keys().cloned().collect()
    }

    /// Flags every listener to stop and hands back their tasks for joining.
    pub(crate) fn shutdown(&self) -> Vec<JoinHandle<()>> {
        let mut inner = self.inner.lock().unwrap();
        let mut tasks = Vec::new();
        for entry in inner.values_mut() {
            entry.stop.store(true, Ordering::SeqCst);
            if let Some(task) = entry.task.take() {
                tasks.push(task);
            }
        }
        tasks
    }
}

/// Issues a search and registers its result sink. Returns the serialized
/// query tuple the search is keyed by.
pub(crate) async fn search(
    shared: &Arc<Shared>,
    pattern: &str,
    sink: ResultSink,
    options: SearchOptions,
) -> Result<String> {
    if pattern.is_empty() {
        return Err(Error::InvalidValue("pattern"));
    }
    let ss = build_query(pattern, &options);
    let stop = shared.searches.register(&ss, options.mode, sink);

    let (active_mode, localhost, nick, searchtime, poll) = {
        let config = shared.config.read().unwrap();
        let searchtime = match options.mode {
            SearchMode::Manual => config.searchtime_manual,
            SearchMode::Auto => config.searchtime_auto,
        };
        (
            config.active_mode,
            config.localhost,
            config.nick.clone(),
            searchtime,
            config.poll,
        )
    };

    if active_mode {
        let socket = bind_ephemeral_udp().await?;
        let port = socket.local_addr()?.port();
        let task = tokio::spawn(listen(
            shared.clone(),
            socket,
            ss.clone(),
            stop,
            searchtime,
            poll,
        ));
        shared.searches.set_task(&ss, task);
        shared.hub_send(format!("$Search {}:{} {}", localhost, port, ss));
    } else {
        shared.hub_send(format!("$Search Hub:{} {}", nick, ss));
    }
    Ok(ss)
}

/// Binds a UDP socket on a randomly drawn non-privileged port, retrying on
/// contention.
async fn bind_ephemeral_udp() -> Result<UdpSocket> {
    for _ in 0..MAX_BIND_ATTEMPTS {
        let port: u16 = {
            let mut rng = rand::thread_rng();
            rng.gen_range(1025..=u16::MAX)
        };
        match UdpSocket::bind(("0.0.0.0", port)).await {
            Ok(socket) => return Ok(socket),
            Err(_) => continue,
        }
    }
    Err(Error::Bind("udp"))
}

/// The per-search result listener: collects datagrams until the search's
/// time budget runs out, checking the stop flag every poll tick.
async fn listen(
    shared: Arc<Shared>,
    socket: UdpSocket,
    ss: String,
    stop: Arc<AtomicBool>,
    searchtime: u64,
    poll: u64,
) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(searchtime);
    let mut buf = vec![0u8; 4096];
    while !stop.load(Ordering::SeqCst) {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            break;
        }
        let tick = Duration::from_secs(poll.max(1)).min(deadline - now);
        match timeout(tick, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => {
                let datagram = String::from_utf8_lossy(&buf[..len]).into_owned();
                for line in datagram.split('|').filter(|line| !line.is_empty()) {
                    forward(&shared, &ss, line, true);
                }
            }
            Ok(Err(e)) => {
                log::warn!("Search listener error: {}", e);
                break;
            }
            // no data this tick; re-check the stop flag and deadline
            Err(_) => {}
        }
    }
    log::debug!("Search listener for {} closed", ss);
}

enum Origin {
    Active { ip: IpAddr, port: u16 },
    Passive { nick: String },
}

/// Answers a hub-relayed `$Search` frame with our matching shares.
pub(crate) async fn respond(shared: Arc<Shared>, request: String) {
    let (origin, query) = match parse_request(&request) {
        Some(parsed) => parsed,
        None => {
            log::debug!("Unrecognized search request - ignored: {}", request);
            return;
        }
    };

    let base = shared.groups.base().to_owned();
    let group = match &origin {
        Origin::Active { ip, .. } => {
            // estimate the requester from its IP; ambiguity falls back to the
            // default group
            let mut candidates: Vec<String> = shared
                .userips
                .nicks_for(*ip)
                .into_iter()
                .filter(|nick| shared.roster.contains(nick))
                .collect();
            if candidates.len() == 1 {
                shared.groups.find(&candidates.remove(0))
            } else {
                base
            }
        }
        Origin::Passive { nick } => shared.groups.find(nick),
    };

    let listing = match shared.filelists.listing(&group) {
        Some(listing) => listing,
        None => return,
    };
    let mut hits = match_tree(&listing.children, &query, "");
    if hits.is_empty() {
        return;
    }
    let sr_count = {
        let mut rng = rand::thread_rng();
        hits.shuffle(&mut rng);
        shared.config.read().unwrap().sr_count
    };
    hits.truncate(sr_count);

    let (nick, host, port, hubname, maxupslots) = {
        let config = shared.config.read().unwrap();
        (
            config.nick.clone(),
            config.host.clone(),
            config.port,
            config.hubname.clone(),
            config.maxupslots,
        )
    };
    let upslots = shared.upslots.current();
    let passive_tag = match &origin {
        Origin::Active { .. } => String::new(),
        Origin::Passive { nick } => format!("\u{5}{}", nick),
    };

    let lines: Vec<String> = hits
        .into_iter()
        .map(|hit| match hit {
            TreeHit::File { path, size, tth } => format!(
                "$SR {} {}\u{5}{} {}/{}\u{5}TTH:{} ({}:{}){}",
                nick, path, size, upslots, maxupslots, tth, host, port, passive_tag
            ),
            TreeHit::Dir { path } => format!(
                "$SR {} {} {}/{}\u{5}{} ({}:{}){}",
                nick, path, upslots, maxupslots, hubname, host, port, passive_tag
            ),
        })
        .collect();

    match origin {
        Origin::Active { ip, port } => {
            let socket = match UdpSocket::bind("0.0.0.0:0").await {
                Ok(socket) => socket,
                Err(e) => {
                    log::warn!("Failed to open search reply socket: {}", e);
                    return;
                }
            };
            for line in lines {
                let mut datagram = line.into_bytes();
                datagram.push(b'|');
                if let Err(e) = socket.send_to(&datagram, (ip, port)).await {
                    log::warn!("Failed to send search result: {}", e);
                }
            }
        }
        Origin::Passive { .. } => {
            for line in lines {
                shared.hub_send(line);
            }
        }
    }
}

fn parse_request(request: &str) -> Option<(Origin, Query)> {
    if let Some(caps) = ACTIVE_SEARCH_RE.captures(request) {
        let ip: IpAddr = caps[1].parse().ok()?;
        let port: u16 = caps[2].parse().ok()?;
        let ftype: u8 = caps[6].parse().ok()?;
        return Some((
            Origin::Active { ip, port },
            Query {
                size_restricted: &caps[3] == "T",
                is_max: &caps[4] == "T",
                size: caps[5].parse().unwrap_or(0),
                ftype,
                term: decode_term(&caps[7], ftype),
            },
        ));
    }
    if let Some(caps) = PASSIVE_SEARCH_RE.captures(request) {
        let ftype: u8 = caps[5].parse().ok()?;
        return Some((
            Origin::Passive {
                nick: caps[1].to_owned(),
            },
            Query {
                size_restricted: &caps[2] == "T",
                is_max: &caps[3] == "T",
                size: caps[4].parse().unwrap_or(0),
                ftype,
                term: decode_term(&caps[6], ftype),
            },
        ));
    }
    None
}

/// Routes a hub-delivered `$SR` frame to every registered search; each one
/// re-validates the row against its own query.
pub(crate) fn forward_passive(shared: &Arc<Shared>, line: &str) {
    for ss in shared.searches.keys() {
        forward(shared, &ss, line, true);
    }
}

/// Parses a `$SR` line and, if it satisfies the search's query, delivers a
/// structured row to the search's sink. With `validate` set the row is
/// re-checked against the query (substring, size, type) before delivery.
pub(crate) fn forward(shared: &Arc<Shared>, ss: &str, data: &str, validate: bool) {
    let query = match Query::parse(ss) {
        Some(query) => query,
        None => return,
    };
    let (host, port) = {
        let config = shared.config.read().unwrap();
        (config.host.clone(), config.port)
    };
    let anchor = format!(r" \({}:{}\)$", regex::escape(&host), port);
    // the 0x05 separator byte is embedded literally in the patterns
    let sep = '\u{5}';
    let file_re = Regex::new(&format!(
        r"^\$SR ([^ ]+) (.*){sep}([0-9]+) ([0-9]+)/([0-9]+){sep}([^ ]+){anchor}",
        sep = sep,
        anchor = anchor
    ))
    .unwrap();
    let dir_re = Regex::new(&format!(
        r"^\$SR ([^ ]+) (.*) ([0-9]+)/([0-9]+){sep}([^ ]+){anchor}",
        sep = sep,
        anchor = anchor
    ))
    .unwrap();

    let row = if let Some(caps) = file_re.captures(data) {
        let size: u64 = match caps[3].parse() {
            Ok(size) => size,
            Err(_) => return,
        };
        if validate {
            if query.ftype == 9 {
                // TTH rows validate on the root, not the name
                if &caps[6] != format!("TTH:{}", query.term).as_str() {
                    return;
                }
            } else if !query.matches_name(&caps[2])
                || !query.matches_size(size)
                || !query.matches_extension(&caps[2])
            {
                return;
            }
        }
        SearchRow::File {
            nick: caps[1].to_owned(),
            path: caps[2].to_owned(),
            size,
            slots_used: caps[4].parse().unwrap_or(0),
            slots_max: caps[5].parse().unwrap_or(0),
            tth: caps[6].to_owned(),
        }
    } else if let Some(caps) = dir_re.captures(data) {
        if validate {
            // file-only types cannot produce directory rows
            if matches!(query.ftype, 2..=7) || query.ftype == 9 {
                return;
            }
            if !query.matches_name(&caps[2]) {
                return;
            }
        }
        SearchRow::Folder {
            nick: caps[1].to_owned(),
            path: caps[2].to_owned(),
            slots_used: caps[3].parse().unwrap_or(0),
            slots_max: caps[4].parse().unwrap_or(0),
            hubname: caps[5].to_owned(),
        }
    } else {
        return;
    };

    if let Some(sink) = shared.searches.sink(ss) {
        sink(row);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn song_listing() -> Vec<Node> {
        vec![Node::Directory {
            name: "a".into(),
            children: vec![Node::Directory {
                name: "b".into(),
                children: vec![Node::File {
                    name: "song.mp3".into(),
                    size: 5_242_880,
                    tth: "X".repeat(39),
                }],
            }],
        }]
    }

    #[test]
    fn test_build_query_escapes_term() {
        let ss = build_query("two words", &SearchOptions::default());
        assert_eq!(ss, "F?F?0?1?two$words");

        let ss = build_query(
            "song",
            &SearchOptions {
                limit: Some(SizeLimit::Max),
                size: Some(1_048_576),
                file_type: Some(FileType::Audio),
                mode: SearchMode::Manual,
            },
        );
        assert_eq!(ss, "T?T?1048576?2?song");
    }

    #[test]
    fn test_query_round_trip() {
        let ss = build_query("two words", &SearchOptions::default());
        let query = Query::parse(&ss).unwrap();
        assert_eq!(query.term, "two words");
        assert_eq!(query.ftype, 1);
        assert!(!query.size_restricted);
    }

    #[test]
    fn test_tth_query_keeps_literal_root() {
        let root = "L".repeat(39);
        let ss = build_query(
            &format!("TTH:{}", root),
            &SearchOptions {
                file_type: Some(FileType::Tth),
                mode: SearchMode::Auto,
                ..SearchOptions::default()
            },
        );
        let query = Query::parse(&ss).unwrap();
        assert_eq!(query.ftype, 9);
        assert_eq!(query.term, root);
    }

    #[test]
    fn test_match_tree_finds_audio_file() {
        // query (F,F,0,2,"song") returns the one file row
        let query = Query {
            size_restricted: false,
            is_max: false,
            size: 0,
            ftype: 2,
            term: "song".into(),
        };
        let hits = match_tree(&song_listing(), &query, "");
        assert_eq!(
            hits,
            vec![TreeHit::File {
                path: "a/b/song.mp3".into(),
                size: 5_242_880,
                tth: "X".repeat(39),
            }]
        );
    }

    #[test]
    fn test_match_tree_enforces_max_size() {
        // query (T,T,1048576,2,"song") must return no rows
        let query = Query {
            size_restricted: true,
            is_max: true,
            size: 1_048_576,
            ftype: 2,
            term: "song".into(),
        };
        assert!(match_tree(&song_listing(), &query, "").is_empty());
    }

    #[test]
    fn test_match_tree_enforces_extension_whitelist() {
        let listing = vec![Node::File {
            name: "notes.txt".into(),
            size: 10,
            tth: "T".repeat(39),
        }];
        let audio = Query {
            size_restricted: false,
            is_max: false,
            size: 0,
            ftype: 2,
            term: "notes".into(),
        };
        assert!(match_tree(&listing, &audio, "").is_empty());
        let document = Query { ftype: 4, ..audio };
        assert_eq!(match_tree(&listing, &document, "").len(), 1);
    }

    #[test]
    fn test_match_tree_tth_exact_match() {
        let query = Query {
            size_restricted: false,
            is_max: false,
            size: 0,
            ftype: 9,
            term: "X".repeat(39),
        };
        assert_eq!(match_tree(&song_listing(), &query, "").len(), 1);

        let miss = Query {
            term: "Y".repeat(39),
            ..query
        };
        assert!(match_tree(&song_listing(), &miss, "").is_empty());
    }

    #[test]
    fn test_match_tree_folder_results() {
        let query = Query {
            size_restricted: false,
            is_max: false,
            size: 0,
            ftype: 8,
            term: "b".into(),
        };
        let hits = match_tree(&song_listing(), &query, "");
        assert_eq!(hits, vec![TreeHit::Dir { path: "a/b".into() }]);
    }

    #[test]
    fn test_forward_delivers_validated_rows() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = crate::conf::Layout::new(tmp.path()).unwrap();
        let shared = crate::engine::Shared::for_tests(layout);

        let rows: Arc<Mutex<Vec<SearchRow>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_rows = rows.clone();
        let sink: ResultSink = Arc::new(move |row| sink_rows.lock().unwrap().push(row));
        let ss = "F?F?0?1?song";
        shared.searches.register(ss, SearchMode::Manual, sink);

        // the default config points at localhost:411, which the anchor uses
        let file_line =
            "$SR peer a/b/song.mp3\u{5}5242880 1/2\u{5}TTH:XXX (localhost:411)";
        forward(&shared, ss, file_line, true);
        let dir_line = "$SR peer songs 1/2\u{5}BigHub (localhost:411)";
        forward(&shared, ss, dir_line, true);
        // a row that does not satisfy the query is dropped on validation
        let miss_line = "$SR peer other.bin\u{5}10 1/2\u{5}TTH:YYY (localhost:411)";
        forward(&shared, ss, miss_line, true);
        // a row anchored at a different hub never matches
        let wrong_hub =
            "$SR peer a/b/song.mp3\u{5}5242880 1/2\u{5}TTH:XXX (otherhub:411)";
        forward(&shared, ss, wrong_hub, true);

        let rows = rows.lock().unwrap();
        assert_eq!(
            *rows,
            vec![
                SearchRow::File {
                    nick: "peer".into(),
                    path: "a/b/song.mp3".into(),
                    size: 5_242_880,
                    slots_used: 1,
                    slots_max: 2,
                    tth: "TTH:XXX".into(),
                },
                SearchRow::Folder {
                    nick: "peer".into(),
                    path: "songs".into(),
                    slots_used: 1,
                    slots_max: 2,
                    hubname: "BigHub".into(),
                },
            ]
        );
    }

    #[test]
    fn test_forward_validates_tth_rows_on_root() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = crate::conf::Layout::new(tmp.path()).unwrap();
        let shared = crate::engine::Shared::for_tests(layout);

        let rows: Arc<Mutex<Vec<SearchRow>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_rows = rows.clone();
        let sink: ResultSink = Arc::new(move |row| sink_rows.lock().unwrap().push(row));
        let root = "R".repeat(39);
        let ss = format!("F?F?0?9?TTH:{}", root);
        shared.searches.register(&ss, SearchMode::Auto, sink);

        let hit = format!(
            "$SR peer a/b/song.mp3\u{5}5242880 1/2\u{5}TTH:{} (localhost:411)",
            root
        );
        forward(&shared, &ss, &hit, true);
        let miss = format!(
            "$SR peer a/b/song.mp3\u{5}5242880 1/2\u{5}TTH:{} (localhost:411)",
            "Z".repeat(39)
        );
        forward(&shared, &ss, &miss, true);

        let rows = rows.lock().unwrap();
        assert_eq!(rows.len(), 1);
        match &rows[0] {
            SearchRow::File { tth, .. } => assert_eq!(*tth, format!("TTH:{}", root)),
            _ => panic!("expected file row"),
        }
    }

    #[test]
    fn test_parse_request_active_and_passive() {
        let (origin, query) =
            parse_request("$Search 10.0.0.1:4111 F?F?0?1?two$words").unwrap();
        match origin {
            Origin::Active { ip, port } => {
                assert_eq!(ip, "10.0.0.1".parse::<IpAddr>().unwrap());
                assert_eq!(port, 4111);
            }
            _ => panic!("expected active origin"),
        }
        assert_eq!(query.term, "two words");

        let (origin, query) = parse_request("$Search Hub:peer F?F?0?9?TTH:AAAA").unwrap();
        match origin {
            Origin::Passive { nick } => assert_eq!(nick, "peer"),
            _ => panic!("expected passive origin"),
        }
        assert_eq!(query.term, "AAAA");

        assert!(parse_request("$Search garbage").is_none());
    }
}
