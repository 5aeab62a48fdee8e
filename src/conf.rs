//! This module defines types used to configure the client engine and its
//! parts, and the on-disk directory layout they share.

use std::{
    fs,
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
};

use rand::Rng;

use crate::{
    error::{Error, Result},
    proto, PartIndex,
};

/// The name this client reports in `$MyINFO` tags and search results.
pub const CLIENT_NAME: &str = "cratedc";

/// The client version reported during the hub handshake.
pub const CLIENT_VERSION: &str = "1";

/// The fixed challenge string offered to peers during the client-to-client
/// handshake.
pub const LOCK: &str = "Majestic12";

/// The name under which peers request our file list.
pub const FILELIST_NAME: &str = "files.xml.bz2";

/// The global configuration for the client engine and all its parts.
///
/// Everything is user data or a tunable; the only piece of derived state is
/// the `ready` gate, which is set by a successful [`Config::configure`] call
/// and cleared while the engine is being reconfigured.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The user's nickname. Nicknames cannot contain spaces.
    pub nick: String,
    /// The password sent in response to `$GetPass`.
    pub pass: String,
    /// The status flag byte advertised in `$MyINFO`.
    pub status: u8,
    /// The user's free-form description.
    pub desc: String,
    /// The user's email address.
    pub email: String,
    /// Total size of the data shared by the user, in bytes.
    pub sharesize: u64,
    /// Whether the hub has granted this user operator rights.
    #[serde(skip)]
    pub operator: bool,

    /// Client name, as advertised in the `$MyINFO` tag.
    pub client: String,
    /// Client version.
    pub version: String,
    /// Connection speed indicator (Mbps).
    pub connection: String,
    /// Whether this client can accept inbound connections (active mode).
    pub active_mode: bool,
    /// The pseudorandomly generated client id carried by generated file
    /// lists.
    pub cid: String,
    /// The IP address peers can reach this client at.
    pub localhost: IpAddr,
    /// The name of the default group to which an unclassified nick belongs.
    pub group_base: String,
    /// The identifier of file lists in the transfer queue.
    pub filelist_name: String,
    /// The name of the file in which the settings snapshot is saved.
    pub savedata: String,
    /// Maximum number of search results to return per request.
    pub sr_count: usize,

    /// The address of the hub to connect to.
    pub host: String,
    /// The port at which the intended hub is running.
    pub port: u16,
    /// The name of the hub, as reported by `$HubName`.
    pub hubname: String,
    /// The topic of the hub, as reported by `$HubTopic`.
    pub topic: String,
    /// The `seen/registered/op` hub-count triple announced in `$MyINFO`.
    pub hubcount: String,
    /// The support set the hub advertised in its `$Supports`.
    #[serde(skip)]
    pub hub_supports: Vec<String>,

    /// How long a user-initiated search waits for results, in seconds.
    pub searchtime_manual: u64,
    /// How long an automatic source search waits for results, in seconds.
    pub searchtime_auto: u64,
    /// How many times a connection request is sent to an unresponsive host.
    pub retry: u32,
    /// Seconds to wait between repeated connection requests.
    pub wait: u64,
    /// Seconds between bounded polls in listener loops.
    pub poll: u64,

    /// The lock string used during the client-to-client handshake.
    pub lock: String,
    /// The `Pk=` signature sent alongside the lock.
    pub signature: String,
    /// The space-separated protocol extensions this client supports.
    pub support: String,

    /// The maximum number of concurrent uploads.
    pub maxupslots: usize,
    /// The maximum number of concurrent downloads.
    pub maxdownslots: usize,

    /// Size of the blocks downloaded from different users, in bytes.
    pub segment_size: u64,
    /// Seconds the download manager waits between idle cycles.
    pub download_time: u64,
    /// Seconds the periodic step waits between runs.
    pub step_time: u64,
    /// Whether a finished download may overwrite an existing file of the
    /// same name.
    pub overwrite: bool,

    /// Set only after a successful configuration; cleared while the engine is
    /// being reconfigured. Persisted so a restored snapshot needs no fresh
    /// configuration round.
    pub ready: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nick: "Anonymous".into(),
            pass: String::new(),
            status: 1,
            desc: String::new(),
            email: String::new(),
            sharesize: 0,
            operator: false,
            client: CLIENT_NAME.into(),
            version: CLIENT_VERSION.into(),
            connection: "100".into(),
            active_mode: true,
            // needs negligible collision probability, nothing more
            cid: format!("{:010}", rand::thread_rng().gen_range(0..10_000_000_000u64)),
            localhost: IpAddr::V4(Ipv4Addr::LOCALHOST),
            group_base: "general".into(),
            filelist_name: FILELIST_NAME.into(),
            savedata: "configuration.json".into(),
            sr_count: 10,
            host: "localhost".into(),
            port: 411,
            hubname: String::new(),
            topic: String::new(),
            hubcount: String::new(),
            hub_supports: Vec::new(),
            searchtime_manual: 15,
            searchtime_auto: 5,
            retry: 3,
            wait: 5,
            poll: 1,
            lock: LOCK.into(),
            signature: CLIENT_NAME.into(),
            support: "XmlBZList ADCGet TTHF".into(),
            maxupslots: 2,
            maxdownslots: 5,
            segment_size: 10 * 1024 * 1024,
            download_time: 1,
            step_time: 1,
            overwrite: false,
            ready: false,
        }
    }
}

impl Config {
    /// The serialized key derived from our own lock; peers must present
    /// exactly this during the handshake.
    pub(crate) fn key(&self) -> Vec<u8> {
        proto::lock2key(self.lock.as_bytes())
    }

    /// The mode letter announced in `$MyINFO`.
    pub(crate) fn mode_letter(&self) -> char {
        if self.active_mode {
            'A'
        } else {
            'P'
        }
    }

    /// Applies a settings update after validating it.
    ///
    /// The `ready` gate is cleared on entry and only set again when the whole
    /// update passed validation.
    pub fn configure(&mut self, settings: Settings) -> Result<()> {
        self.ready = false;

        let name = settings.name.ok_or(Error::MissingOption("name"))?;
        let nick = settings.nick.ok_or(Error::MissingOption("nick"))?;
        let host = settings.host.ok_or(Error::MissingOption("host"))?;
        if name.is_empty() {
            return Err(Error::InvalidValue("name"));
        }
        if nick.is_empty() || nick.contains(|c: char| c.is_whitespace() || c == '|' || c == '$') {
            return Err(Error::InvalidValue("nick"));
        }
        if host.is_empty() {
            return Err(Error::InvalidValue("host"));
        }
        if let Some(port) = settings.port {
            if port == 0 {
                return Err(Error::InvalidValue("port"));
            }
            self.port = port;
        }
        if let Some(segment_size) = settings.segment_size {
            if segment_size == 0 {
                return Err(Error::InvalidValue("segment_size"));
            }
            self.segment_size = segment_size;
        }
        if let Some(maxupslots) = settings.maxupslots {
            self.maxupslots = maxupslots;
        }
        if let Some(maxdownslots) = settings.maxdownslots {
            if maxdownslots == 0 {
                return Err(Error::InvalidValue("maxdownslots"));
            }
            self.maxdownslots = maxdownslots;
        }

        self.client = name;
        self.nick = nick;
        self.host = host;
        if let Some(pass) = settings.pass {
            self.pass = pass;
        }
        if let Some(desc) = settings.desc {
            self.desc = desc;
        }
        if let Some(email) = settings.email {
            self.email = email;
        }
        if let Some(sharesize) = settings.sharesize {
            self.sharesize = sharesize;
        }
        if let Some(connection) = settings.connection {
            self.connection = connection;
        }
        if let Some(active_mode) = settings.active_mode {
            self.active_mode = active_mode;
        }
        if let Some(localhost) = settings.localhost {
            self.localhost = localhost;
        }
        if let Some(overwrite) = settings.overwrite {
            self.overwrite = overwrite;
        }
        if let Some(searchtime_manual) = settings.searchtime_manual {
            self.searchtime_manual = searchtime_manual;
        }
        if let Some(searchtime_auto) = settings.searchtime_auto {
            self.searchtime_auto = searchtime_auto;
        }
        if let Some(retry) = settings.retry {
            self.retry = retry;
        }
        if let Some(wait) = settings.wait {
            self.wait = wait;
        }
        if let Some(download_time) = settings.download_time {
            self.download_time = download_time;
        }
        if let Some(step_time) = settings.step_time {
            self.step_time = step_time;
        }

        self.ready = true;
        Ok(())
    }
}

/// A configuration update, applied with [`Config::configure`].
///
/// `name`, `nick` and `host` are required; everything else falls back to the
/// current value when absent.
#[derive(Clone, Debug, Default)]
pub struct Settings {
    pub name: Option<String>,
    pub nick: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub pass: Option<String>,
    pub desc: Option<String>,
    pub email: Option<String>,
    pub sharesize: Option<u64>,
    pub connection: Option<String>,
    pub active_mode: Option<bool>,
    pub localhost: Option<IpAddr>,
    pub overwrite: Option<bool>,
    pub segment_size: Option<u64>,
    pub maxupslots: Option<usize>,
    pub maxdownslots: Option<usize>,
    pub searchtime_manual: Option<u64>,
    pub searchtime_auto: Option<u64>,
    pub retry: Option<u32>,
    pub wait: Option<u64>,
    pub download_time: Option<u64>,
    pub step_time: Option<u64>,
}

/// The application directories, created on first use.
#[derive(Clone, Debug)]
pub struct Layout {
    /// Where generated and downloaded file lists live.
    pub filelists: PathBuf,
    /// Where in-flight `.partN` segments live.
    pub incomplete: PathBuf,
    /// The default destination of finished downloads.
    pub downloads: PathBuf,
    /// Where the settings snapshot lives.
    pub settings: PathBuf,
}

impl Layout {
    /// Creates the directory layout under the given base, making any missing
    /// directory.
    pub fn new(base: impl AsRef<Path>) -> Result<Self> {
        let base = base.as_ref();
        let layout = Self {
            filelists: base.join("Filelists"),
            incomplete: base.join("Incomplete"),
            downloads: base.join("Downloads"),
            settings: base.join("Settings"),
        };
        for dir in [
            &layout.filelists,
            &layout.incomplete,
            &layout.downloads,
            &layout.settings,
        ]
        .iter()
        {
            fs::create_dir_all(dir)?;
        }
        Ok(layout)
    }

    /// The path of one in-flight part of a segmented download. The
    /// `incomplete` stem is expected to be filename-escaped already.
    pub(crate) fn part_path(&self, incomplete: &str, part: PartIndex) -> PathBuf {
        self.incomplete.join(format!("{}.part{}", incomplete, part))
    }

    /// The path of a group's generated file-list document.
    pub(crate) fn filelist_xml(&self, group: &str) -> PathBuf {
        self.filelists
            .join(format!("#{}.xml", proto::escape_filename(group)))
    }

    /// The path of a group's compressed file-list artifact.
    pub(crate) fn filelist_bz2(&self, group: &str) -> PathBuf {
        self.filelists
            .join(format!("#{}.xml.bz2", proto::escape_filename(group)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn minimal_settings() -> Settings {
        Settings {
            name: Some("testclient".into()),
            nick: Some("tester".into()),
            host: Some("hub.example".into()),
            ..Settings::default()
        }
    }

    #[test]
    fn test_configure_requires_core_options() {
        let mut config = Config::default();
        let err = config
            .configure(Settings {
                nick: Some("tester".into()),
                host: Some("hub.example".into()),
                ..Settings::default()
            })
            .unwrap_err();
        assert_eq!(err.code(), Some(1));
        assert!(!config.ready);

        config.configure(minimal_settings()).unwrap();
        assert!(config.ready);
        assert_eq!(config.nick, "tester");
        assert_eq!(config.client, "testclient");
    }

    #[test]
    fn test_configure_rejects_nick_with_spaces() {
        let mut config = Config::default();
        let mut settings = minimal_settings();
        settings.nick = Some("bad nick".into());
        let err = config.configure(settings).unwrap_err();
        assert_eq!(err.code(), Some(3));
        assert!(!config.ready);
    }

    #[test]
    fn test_configure_clears_ready_until_success() {
        let mut config = Config::default();
        config.configure(minimal_settings()).unwrap();
        assert!(config.ready);

        let mut settings = minimal_settings();
        settings.port = Some(0);
        assert!(config.configure(settings).is_err());
        assert!(!config.ready);
    }

    #[test]
    fn test_layout_creates_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = Layout::new(tmp.path()).unwrap();
        assert!(layout.filelists.is_dir());
        assert!(layout.incomplete.is_dir());
        assert!(layout.downloads.is_dir());
        assert!(layout.settings.is_dir());
        assert_eq!(
            layout.part_path("ABC", 2),
            tmp.path().join("Incomplete").join("ABC.part2")
        );
        assert_eq!(
            layout.filelist_xml("my group"),
            tmp.path().join("Filelists").join("#my&#32;group.xml")
        );
    }
}
