//! The public entry point of the engine.
//!
//! A [`Client`] owns one hub session plus everything that hangs off it: the
//! roster and durable IP registries, the group and file-list stores, the
//! transfer queue, live peer sessions and searches, the download manager
//! task and the periodic step task. All cross-task state lives in a single
//! [`Shared`] value of internally locked registries; sessions get an `Arc`
//! of it rather than a parent pointer.

use std::{
    collections::HashMap,
    fs,
    net::IpAddr,
    panic::{catch_unwind, AssertUnwindSafe},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Duration,
};

use bytes::Bytes;
use tokio::{sync::mpsc, task::JoinHandle, time::sleep};

use crate::{
    conf::{Config, Layout, Settings},
    download::{self, DownloadQueue, FailureCallback, QueueItem, SuccessCallback, UploadSlots},
    error::{Error, Result},
    filelist::{FilelistStore, TthCache},
    group::GroupRegistry,
    hub::{self, HubCommand, HubSession, Roster, SessionEnd, UserIps},
    peer::TransferRegistry,
    proto,
    search::{self, ResultSink, SearchOptions, SearchRegistry},
    tth, UserInfo,
};

/// The main-chat sink: receives chat lines and hub announcements.
pub type MainchatSink = Arc<dyn Fn(&str) + Send + Sync>;

/// The private-message sink: receives the sending nick and the message.
pub type PmSink = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// The opaque state threaded through periodic step calls.
pub type StepValue = Option<Box<dyn std::any::Any + Send>>;

/// The user function called by the periodic step; it may mutate its state
/// in place. Errors are logged and swallowed.
pub type StepFn = Box<dyn FnMut(&mut StepValue) -> Result<()> + Send>;

/// The outbound message sinks, injectable via [`Client::link`].
pub(crate) struct Links {
    mainchat: Mutex<MainchatSink>,
    pm: Mutex<Option<PmSink>>,
}

impl Links {
    fn new() -> Self {
        Self {
            mainchat: Mutex::new(Arc::new(|message: &str| {
                log::info!(target: "mainchat", "{}", message);
            })),
            pm: Mutex::new(None),
        }
    }

    pub(crate) fn mainchat(&self, message: &str) {
        let sink = self.mainchat.lock().unwrap().clone();
        sink(message);
    }

    /// Delivers a private message, falling back to main chat when no PM sink
    /// is linked.
    pub(crate) fn pm(&self, nick: &str, message: &str) {
        let sink = self.pm.lock().unwrap().clone();
        match sink {
            Some(sink) => sink(nick, message),
            None => self.mainchat(&format!("Private Message : {}", message)),
        }
    }
}

/// The hub connection handle shared with sessions that need to write to the
/// hub.
pub(crate) struct HubState {
    pub tx: Mutex<Option<mpsc::UnboundedSender<HubCommand>>>,
    pub connected: AtomicBool,
}

pub(crate) struct StepHook {
    pub function: Option<StepFn>,
    pub value: StepValue,
}

#[derive(Default)]
pub(crate) struct Tasks {
    pub hub: Option<JoinHandle<()>>,
    pub step: Option<JoinHandle<()>>,
    pub download: Option<JoinHandle<()>>,
}

/// Everything the engine's tasks share. Each registry locks internally;
/// nothing here is mutated without one.
pub(crate) struct Shared {
    pub config: RwLock<Config>,
    pub layout: Layout,
    pub roster: Roster,
    pub userips: UserIps,
    pub groups: GroupRegistry,
    pub filelists: FilelistStore,
    pub tth_cache: TthCache,
    pub queue: DownloadQueue,
    pub searches: SearchRegistry,
    pub transfers: TransferRegistry,
    pub upslots: UploadSlots,
    pub links: Links,
    pub hub: HubState,
    pub download_active: AtomicBool,
    pub step_active: AtomicBool,
    pub step: Mutex<StepHook>,
    pub tasks: Mutex<Tasks>,
}

impl Shared {
    fn new(config: Config, layout: Layout) -> Arc<Self> {
        let base = config.group_base.clone();
        Arc::new(Self {
            config: RwLock::new(config),
            layout,
            roster: Roster::new(),
            userips: UserIps::new(),
            groups: GroupRegistry::new(base.clone()),
            filelists: FilelistStore::new(&base),
            tth_cache: TthCache::new(),
            queue: DownloadQueue::new(),
            searches: SearchRegistry::new(),
            transfers: TransferRegistry::new(),
            upslots: UploadSlots::new(),
            links: Links::new(),
            hub: HubState {
                tx: Mutex::new(None),
                connected: AtomicBool::new(false),
            },
            download_active: AtomicBool::new(false),
            step_active: AtomicBool::new(false),
            step: Mutex::new(StepHook {
                function: None,
                value: None,
            }),
            tasks: Mutex::new(Tasks::default()),
        })
    }

    #[cfg(test)]
    pub(crate) fn for_tests(layout: Layout) -> Arc<Self> {
        Self::new(Config::default(), layout)
    }

    /// Queues one command frame for the hub. Returns false when no hub
    /// session is up.
    pub(crate) fn hub_send(&self, cmd: impl Into<Bytes>) -> bool {
        let tx = self.hub.tx.lock().unwrap();
        match tx.as_ref() {
            Some(tx) => tx.send(HubCommand::Send(cmd.into())).is_ok(),
            None => {
                log::debug!("Dropping hub-bound data: not connected");
                false
            }
        }
    }
}

/// The persisted settings snapshot.
#[derive(Serialize, Deserialize)]
struct Snapshot {
    config: Config,
    filelist: HashMap<String, Vec<PathBuf>>,
    groups: HashMap<String, Vec<String>>,
    queue: Vec<QueueItem>,
    userips: HashMap<String, IpAddr>,
}

/// A Direct Connect client engine.
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    /// Creates a client with its directory layout rooted in the working
    /// directory.
    pub fn new() -> Result<Self> {
        Self::with_base(".")
    }

    /// Creates a client with its directory layout rooted at `base`,
    /// creating `Filelists/`, `Incomplete/`, `Downloads/` and `Settings/`
    /// as needed.
    pub fn with_base(base: impl AsRef<Path>) -> Result<Self> {
        let layout = Layout::new(base)?;
        Ok(Self {
            shared: Shared::new(Config::default(), layout),
        })
    }

    /// Whether a hub session is up and the configuration is ready.
    pub fn active(&self) -> bool {
        self.shared.hub.connected.load(Ordering::SeqCst)
            && self.shared.config.read().unwrap().ready
    }

    /// Applies a configuration update. Refused while connected.
    pub fn configure(&self, settings: Settings) -> Result<()> {
        if self.active() {
            return Err(Error::ReadOnly("configuration"));
        }
        self.shared.config.write().unwrap().configure(settings)
    }

    /// Injects the main-chat and private-message sinks.
    pub fn link(&self, mainchat: Option<MainchatSink>, pm: Option<PmSink>) {
        if let Some(mainchat) = mainchat {
            *self.shared.links.mainchat.lock().unwrap() = mainchat;
        }
        *self.shared.links.pm.lock().unwrap() = pm;
    }

    /// Installs the user step function. Refused while connected.
    pub fn step(&self, function: StepFn, value: StepValue) -> Result<()> {
        if self.active() {
            return Err(Error::ReadOnly("step"));
        }
        let mut hook = self.shared.step.lock().unwrap();
        hook.function = Some(function);
        hook.value = value;
        Ok(())
    }

    /// Connects to the configured hub, announcing the given
    /// `seen/registered/op` hub-count triple, and starts the download
    /// manager and periodic step tasks.
    pub async fn connect(&self, hubcount: &str) -> Result<()> {
        if !hub::is_valid_hubcount(hubcount) {
            return Err(Error::InvalidValue("hubcount"));
        }
        if !self.shared.config.read().unwrap().ready {
            return Err(Error::NotConfigured);
        }
        if self.shared.hub.connected.load(Ordering::SeqCst) {
            return Err(Error::ReadOnly("session"));
        }
        self.shared.config.write().unwrap().hubcount = hubcount.to_owned();

        let (tx, rx) = mpsc::unbounded_channel();
        let session = HubSession::connect(self.shared.clone(), rx).await?;
        *self.shared.hub.tx.lock().unwrap() = Some(tx);
        self.shared.hub.connected.store(true, Ordering::SeqCst);

        let supervisor_shared = self.shared.clone();
        let hub_task = tokio::spawn(async move {
            run_hub_supervisor(supervisor_shared, session).await;
        });

        self.shared.step_active.store(true, Ordering::SeqCst);
        let step_task = tokio::spawn(step_loop(self.shared.clone()));
        self.shared.download_active.store(true, Ordering::SeqCst);
        let download_task = tokio::spawn(download::run(self.shared.clone()));

        let mut tasks = self.shared.tasks.lock().unwrap();
        tasks.hub = Some(hub_task);
        tasks.step = Some(step_task);
        tasks.download = Some(download_task);
        Ok(())
    }

    /// Disconnects from the hub, stopping searches, transfers, the download
    /// manager, the step task and the hub session, in that order.
    pub async fn disconnect(&self) {
        log::debug!("Terminating all searches ...");
        for task in self.shared.searches.shutdown() {
            let _ = task.await;
        }
        log::debug!("Terminating all transfers ...");
        for task in self.shared.transfers.shutdown_all() {
            let _ = task.await;
        }
        log::debug!("Terminating download manager ...");
        self.shared.download_active.store(false, Ordering::SeqCst);
        let download = self.shared.tasks.lock().unwrap().download.take();
        if let Some(task) = download {
            let _ = task.await;
        }
        log::debug!("Terminating step task ...");
        self.shared.step_active.store(false, Ordering::SeqCst);
        let step = self.shared.tasks.lock().unwrap().step.take();
        if let Some(task) = step {
            let _ = task.await;
        }
        log::debug!("Terminating connection to hub ...");
        let tx = self.shared.hub.tx.lock().unwrap().take();
        if let Some(tx) = tx {
            let _ = tx.send(HubCommand::Shutdown);
        }
        let hub = self.shared.tasks.lock().unwrap().hub.take();
        if let Some(task) = hub {
            let _ = task.await;
        }
        self.shared.hub.connected.store(false, Ordering::SeqCst);
        log::info!("Disconnected from hub");
    }

    /// Disconnects and dials the hub again with the retained hub count.
    pub async fn reconnect(&self) -> Result<()> {
        let hubcount = self.shared.config.read().unwrap().hubcount.clone();
        self.disconnect().await;
        self.connect(&hubcount).await
    }

    /// Writes to main chat for everyone on the hub to see.
    pub fn mc_send(&self, text: &str) -> Result<()> {
        let nick = self.shared.config.read().unwrap().nick.clone();
        if !self
            .shared
            .hub_send(format!("<{}> {}", nick, proto::escape(text)))
        {
            return Err(Error::NotConnected);
        }
        Ok(())
    }

    /// Sends a private message to the given user.
    pub fn pm_send(&self, nick: &str, text: &str) -> Result<()> {
        let me = self.shared.config.read().unwrap().nick.clone();
        let frame = format!(
            "$To: {} From: {} $<{}> {}",
            nick,
            me,
            me,
            proto::escape(text)
        );
        if !self.shared.hub_send(frame) {
            return Err(Error::NotConnected);
        }
        Ok(())
    }

    /// Issues a search; every validated result row is handed to `sink`.
    pub async fn search(
        &self,
        pattern: &str,
        sink: ResultSink,
        options: SearchOptions,
    ) -> Result<()> {
        if !self.active() {
            return Err(Error::NotConnected);
        }
        search::search(&self.shared, pattern, sink, options)
            .await
            .map(|_| ())
    }

    /// Queues TTH-addressed content for download. Sources are discovered by
    /// automatic searches.
    pub fn download_tth(
        &self,
        root: &str,
        name: Option<String>,
        location: Option<PathBuf>,
        on_success: Option<SuccessCallback>,
        on_failure: Option<FailureCallback>,
    ) -> Result<()> {
        if !tth::is_root(root) {
            return Err(Error::InvalidValue("tth"));
        }
        self.shared
            .queue
            .push_tth(root, name, location, on_success, on_failure);
        Ok(())
    }

    /// Queues the download of a user's file list into `Filelists/`.
    pub fn download_filelist(
        &self,
        nick: &str,
        on_success: Option<SuccessCallback>,
        on_failure: Option<FailureCallback>,
    ) -> Result<()> {
        let filelist_name = self.shared.config.read().unwrap().filelist_name.clone();
        self.shared.queue.push_filelist(
            nick,
            &filelist_name,
            self.shared.layout.filelists.clone(),
            on_success,
            on_failure,
        );
        Ok(())
    }

    /// Alias for [`Client::download_filelist`].
    pub fn filelist_get(
        &self,
        nick: &str,
        on_success: Option<SuccessCallback>,
        on_failure: Option<FailureCallback>,
    ) -> Result<()> {
        self.download_filelist(nick, on_success, on_failure)
    }

    /// A deep copy of the current user roster.
    pub fn nicklist(&self) -> HashMap<String, UserInfo> {
        self.shared.roster.snapshot()
    }

    pub fn group_create(&self, group: &str) -> Result<()> {
        self.shared.groups.create(group)?;
        self.shared.filelists.ensure_group(group);
        Ok(())
    }

    pub fn group_add(&self, group: &str, nick: &str) -> Result<()> {
        self.shared.groups.add(group, nick)
    }

    pub fn group_remove(&self, group: &str, nick: &str) -> Result<()> {
        self.shared.groups.remove(group, nick)
    }

    pub fn group_check(&self, group: &str, nick: &str) -> bool {
        self.shared.groups.check(group, nick)
    }

    pub fn group_find(&self, nick: &str) -> String {
        self.shared.groups.find(nick)
    }

    pub fn group_delete(&self, group: &str) -> Result<()> {
        self.shared.groups.delete(group)?;
        self.shared.filelists.remove_group(group);
        Ok(())
    }

    /// Renames a group, moving its membership, share roots and on-disk
    /// file-list artifacts.
    pub fn group_rename(&self, group: &str, newname: &str) -> Result<()> {
        self.shared.groups.rename(group, newname)?;
        self.shared.filelists.rename_group(group, newname);
        let layout = &self.shared.layout;
        let _ = fs::rename(layout.filelist_xml(group), layout.filelist_xml(newname));
        let _ = fs::rename(layout.filelist_bz2(group), layout.filelist_bz2(newname));
        Ok(())
    }

    /// Adds a file or directory to a group's share. `None` means the default
    /// group.
    pub fn filelist_add(&self, path: impl Into<PathBuf>, group: Option<&str>) -> Result<()> {
        let group = group.unwrap_or_else(|| self.shared.groups.base());
        self.shared.filelists.add_root(group, path)
    }

    /// Removes a file or directory from a group's share.
    pub fn filelist_remove(&self, path: impl AsRef<Path>, group: Option<&str>) -> Result<()> {
        let group = group.unwrap_or_else(|| self.shared.groups.base());
        self.shared.filelists.remove_root(group, path)
    }

    /// Regenerates a group's file list, hashing any new content. This is
    /// blocking work.
    pub fn filelist_generate(&self, group: Option<&str>) -> Result<PathBuf> {
        let group = group.unwrap_or_else(|| self.shared.groups.base());
        let (cid, signature) = {
            let config = self.shared.config.read().unwrap();
            (config.cid.clone(), config.signature.clone())
        };
        self.shared.filelists.generate(
            group,
            &cid,
            &signature,
            &self.shared.layout,
            &self.shared.tth_cache,
        )
    }

    /// Regenerates the file lists of every group.
    pub fn filelist_refresh(&self) -> Result<()> {
        for group in self.shared.groups.names() {
            self.shared.filelists.ensure_group(&group);
            if let Err(e) = self.filelist_generate(Some(&group)) {
                log::warn!("Failed to refresh filelist for {}: {}", group, e);
            }
        }
        Ok(())
    }

    /// Writes the settings snapshot under `Settings/`.
    pub fn save(&self) -> Result<()> {
        save_snapshot(&self.shared)
    }

    /// Restores the settings snapshot and regenerates every group's file
    /// list. Refused while connected.
    pub fn load(&self) -> Result<()> {
        if self.active() {
            return Err(Error::ReadOnly("session"));
        }
        let path = {
            let config = self.shared.config.read().unwrap();
            self.shared.layout.settings.join(&config.savedata)
        };
        log::debug!("Loading data from {:?}", path);
        let snapshot: Snapshot = serde_json::from_slice(&fs::read(&path)?)?;

        *self.shared.config.write().unwrap() = snapshot.config;
        self.shared.groups.restore(snapshot.groups);
        let base = self.shared.groups.base().to_owned();
        self.shared.filelists.restore_roots(snapshot.filelist, &base);
        self.shared.userips.restore(snapshot.userips);
        let mut queue = snapshot.queue;
        for item in &mut queue {
            item.active = false;
            item.considered = false;
        }
        self.shared.queue.restore(queue);

        self.filelist_refresh()?;
        log::info!("Data loaded successfully");
        Ok(())
    }

    /// Deletes the persisted snapshot and every group's file-list artifacts.
    pub fn reset(&self) -> Result<()> {
        let path = {
            let config = self.shared.config.read().unwrap();
            self.shared.layout.settings.join(&config.savedata)
        };
        if path.exists() {
            fs::remove_file(&path)?;
        }
        for group in self.shared.groups.names() {
            let _ = fs::remove_file(self.shared.layout.filelist_xml(&group));
            let _ = fs::remove_file(self.shared.layout.filelist_bz2(&group));
        }
        Ok(())
    }
}

/// Keeps the hub session alive across `$ForceMove` redirects; once the
/// session is gone for good, stops all child tasks in the prescribed order.
async fn run_hub_supervisor(shared: Arc<Shared>, session: HubSession) {
    let mut session = Some(session);
    let mut idle_rx = None;
    loop {
        let current = match session.take() {
            Some(session) => session,
            None => match idle_rx.take() {
                Some(rx) => match HubSession::connect(shared.clone(), rx).await {
                    Ok(session) => session,
                    Err(e) => {
                        log::warn!("Reconnect failed: {}", e);
                        break;
                    }
                },
                None => break,
            },
        };
        let (end, rx) = current.run().await;
        match end {
            SessionEnd::Reconnect => {
                // the roster belongs to the hub we are leaving
                shared.roster.clear();
                idle_rx = Some(rx);
            }
            SessionEnd::Closed => break,
        }
    }
    shared.hub.connected.store(false, Ordering::SeqCst);
    *shared.hub.tx.lock().unwrap() = None;
    shutdown_children(&shared).await;
}

/// Stops the step task, the download manager, all search listeners and all
/// peer sessions, in that order. Safe to call twice; completed work is
/// skipped.
async fn shutdown_children(shared: &Arc<Shared>) {
    shared.step_active.store(false, Ordering::SeqCst);
    let step = shared.tasks.lock().unwrap().step.take();
    if let Some(task) = step {
        let _ = task.await;
    }
    shared.download_active.store(false, Ordering::SeqCst);
    let download = shared.tasks.lock().unwrap().download.take();
    if let Some(task) = download {
        let _ = task.await;
    }
    for task in shared.searches.shutdown() {
        let _ = task.await;
    }
    for task in shared.transfers.shutdown_all() {
        let _ = task.await;
    }
}

/// The periodic step task: saves a settings snapshot and calls the user
/// step function at a fixed cadence.
async fn step_loop(shared: Arc<Shared>) {
    while shared.step_active.load(Ordering::SeqCst) {
        run_step_once(&shared);
        let step_time = shared.config.read().unwrap().step_time;
        sleep(Duration::from_secs(step_time)).await;
    }
}

/// One step tick: persistence snapshot plus the user function. Errors and
/// panics from the user function are logged and swallowed.
fn run_step_once(shared: &Arc<Shared>) {
    if let Err(e) = save_snapshot(shared) {
        log::debug!("Periodic save failed: {}", e);
    }
    let mut hook = shared.step.lock().unwrap();
    let StepHook { function, value } = &mut *hook;
    if let Some(function) = function.as_mut() {
        match catch_unwind(AssertUnwindSafe(|| function(value))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::debug!("Step function error: {}", e),
            Err(_) => log::warn!("Step function panicked"),
        }
    }
}

fn save_snapshot(shared: &Arc<Shared>) -> Result<()> {
    let (config, path) = {
        let config = shared.config.read().unwrap();
        if !config.ready {
            return Err(Error::NotConfigured);
        }
        let path = shared.layout.settings.join(&config.savedata);
        (config.clone(), path)
    };
    let snapshot = Snapshot {
        config,
        filelist: shared.filelists.roots_snapshot(),
        groups: shared.groups.snapshot(),
        queue: shared.queue.snapshot(),
        userips: shared.userips.snapshot(),
    };
    let serialized = serde_json::to_vec_pretty(&snapshot)?;
    fs::write(&path, serialized)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;

    fn test_client() -> (tempfile::TempDir, Client) {
        let tmp = tempfile::tempdir().unwrap();
        let client = Client::with_base(tmp.path()).unwrap();
        client
            .configure(Settings {
                name: Some("testclient".into()),
                nick: Some("tester".into()),
                host: Some("hub.example".into()),
                ..Settings::default()
            })
            .unwrap();
        (tmp, client)
    }

    #[test]
    fn test_save_load_round_trip() {
        let (tmp, client) = test_client();
        client.group_create("friends").unwrap();
        client.group_add("friends", "alice").unwrap();
        client
            .download_tth(&"A".repeat(39), Some("f.bin".into()), None, None, None)
            .unwrap();
        client.shared.userips.insert("alice", "10.0.0.1".parse().unwrap());
        client.save().unwrap();

        let restored = Client::with_base(tmp.path()).unwrap();
        restored.load().unwrap();
        assert_eq!(restored.shared.config.read().unwrap().nick, "tester");
        assert_eq!(restored.group_find("alice"), "friends");
        assert_eq!(
            restored.shared.userips.get("alice"),
            Some("10.0.0.1".parse().unwrap())
        );
        let queue = restored.shared.queue.snapshot();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].id, "A".repeat(39));
        assert!(!queue[0].active);
        assert!(!queue[0].considered);
    }

    #[test]
    fn test_reset_removes_snapshot() {
        let (_tmp, client) = test_client();
        client.save().unwrap();
        let path = {
            let config = client.shared.config.read().unwrap();
            client.shared.layout.settings.join(&config.savedata)
        };
        assert!(path.is_file());
        client.reset().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_download_tth_validates_root() {
        let (_tmp, client) = test_client();
        assert!(matches!(
            client.download_tth("short", None, None, None, None),
            Err(Error::InvalidValue("tth"))
        ));
        client
            .download_tth(&"B".repeat(39), None, None, None, None)
            .unwrap();
        assert_eq!(client.shared.queue.snapshot().len(), 1);
    }

    #[test]
    fn test_mc_send_requires_connection() {
        let (_tmp, client) = test_client();
        assert!(matches!(client.mc_send("hello"), Err(Error::NotConnected)));
    }

    #[test]
    fn test_links_route_pm_fallback() {
        let (_tmp, client) = test_client();
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        client.link(
            Some(Arc::new(move |message: &str| {
                sink_seen.lock().unwrap().push(message.to_owned());
            })),
            None,
        );
        client.shared.links.mainchat("<peer> hi");
        client.shared.links.pm("peer", "psst");
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], "<peer> hi");
        assert_eq!(seen[1], "Private Message : psst");
    }

    #[test]
    fn test_step_hook_swallows_errors() {
        let (_tmp, client) = test_client();
        let calls = Arc::new(AtomicUsize::new(0));
        let step_calls = calls.clone();
        client
            .step(
                Box::new(move |value| {
                    let count = step_calls.fetch_add(1, Ordering::SeqCst);
                    *value = Some(Box::new(count));
                    if count == 0 {
                        Err(Error::NotConnected)
                    } else {
                        Ok(())
                    }
                }),
                None,
            )
            .unwrap();

        run_step_once(&client.shared);
        run_step_once(&client.shared);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // the state survives the erroring call
        let hook = client.shared.step.lock().unwrap();
        let value = hook.value.as_ref().unwrap().downcast_ref::<usize>();
        assert_eq!(value, Some(&1));
    }

    #[test]
    fn test_group_lifecycle_via_client() {
        let (_tmp, client) = test_client();
        client.group_create("friends").unwrap();
        client.group_add("friends", "bob").unwrap();
        assert!(client.group_check("friends", "bob"));
        client.group_rename("friends", "buddies").unwrap();
        assert_eq!(client.group_find("bob"), "buddies");
        client.group_delete("buddies").unwrap();
        assert_eq!(client.group_find("bob"), "general");
    }

    #[test]
    fn test_filelist_generate_via_client() {
        let (tmp, client) = test_client();
        let share = tmp.path().join("stuff");
        fs::create_dir_all(&share).unwrap();
        fs::write(share.join("a.txt"), b"contents").unwrap();
        client.filelist_add(&share, None).unwrap();
        let path = client.filelist_generate(None).unwrap();
        assert!(path.is_file());
        assert!(client.shared.layout.filelist_bz2("general").is_file());
    }
}
