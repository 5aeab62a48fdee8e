//! The segmented download manager.
//!
//! The transfer queue is the shared ledger of everything the client wants to
//! fetch: file lists and TTH-addressed content, the latter expanded into
//! per-segment entries once a source search has revealed the file's size.
//! Peer sessions borrow one queue item at a time (`transfer_next`), write the
//! segment into `Incomplete/` and hand the item back on completion or
//! failure; once the last segment of an artifact lands, `rebuild`
//! concatenates the parts into the destination file.

use std::{
    fs::{self, File},
    io::{Read, Write},
    panic::{catch_unwind, AssertUnwindSafe},
    path::{Path, PathBuf},
    sync::{atomic::Ordering, Arc, Mutex},
    time::Duration,
};

use rand::seq::SliceRandom;
use tokio::{task, time::sleep};

use crate::{
    conf::Layout,
    engine::Shared,
    part_count, part_len, peer,
    search::{self, FileType, ResultSink, SearchMode, SearchOptions, SearchRow},
    PartIndex,
};

/// Size of the copy buffer used while concatenating parts.
const REBUILD_BLOCK_LEN: usize = 1024 * 1024;

/// How many times a busy part file is retried before deletion gives up.
const REMOVE_RETRIES: u32 = 5;

/// Called with the destination path once an item has been fully reassembled.
pub type SuccessCallback = Arc<dyn Fn(&Path) + Send + Sync>;

/// Called when an item's transfer failed and was released for retry.
pub type FailureCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    /// A file-list pull from a single peer.
    File,
    /// TTH-addressed content, downloaded in segments.
    Tth,
}

/// One entry of the transfer queue.
#[derive(Clone, Serialize, Deserialize)]
pub struct QueueItem {
    /// The TTH root, or the literal file-list identifier.
    pub id: String,
    pub kind: ItemKind,
    /// The filename-escaped stem under which `.partN` files are kept.
    pub incomplete: String,
    /// The part index; `None` while a TTH item is still unexpanded.
    pub part: Option<PartIndex>,
    /// The total part count; `None` while a TTH item is still unexpanded.
    pub parts: Option<usize>,
    /// Nicks known to carry the content.
    pub nicks: Vec<String>,
    /// The byte offset of this segment within the artifact.
    pub offset: u64,
    /// The byte length of this segment; negative means "to end of file".
    pub length: i64,
    /// Ascending selection priority; lower values are picked first.
    pub priority: u8,
    /// The destination basename, once known.
    pub name: Option<String>,
    /// The artifact's total size; negative while unknown.
    pub size: i64,
    /// An optional destination directory overriding the downloads directory.
    pub location: Option<PathBuf>,
    /// Whether a peer session currently owns this item.
    pub active: bool,
    /// Whether the download manager already dispatched a connect for it.
    pub considered: bool,
    #[serde(skip)]
    pub on_success: Option<SuccessCallback>,
    #[serde(skip)]
    pub on_failure: Option<FailureCallback>,
}

impl std::fmt::Debug for QueueItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueItem")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("incomplete", &self.incomplete)
            .field("part", &self.part)
            .field("parts", &self.parts)
            .field("nicks", &self.nicks)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("priority", &self.priority)
            .field("name", &self.name)
            .field("size", &self.size)
            .field("location", &self.location)
            .field("active", &self.active)
            .field("considered", &self.considered)
            .finish()
    }
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.kind == other.kind
            && self.incomplete == other.incomplete
            && self.part == other.part
            && self.parts == other.parts
            && self.nicks == other.nicks
            && self.offset == other.offset
            && self.length == other.length
            && self.priority == other.priority
            && self.name == other.name
            && self.size == other.size
            && self.location == other.location
            && self.active == other.active
            && self.considered == other.considered
    }
}

impl QueueItem {
    fn matches(&self, other: &QueueItem) -> bool {
        self.id == other.id && self.incomplete == other.incomplete && self.part == other.part
    }

    /// Runs the success callback, never letting a panic escape.
    pub(crate) fn fire_success(&self, path: &Path) {
        if let Some(callback) = &self.on_success {
            let callback = callback.clone();
            if catch_unwind(AssertUnwindSafe(|| callback(path))).is_err() {
                log::warn!("Success callback panicked for {:?}", self);
            }
        }
    }

    /// Runs the failure callback, never letting a panic escape.
    pub(crate) fn fire_failure(&self) {
        if let Some(callback) = &self.on_failure {
            let callback = callback.clone();
            if catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
                log::warn!("Failure callback panicked for {:?}", self);
            }
        }
    }
}

/// The parameters `rebuild` and `transfer_filename` need from the engine.
#[derive(Clone, Debug)]
pub(crate) struct RebuildCtx {
    pub layout: Layout,
    pub segment_size: u64,
    pub overwrite: bool,
    pub filelist_name: String,
}

/// The transfer queue plus the download-slot counter it guards.
pub(crate) struct DownloadQueue {
    inner: Mutex<QueueInner>,
}

#[derive(Default)]
struct QueueInner {
    items: Vec<QueueItem>,
    downslots: usize,
}

impl DownloadQueue {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<QueueItem> {
        self.inner.lock().unwrap().items.clone()
    }

    pub(crate) fn downslots(&self) -> usize {
        self.inner.lock().unwrap().downslots
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    /// Enqueues a file-list pull from a peer. Duplicate pulls for the same
    /// peer are dropped.
    pub(crate) fn push_filelist(
        &self,
        nick: &str,
        filelist_name: &str,
        filelists_dir: PathBuf,
        on_success: Option<SuccessCallback>,
        on_failure: Option<FailureCallback>,
    ) -> bool {
        let escaped = crate::proto::escape_filename(nick);
        let item = QueueItem {
            id: filelist_name.to_owned(),
            kind: ItemKind::File,
            incomplete: format!("{}.filelist", escaped),
            part: Some(0),
            parts: Some(1),
            nicks: vec![nick.to_owned()],
            offset: 0,
            length: -1,
            priority: 5,
            name: Some(format!("@{}.xml.bz2", escaped)),
            size: -1,
            location: Some(filelists_dir),
            active: false,
            considered: false,
            on_success,
            on_failure,
        };
        let mut inner = self.inner.lock().unwrap();
        if inner.items.iter().any(|existing| existing.matches(&item)) {
            return false;
        }
        inner.items.push(item);
        true
    }

    /// Enqueues an unexpanded TTH item. A root already queued in any form is
    /// dropped.
    pub(crate) fn push_tth(
        &self,
        tth: &str,
        name: Option<String>,
        location: Option<PathBuf>,
        on_success: Option<SuccessCallback>,
        on_failure: Option<FailureCallback>,
    ) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.items.iter().any(|existing| existing.id == tth) {
            return false;
        }
        inner.items.push(QueueItem {
            id: tth.to_owned(),
            kind: ItemKind::Tth,
            incomplete: tth.to_owned(),
            part: None,
            parts: None,
            nicks: Vec::new(),
            offset: 0,
            length: -1,
            priority: 3,
            name,
            size: -1,
            location,
            active: false,
            considered: false,
            on_success,
            on_failure,
        });
        true
    }

    pub(crate) fn set_considered(&self, item: &QueueItem, considered: bool) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.items.iter_mut().find(|entry| entry.matches(item)) {
            entry.considered = considered;
        }
    }

    /// Returns a borrowed item: clears its active flag and releases its
    /// download slot.
    pub(crate) fn release(&self, item: &QueueItem) {
        let mut inner = self.inner.lock().unwrap();
        let mut released = false;
        if let Some(entry) = inner.items.iter_mut().find(|entry| entry.matches(item)) {
            if entry.active {
                entry.active = false;
                entry.considered = false;
                released = true;
            }
        }
        if released {
            inner.downslots = inner.downslots.saturating_sub(1);
        }
    }

    /// Removes an item from the queue, releasing its download slot if a
    /// session owned it. Returns whether an entry was removed.
    pub(crate) fn remove(&self, item: &QueueItem) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.items.iter().position(|entry| entry.matches(item)) {
            Some(pos) => {
                let removed = inner.items.remove(pos);
                if removed.active {
                    inner.downslots = inner.downslots.saturating_sub(1);
                }
                true
            }
            None => false,
        }
    }

    /// Replaces the queue contents from a persisted snapshot.
    pub(crate) fn restore(&self, items: Vec<QueueItem>) {
        let mut inner = self.inner.lock().unwrap();
        inner.items = items;
        inner.downslots = 0;
    }

    /// Removes the unexpanded entry for a TTH root, returning it.
    pub(crate) fn remove_unexpanded(&self, id: &str) -> Option<QueueItem> {
        let mut inner = self.inner.lock().unwrap();
        let pos = inner
            .items
            .iter()
            .position(|entry| entry.id == id && entry.parts.is_none())?;
        Some(inner.items.remove(pos))
    }

    /// Expands an unexpanded TTH item into per-segment entries now that the
    /// artifact's size and sources are known.
    pub(crate) fn expand_tth(
        &self,
        id: &str,
        name: String,
        size: u64,
        source_nicks: Vec<String>,
        segment_size: u64,
    ) -> usize {
        let parts = part_count(size, segment_size);
        debug_assert!(parts > 0);
        let mut inner = self.inner.lock().unwrap();
        let pos = match inner
            .items
            .iter()
            .position(|entry| entry.id == id && entry.parts.is_none())
        {
            Some(pos) => pos,
            None => return 0,
        };
        let mut template = inner.items.remove(pos);
        if template.name.is_none() {
            template.name = Some(name);
        }
        template.size = size as i64;
        template.parts = Some(parts);
        template.considered = false;
        for nick in source_nicks {
            if !template.nicks.contains(&nick) {
                template.nicks.push(nick);
            }
        }
        let mut added = 0;
        for part in 0..parts {
            let mut segment = template.clone();
            segment.part = Some(part);
            segment.offset = part as u64 * segment_size;
            segment.length = part_len(size, segment_size, part) as i64;
            if !inner.items.iter().any(|entry| entry.matches(&segment)) {
                inner.items.push(segment);
                added += 1;
            }
        }
        log::debug!("Expanded {} into {} segment entries", id, added);
        added
    }

    /// Checks whether it is safe to start downloading this item: its part
    /// file must be absent or shorter than the wanted length. An item found
    /// already complete is dropped from the queue and `false` is returned so
    /// the caller can attempt a rebuild.
    pub(crate) fn verify(&self, item: &QueueItem, layout: &Layout) -> bool {
        let mut inner = self.inner.lock().unwrap();
        Self::verify_locked(&mut inner, item, layout)
    }

    fn verify_locked(inner: &mut QueueInner, item: &QueueItem, layout: &Layout) -> bool {
        let part = match item.part {
            Some(part) => part,
            None => return false,
        };
        if !item.active {
            let safe = match fs::metadata(layout.part_path(&item.incomplete, part)) {
                Err(_) => true,
                Ok(meta) => item.length >= 0 && (meta.len() as i64) < item.length,
            };
            if safe {
                return true;
            }
        }
        // already fully on disk; drop the queue entry so rebuilding can run
        if let Some(pos) = inner.items.iter().position(|entry| entry.matches(item)) {
            if !inner.items[pos].active {
                inner.items.remove(pos);
            }
        }
        false
    }

    /// Selects the next item this peer can serve: inactive entries listing
    /// the nick, in ascending priority order. The returned item is marked
    /// active and a download slot is taken, all under the queue lock.
    ///
    /// Entries that turned out to be fully downloaded are dropped from the
    /// queue and handed back in the second tuple element; the caller should
    /// rebuild them after the lock is gone.
    pub(crate) fn transfer_next(
        &self,
        nick: &str,
        layout: &Layout,
    ) -> (Option<QueueItem>, Vec<QueueItem>) {
        let mut inner = self.inner.lock().unwrap();
        let mut candidates: Vec<QueueItem> = inner
            .items
            .iter()
            .filter(|entry| {
                !entry.active && entry.part.is_some() && entry.nicks.iter().any(|n| n == nick)
            })
            .cloned()
            .collect();
        candidates.sort_by_key(|entry| entry.priority);

        let mut rebuild = Vec::new();
        for candidate in candidates {
            if Self::verify_locked(&mut inner, &candidate, layout) {
                if let Some(entry) = inner.items.iter_mut().find(|entry| entry.matches(&candidate))
                {
                    entry.active = true;
                    entry.considered = true;
                    let result = entry.clone();
                    inner.downslots += 1;
                    return (Some(result), rebuild);
                }
            } else {
                rebuild.push(candidate);
            }
        }
        (None, rebuild)
    }

    /// Reassembles a finished artifact from its parts.
    ///
    /// Does nothing while other segments of the same artifact are still
    /// queued. Parts that are missing or of the wrong size are re-enqueued
    /// as repair downloads instead. On success the destination path is
    /// returned, every part file is deleted, and a downloaded file list is
    /// decompressed in place.
    ///
    /// This performs sync IO and should be called from a blocking context.
    pub(crate) fn rebuild(&self, item: &QueueItem, ctx: &RebuildCtx) -> Option<PathBuf> {
        let parts = item.parts?;
        {
            let inner = self.inner.lock().unwrap();
            let more = inner.items.iter().any(|entry| {
                entry.incomplete == item.incomplete && entry.name == item.name
            });
            if more {
                return None;
            }
        }

        let mut all = true;
        if item.kind != ItemKind::File {
            // file lists are always a single part; everything else is audited
            let size = if item.size >= 0 { item.size as u64 } else { 0 };
            for part in 0..parts {
                let expected = part_len(size, ctx.segment_size, part) as i64;
                let path = ctx.layout.part_path(&item.incomplete, part);
                let mut found = match fs::metadata(&path) {
                    Ok(meta) => meta.len() as i64,
                    Err(_) => -1,
                };
                if found == expected {
                    continue;
                }
                all = false;
                if found > expected {
                    // an overlong part is useless; refetch it from scratch
                    let _ = fs::remove_file(&path);
                    found = 0;
                }
                let downloaded = found.max(0) as u64;
                let mut repair = item.clone();
                repair.part = Some(part);
                repair.offset = part as u64 * ctx.segment_size + downloaded;
                repair.length = expected - downloaded as i64;
                repair.active = false;
                repair.considered = false;
                let mut inner = self.inner.lock().unwrap();
                if !inner.items.iter().any(|entry| entry.matches(&repair)) {
                    log::debug!("Re-enqueueing part {} of {}", part, item.incomplete);
                    inner.items.push(repair);
                }
            }
        }
        if !all {
            return None;
        }

        let filename = transfer_filename(item, ctx);
        if let Err(e) = concat_parts(item, parts, ctx, &filename) {
            log::warn!("Failed to assemble {:?}: {}", filename, e);
            return None;
        }
        for part in 0..parts {
            remove_with_retry(&ctx.layout.part_path(&item.incomplete, part));
        }
        let assembled = fs::metadata(&filename).map(|meta| meta.len()).unwrap_or(0);
        log::info!(
            "Download complete: {:?} (FileSize: {})",
            filename,
            crate::proto::human_size(assembled)
        );

        let is_filelist = item.id == ctx.filelist_name
            && item.location.as_deref() == Some(ctx.layout.filelists.as_path());
        if is_filelist {
            match crate::filelist::bz2_decompress(&filename) {
                Ok(_) => {
                    let _ = fs::remove_file(&filename);
                }
                Err(e) => log::warn!("Failed to decompress filelist {:?}: {}", filename, e),
            }
        }
        Some(filename)
    }
}

fn concat_parts(
    item: &QueueItem,
    parts: usize,
    ctx: &RebuildCtx,
    filename: &Path,
) -> std::io::Result<()> {
    let mut dest = File::create(filename)?;
    let mut block = vec![0u8; REBUILD_BLOCK_LEN];
    for part in 0..parts {
        let mut src = File::open(ctx.layout.part_path(&item.incomplete, part))?;
        loop {
            let n = src.read(&mut block)?;
            if n == 0 {
                break;
            }
            dest.write_all(&block[..n])?;
        }
    }
    Ok(())
}

/// Deletes a part file, waiting out transient file-busy errors.
fn remove_with_retry(path: &Path) {
    for _ in 0..REMOVE_RETRIES {
        match fs::remove_file(path) {
            Ok(()) => return,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(_) => std::thread::sleep(Duration::from_secs(1)),
        }
    }
    log::warn!("Could not remove part file {:?}", path);
}

/// Picks the destination path of a finished artifact: the item's location if
/// it is an accessible directory, the downloads directory otherwise. Unless
/// overwriting is allowed, a ` (N)` suffix is appended until the name is
/// free.
pub(crate) fn transfer_filename(item: &QueueItem, ctx: &RebuildCtx) -> PathBuf {
    let location = match &item.location {
        Some(location) if location.is_dir() => location.clone(),
        _ => ctx.layout.downloads.clone(),
    };
    let name = item.name.clone().unwrap_or_else(|| item.incomplete.clone());
    let (stem, extension) = match name.rfind('.') {
        Some(pos) => (name[..pos].to_owned(), name[pos..].to_owned()),
        None => (name, String::new()),
    };
    let mut filename = location.join(format!("{}{}", stem, extension));
    if !ctx.overwrite {
        let mut suffix = 0;
        while filename.is_file() {
            suffix += 1;
            filename = location.join(format!("{} ({}){}", stem, suffix, extension));
        }
    }
    filename
}

/// The counter of upload slots currently in use.
pub(crate) struct UploadSlots {
    inner: Mutex<usize>,
}

impl UploadSlots {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(0),
        }
    }

    /// Takes a slot unless the cap is reached.
    pub(crate) fn try_acquire(&self, max: usize) -> bool {
        let mut used = self.inner.lock().unwrap();
        if *used >= max {
            return false;
        }
        *used += 1;
        true
    }

    /// Takes a slot unconditionally; the caller already checked the cap.
    pub(crate) fn acquire(&self) {
        *self.inner.lock().unwrap() += 1;
    }

    pub(crate) fn release(&self) {
        let mut used = self.inner.lock().unwrap();
        *used = used.saturating_sub(1);
    }

    pub(crate) fn current(&self) -> usize {
        *self.inner.lock().unwrap()
    }
}

/// The download manager loop: dispatches queued items to peer connects at a
/// fixed cadence, expanding TTH items via auto searches along the way.
pub(crate) async fn run(shared: Arc<Shared>) {
    log::info!("Starting download manager");
    while shared.download_active.load(Ordering::SeqCst) {
        let mut searched = false;
        let (download_time, searchtime_auto, segment_size, maxdownslots) = {
            let config = shared.config.read().unwrap();
            (
                config.download_time,
                config.searchtime_auto,
                config.segment_size,
                config.maxdownslots,
            )
        };

        for item in shared.queue.snapshot() {
            if !shared.download_active.load(Ordering::SeqCst) {
                searched = true;
                break;
            }
            if shared.queue.downslots() >= maxdownslots {
                break;
            }
            if item.active || item.considered {
                continue;
            }
            match item.kind {
                ItemKind::File => {
                    let nick = match item.nicks.first() {
                        Some(nick) => nick.clone(),
                        None => continue,
                    };
                    shared.queue.set_considered(&item, true);
                    let fail_shared = shared.clone();
                    let fail_item = item.clone();
                    let on_fail: peer::FailAction = Box::new(move || {
                        log::debug!(
                            "Removing filelist of {:?} from queue: peer not responding",
                            fail_item.nicks
                        );
                        fail_shared.queue.set_considered(&fail_item, false);
                        fail_shared.queue.remove(&fail_item);
                        fail_item.fire_failure();
                    });
                    // file lists have a single candidate; wait the connect out
                    peer::connect_remote(shared.clone(), nick, true, Some(on_fail)).await;
                }
                ItemKind::Tth if item.parts.is_none() => {
                    searched = true;
                    let results: Arc<Mutex<Vec<SearchRow>>> = Arc::new(Mutex::new(Vec::new()));
                    let sink_results = results.clone();
                    let sink: ResultSink = Arc::new(move |row| {
                        if matches!(row, SearchRow::File { .. }) {
                            sink_results.lock().unwrap().push(row);
                        }
                    });
                    let pattern = format!("TTH:{}", item.id);
                    let options = SearchOptions {
                        file_type: Some(FileType::Tth),
                        mode: SearchMode::Auto,
                        ..SearchOptions::default()
                    };
                    if let Err(e) = search::search(&shared, &pattern, sink, options).await {
                        log::warn!("Source search for {} failed: {}", item.id, e);
                        continue;
                    }
                    // assume results arrive within the auto search budget
                    sleep(Duration::from_secs(searchtime_auto)).await;
                    let rows: Vec<SearchRow> = results.lock().unwrap().drain(..).collect();
                    if rows.is_empty() {
                        continue;
                    }

                    let mut size = 0u64;
                    let mut first_name = None;
                    let mut nicks = Vec::new();
                    for (index, row) in rows.iter().enumerate() {
                        if let SearchRow::File {
                            nick, path, size: row_size, ..
                        } = row
                        {
                            if index == 0 {
                                size = *row_size;
                                first_name = path
                                    .replace('\\', "/")
                                    .rsplit('/')
                                    .next()
                                    .map(str::to_owned);
                            }
                            if !nicks.contains(nick) {
                                nicks.push(nick.clone());
                            }
                        }
                    }
                    let name = item
                        .name
                        .clone()
                        .or(first_name)
                        .unwrap_or_else(|| item.id.clone());

                    if size == 0 {
                        // nothing to transfer; write the empty file right away
                        if let Some(done) = shared.queue.remove_unexpanded(&item.id) {
                            let ctx = RebuildCtx::from_shared(&shared);
                            let mut done = done;
                            done.name = Some(name);
                            done.size = 0;
                            let filename = transfer_filename(&done, &ctx);
                            match File::create(&filename) {
                                Ok(_) => done.fire_success(&filename),
                                Err(e) => {
                                    log::warn!("Failed to create {:?}: {}", filename, e)
                                }
                            }
                        }
                        continue;
                    }
                    shared
                        .queue
                        .expand_tth(&item.id, name, size, nicks, segment_size);
                }
                ItemKind::Tth => {
                    if !shared.queue.verify(&item, &shared.layout) {
                        // the segment is already on disk; try assembling
                        let rebuild_shared = shared.clone();
                        let rebuild_item = item.clone();
                        let _ = task::spawn_blocking(move || {
                            let ctx = RebuildCtx::from_shared(&rebuild_shared);
                            rebuild_shared.queue.rebuild(&rebuild_item, &ctx);
                        })
                        .await;
                        continue;
                    }
                    let connected = shared.transfers.nicks();
                    let candidates: Vec<String> = item
                        .nicks
                        .iter()
                        .filter(|nick| !connected.contains(*nick) && shared.roster.contains(nick))
                        .cloned()
                        .collect();
                    let nick = {
                        let mut rng = rand::thread_rng();
                        match candidates.choose(&mut rng) {
                            Some(nick) => nick.clone(),
                            None => continue,
                        }
                    };
                    shared.queue.set_considered(&item, true);
                    let fail_shared = shared.clone();
                    let fail_item = item.clone();
                    let on_fail: peer::FailAction = Box::new(move || {
                        fail_shared.queue.set_considered(&fail_item, false);
                    });
                    tokio::spawn(peer::connect_remote(
                        shared.clone(),
                        nick,
                        true,
                        Some(on_fail),
                    ));
                }
            }
        }
        if !searched {
            sleep(Duration::from_secs(download_time)).await;
        }
    }
    log::info!("Download manager stopped");
}

impl RebuildCtx {
    pub(crate) fn from_shared(shared: &Shared) -> Self {
        let config = shared.config.read().unwrap();
        Self {
            layout: shared.layout.clone(),
            segment_size: config.segment_size,
            overwrite: config.overwrite,
            filelist_name: config.filelist_name.clone(),
        }
    }
}
