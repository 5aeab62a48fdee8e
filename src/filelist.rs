//! The per-group shared-file store.
//!
//! Each group owns an independent `FileListing` tree describing what that
//! group is allowed to download from us. Generation reconciles the tree
//! against the group's share roots: directories are reused by name and files
//! by their `(name, size)` tuple, so a file is only re-hashed when it
//! actually changed. Entries whose filesystem counterpart has gone missing
//! are left alone, which lets removable storage come and go without
//! triggering a rehash. The serialized document is written to
//! `Filelists/#<group>.xml` together with its bzip2-compressed counterpart,
//! which is what peers actually download.

use std::{
    collections::HashMap,
    fs::{self, File},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    sync::Mutex,
    time::SystemTime,
};

use bzip2::{read::BzDecoder, write::BzEncoder, Compression};
use lru::LruCache;

use crate::{
    conf::Layout,
    error::{Error, Result},
    tth,
};

/// How many `(path, size, mtime)` to root mappings are kept in memory.
const TTH_CACHE_LEN: usize = 4096;

/// Size of the copy buffer used when (de)compressing artifacts.
const BZ2_BLOCK_LEN: usize = 100 * 1024;

/// One entry of a group's shared tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) enum Node {
    Directory { name: String, children: Vec<Node> },
    File { name: String, size: u64, tth: String },
}

/// A group's shared tree; the children of the `FileListing` element.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct Listing {
    pub children: Vec<Node>,
}

/// Everything the store knows about one group's share.
#[derive(Clone, Debug, Default)]
struct GroupShare {
    roots: Vec<PathBuf>,
    listing: Listing,
}

/// The registry of per-group shares.
pub(crate) struct FilelistStore {
    inner: Mutex<HashMap<String, GroupShare>>,
}

impl FilelistStore {
    pub(crate) fn new(base_group: &str) -> Self {
        let mut shares = HashMap::new();
        shares.insert(base_group.to_owned(), GroupShare::default());
        Self {
            inner: Mutex::new(shares),
        }
    }

    pub(crate) fn ensure_group(&self, group: &str) {
        self.inner
            .lock()
            .unwrap()
            .entry(group.to_owned())
            .or_default();
    }

    pub(crate) fn remove_group(&self, group: &str) {
        self.inner.lock().unwrap().remove(group);
    }

    pub(crate) fn rename_group(&self, group: &str, newname: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(share) = inner.remove(group) {
            inner.insert(newname.to_owned(), share);
        }
    }

    /// Adds a share root to a group. The path must exist at call time.
    pub(crate) fn add_root(&self, group: &str, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        if !path.exists() {
            return Err(Error::InvalidValue("path"));
        }
        let mut inner = self.inner.lock().unwrap();
        let share = inner
            .get_mut(group)
            .ok_or_else(|| Error::UnknownGroup(group.into()))?;
        if !share.roots.contains(&path) {
            share.roots.push(path);
        }
        Ok(())
    }

    /// Removes a share root from a group. Unknown roots are ignored.
    pub(crate) fn remove_root(&self, group: &str, path: impl AsRef<Path>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let share = inner
            .get_mut(group)
            .ok_or_else(|| Error::UnknownGroup(group.into()))?;
        share.roots.retain(|root| root != path.as_ref());
        Ok(())
    }

    /// A persistable copy of every group's share roots.
    pub(crate) fn roots_snapshot(&self) -> HashMap<String, Vec<PathBuf>> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .map(|(group, share)| (group.clone(), share.roots.clone()))
            .collect()
    }

    /// Replaces all share roots from a persisted snapshot. Trees are emptied;
    /// the caller is expected to regenerate them.
    pub(crate) fn restore_roots(&self, snapshot: HashMap<String, Vec<PathBuf>>, base_group: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.clear();
        inner.insert(base_group.to_owned(), GroupShare::default());
        for (group, roots) in snapshot {
            inner.entry(group).or_default().roots = roots;
        }
    }

    /// A copy of a group's current tree.
    pub(crate) fn listing(&self, group: &str) -> Option<Listing> {
        self.inner
            .lock()
            .unwrap()
            .get(group)
            .map(|share| share.listing.clone())
    }

    /// Regenerates a group's tree from its share roots and writes the
    /// `.xml` and `.xml.bz2` artifacts.
    ///
    /// This hashes any new file contents and is expected to be called from a
    /// blocking context.
    pub(crate) fn generate(
        &self,
        group: &str,
        cid: &str,
        generator: &str,
        layout: &Layout,
        cache: &TthCache,
    ) -> Result<PathBuf> {
        log::debug!("Generating filelist for group {}", group);
        let (roots, mut listing) = {
            let inner = self.inner.lock().unwrap();
            let share = inner
                .get(group)
                .ok_or_else(|| Error::UnknownGroup(group.into()))?;
            (share.roots.clone(), share.listing.clone())
        };

        let mut sorted_roots = roots;
        sorted_roots.sort();
        for root in &sorted_roots {
            merge_path(&mut listing.children, root, cache);
        }

        let target = layout.filelist_xml(group);
        let document = to_xml(&listing, cid, generator);
        fs::write(&target, document)?;
        bz2_compress(&target)?;

        let mut inner = self.inner.lock().unwrap();
        if let Some(share) = inner.get_mut(group) {
            share.listing = listing;
        }
        log::info!("Generated filelist for group {}", group);
        Ok(target)
    }

    /// Finds the tree-relative path of the file with the given TTH in a
    /// group's listing.
    pub(crate) fn find_tth(&self, group: &str, root: &str) -> Option<String> {
        let listing = self.listing(group)?;
        find_tth_in(&listing.children, root, "")
    }

    /// Maps a tree-relative path back to a physical file through the group's
    /// share roots.
    pub(crate) fn resolve_physical(&self, group: &str, relative: &str) -> Option<PathBuf> {
        let roots = {
            let inner = self.inner.lock().unwrap();
            inner.get(group)?.roots.clone()
        };
        for root in roots {
            if root.is_dir() {
                // the tree path repeats the root directory's own name, so
                // resolve against the root's parent
                let base = root.parent().unwrap_or(&root);
                let candidate = base.join(relative);
                if candidate.is_file() {
                    return Some(candidate);
                }
            } else if root.is_file() && root.to_string_lossy().ends_with(relative) {
                // a directly shared file appears in the tree under its own name
                return Some(root);
            }
        }
        None
    }
}

fn find_tth_in(children: &[Node], root: &str, prefix: &str) -> Option<String> {
    for node in children {
        match node {
            Node::File { name, tth, .. } if tth == root => {
                return Some(format!("{}{}", prefix, name));
            }
            Node::Directory { name, children } => {
                let nested = format!("{}{}/", prefix, name);
                if let Some(path) = find_tth_in(children, root, &nested) {
                    return Some(path);
                }
            }
            _ => {}
        }
    }
    None
}

/// Reconciles one share root into a sibling list. Directories insert or
/// reuse a `Directory` child by name; files insert a `File` child only when
/// no child with the same name and size exists yet. Entries that are gone
/// from the filesystem are skipped silently.
fn merge_path(siblings: &mut Vec<Node>, item: &Path, cache: &TthCache) {
    if item.is_dir() {
        let dirname = match item.file_name().and_then(|name| name.to_str()) {
            Some(name) => name.to_owned(),
            None => return,
        };
        let pos = siblings
            .iter()
            .position(|node| matches!(node, Node::Directory { name, .. } if *name == dirname));
        let pos = match pos {
            Some(pos) => pos,
            None => {
                siblings.push(Node::Directory {
                    name: dirname,
                    children: Vec::new(),
                });
                siblings.len() - 1
            }
        };
        let mut entries: Vec<PathBuf> = match fs::read_dir(item) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .collect(),
            Err(_) => return,
        };
        entries.sort();
        if let Node::Directory { children, .. } = &mut siblings[pos] {
            for entry in entries {
                merge_path(children, &entry, cache);
            }
        }
    } else if item.is_file() {
        let filename = match item.file_name().and_then(|name| name.to_str()) {
            Some(name) => name.to_owned(),
            None => return,
        };
        let size = match fs::metadata(item) {
            Ok(meta) => meta.len(),
            Err(_) => return,
        };
        let already_present = siblings.iter().any(
            |node| matches!(node, Node::File { name, size: s, .. } if *name == filename && *s == size),
        );
        if already_present {
            return;
        }
        match cache.root_for(item) {
            Ok(tth) => siblings.push(Node::File {
                name: filename,
                size,
                tth,
            }),
            Err(e) => log::warn!("Failed to hash {:?}: {}", item, e),
        }
    }
    // anything else was accessible once but is not now; leave the tree alone
}

fn escape_xml(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Serializes a listing as the standalone UTF-8 document peers expect.
fn to_xml(listing: &Listing, cid: &str, generator: &str) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\" standalone=\"yes\"?>\n");
    out.push_str(&format!(
        "<FileListing Version=\"1\" CID=\"{}\" Base=\"/\" Generator=\"{}\">\n",
        escape_xml(cid),
        escape_xml(generator)
    ));
    for node in &listing.children {
        write_node(&mut out, node, 1);
    }
    out.push_str("</FileListing>\n");
    out
}

fn write_node(out: &mut String, node: &Node, depth: usize) {
    let indent = "\t".repeat(depth);
    match node {
        Node::Directory { name, children } => {
            if children.is_empty() {
                out.push_str(&format!("{}<Directory Name=\"{}\"/>\n", indent, escape_xml(name)));
            } else {
                out.push_str(&format!("{}<Directory Name=\"{}\">\n", indent, escape_xml(name)));
                for child in children {
                    write_node(out, child, depth + 1);
                }
                out.push_str(&format!("{}</Directory>\n", indent));
            }
        }
        Node::File { name, size, tth } => {
            out.push_str(&format!(
                "{}<File Name=\"{}\" Size=\"{}\" TTH=\"{}\"/>\n",
                indent,
                escape_xml(name),
                size,
                tth
            ));
        }
    }
}

/// The content-addressed TTH cache. Roots are keyed by the file's path,
/// size and modification time, so an unchanged file is never re-hashed.
pub(crate) struct TthCache {
    inner: Mutex<LruCache<(PathBuf, u64, SystemTime), String>>,
}

impl TthCache {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(LruCache::new(TTH_CACHE_LEN)),
        }
    }

    /// Returns the Tiger-Tree root of the file, hashing it only when the
    /// `(path, size, mtime)` key has not been seen before.
    pub(crate) fn root_for(&self, path: &Path) -> Result<String> {
        let meta = fs::metadata(path)?;
        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let key = (path.to_owned(), meta.len(), mtime);
        if let Some(root) = self.inner.lock().unwrap().get(&key) {
            return Ok(root.clone());
        }
        let root = tth::file_root(path)?;
        self.inner.lock().unwrap().put(key, root.clone());
        Ok(root)
    }
}

/// Compresses `src` to `src.bz2`, returning the artifact path.
pub(crate) fn bz2_compress(src: &Path) -> Result<PathBuf> {
    let mut reader = File::open(src)?;
    let target = PathBuf::from(format!("{}.bz2", src.display()));
    let mut encoder = BzEncoder::new(File::create(&target)?, Compression::best());
    copy_blocks(&mut reader, &mut encoder)?;
    encoder.finish()?;
    Ok(target)
}

/// Decompresses a `.bz2` file next to itself, returning the artifact path.
pub(crate) fn bz2_decompress(src: &Path) -> Result<PathBuf> {
    let src_name = src.to_string_lossy();
    if !src_name.ends_with(".bz2") {
        return Err(Error::InvalidValue("bz2 path"));
    }
    let target = PathBuf::from(src_name.trim_end_matches(".bz2").to_owned());
    let mut decoder = BzDecoder::new(File::open(src)?);
    let mut out = File::create(&target)?;
    copy_blocks(&mut decoder, &mut out)?;
    Ok(target)
}

fn copy_blocks(reader: &mut impl Read, writer: &mut impl Write) -> io::Result<()> {
    let mut block = vec![0u8; BZ2_BLOCK_LEN];
    loop {
        let n = reader.read(&mut block)?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&block[..n])?;
    }
}
