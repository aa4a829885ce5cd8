//! Read-only namespace over resolved objects.
//!
//! The tree is fixed except for the leaves:
//!
//! ```text
//! /
//! ├── files/            name -> resolve("/<name>")
//! ├── by-date/
//! │   └── YYYY-MM-DD/   name -> resolve_in_partition("/<name>", date)
//! └── README-LIMITED
//! ```
//!
//! Nothing is enumerated. Date directories and file nodes are created on
//! lookup and dropped once the kernel forgets them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use chrono::NaiveDate;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::inflight::InFlight;
use crate::cadapter::RangeBackend;
use crate::error::{ObjfsError, Result};
use crate::meta::{ObjectRecord, Resolver};
use crate::range::{RangeLayout, RangeReader};
use crate::util::with_deadline;

pub const ROOT_INO: u64 = 1;
pub const FILES_INO: u64 = 2;
pub const BY_DATE_INO: u64 = 3;
pub const README_INO: u64 = 4;
const FIRST_DYNAMIC_INO: u64 = 16;

pub const FILES_DIR: &str = "files";
pub const BY_DATE_DIR: &str = "by-date";
pub const README_NAME: &str = "README-LIMITED";
pub const README_TEXT: &str = "\
Directory listings on this mount are intentionally incomplete.\n\
Objects are reachable by name only:\n\
\n\
    files/<name>                 latest version\n\
    by-date/<YYYY-MM-DD>/<name>  version ingested on that date\n";

pub const FILE_PERM: u16 = 0o444;
pub const DIR_PERM: u16 = 0o555;

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    Dir,
    File,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileAttr {
    pub ino: u64,
    pub size: u64,
    pub kind: FileType,
    pub perm: u16,
    pub mtime: SystemTime,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: u64,
    pub name: String,
    pub kind: FileType,
}

enum Node {
    Root,
    Files,
    ByDate,
    Readme,
    DateDir {
        date: NaiveDate,
        lookups: u64,
    },
    File {
        parent: u64,
        name: String,
        record: ObjectRecord,
        lookups: u64,
    },
}

impl Node {
    fn kind(&self) -> FileType {
        match self {
            Node::Readme | Node::File { .. } => FileType::File,
            _ => FileType::Dir,
        }
    }

    fn parent(&self) -> u64 {
        match self {
            Node::DateDir { .. } => BY_DATE_INO,
            Node::File { parent, .. } => *parent,
            _ => ROOT_INO,
        }
    }
}

/// Where a lookup lands, copied out of the table so no lock is held while
/// resolving.
enum Scope {
    Root,
    Files,
    ByDate,
    Date(NaiveDate),
}

struct InodeTable {
    nodes: HashMap<u64, Node>,
    // (parent, name) -> ino, dynamic nodes only.
    children: HashMap<(u64, String), u64>,
    next_ino: u64,
}

impl InodeTable {
    fn new() -> Self {
        let nodes = HashMap::from([
            (ROOT_INO, Node::Root),
            (FILES_INO, Node::Files),
            (BY_DATE_INO, Node::ByDate),
            (README_INO, Node::Readme),
        ]);
        Self {
            nodes,
            children: HashMap::new(),
            next_ino: FIRST_DYNAMIC_INO,
        }
    }

    fn alloc(&mut self, parent: u64, name: &str, node: Node) -> u64 {
        let ino = self.next_ino;
        self.next_ino += 1;
        self.nodes.insert(ino, node);
        self.children.insert((parent, name.to_string()), ino);
        ino
    }

    fn date_dir(&mut self, date: NaiveDate, name: &str) -> u64 {
        let existing = self.children.get(&(BY_DATE_INO, name.to_string())).copied();
        if let Some(ino) = existing {
            if let Some(Node::DateDir { lookups, .. }) = self.nodes.get_mut(&ino) {
                *lookups += 1;
                return ino;
            }
        }
        self.alloc(BY_DATE_INO, name, Node::DateDir { date, lookups: 1 })
    }

    /// Reuses the node for `(parent, name)` and refreshes its record.
    fn file(&mut self, parent: u64, name: &str, record: ObjectRecord) -> u64 {
        let existing = self.children.get(&(parent, name.to_string())).copied();
        if let Some(ino) = existing {
            if let Some(Node::File {
                record: current,
                lookups,
                ..
            }) = self.nodes.get_mut(&ino)
            {
                *current = record;
                *lookups += 1;
                return ino;
            }
        }
        self.alloc(
            parent,
            name,
            Node::File {
                parent,
                name: name.to_string(),
                record,
                lookups: 1,
            },
        )
    }

    fn forget(&mut self, ino: u64, nlookup: u64) {
        let (parent, name) = match self.nodes.get_mut(&ino) {
            Some(Node::File {
                parent,
                name,
                lookups,
                ..
            }) => {
                *lookups = lookups.saturating_sub(nlookup);
                if *lookups > 0 {
                    return;
                }
                (*parent, name.clone())
            }
            Some(Node::DateDir { date, lookups }) => {
                *lookups = lookups.saturating_sub(nlookup);
                if *lookups > 0 {
                    return;
                }
                (BY_DATE_INO, date.format(DATE_FORMAT).to_string())
            }
            // Fixed nodes live for the whole mount.
            _ => return,
        };
        self.nodes.remove(&ino);
        if self.children.get(&(parent, name.clone())) == Some(&ino) {
            self.children.remove(&(parent, name));
        }
    }
}

pub struct ObjectFs<B: RangeBackend> {
    resolver: Arc<Resolver>,
    reader: Arc<RangeReader<B>>,
    layout: RangeLayout,
    timeout: Duration,
    mounted_at: SystemTime,
    inodes: Mutex<InodeTable>,
    inflight: InFlight,
}

impl<B: RangeBackend> ObjectFs<B> {
    /// `timeout` bounds each lookup and each read, permit waits included.
    pub fn new(
        resolver: Arc<Resolver>,
        reader: Arc<RangeReader<B>>,
        layout: RangeLayout,
        timeout: Duration,
    ) -> Self {
        Self {
            resolver,
            reader,
            layout,
            timeout,
            mounted_at: SystemTime::now(),
            inodes: Mutex::new(InodeTable::new()),
            inflight: InFlight::new(),
        }
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    pub fn reader(&self) -> &Arc<RangeReader<B>> {
        &self.reader
    }

    pub fn layout(&self) -> RangeLayout {
        self.layout
    }

    pub fn inflight(&self) -> &InFlight {
        &self.inflight
    }

    fn table(&self) -> MutexGuard<'_, InodeTable> {
        self.inodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Sync wrappers keep the guard out of async frames.
    fn table_date_dir(&self, date: NaiveDate, name: &str) -> u64 {
        self.table().date_dir(date, name)
    }

    fn table_file(&self, parent: u64, name: &str, record: ObjectRecord) -> u64 {
        self.table().file(parent, name, record)
    }

    /// Number of live inodes, fixed ones included.
    pub fn inode_count(&self) -> usize {
        self.table().nodes.len()
    }

    fn attr_of(&self, ino: u64, node: &Node) -> FileAttr {
        match node {
            Node::File { record, .. } => FileAttr {
                ino,
                size: record.len(),
                kind: FileType::File,
                perm: FILE_PERM,
                mtime: SystemTime::from(record.last_modified),
            },
            Node::Readme => FileAttr {
                ino,
                size: README_TEXT.len() as u64,
                kind: FileType::File,
                perm: FILE_PERM,
                mtime: self.mounted_at,
            },
            _ => FileAttr {
                ino,
                size: 0,
                kind: FileType::Dir,
                perm: DIR_PERM,
                mtime: self.mounted_at,
            },
        }
    }

    /// Attributes from the inode table; never touches the backend.
    pub fn attr(&self, ino: u64) -> Result<FileAttr> {
        let table = self.table();
        let node = table.nodes.get(&ino).ok_or_else(|| missing(ino))?;
        Ok(self.attr_of(ino, node))
    }

    pub fn parent_of(&self, ino: u64) -> Option<u64> {
        self.table().nodes.get(&ino).map(Node::parent)
    }

    fn scope_of(&self, parent: u64) -> Result<Scope> {
        match self.table().nodes.get(&parent) {
            Some(Node::Root) => Ok(Scope::Root),
            Some(Node::Files) => Ok(Scope::Files),
            Some(Node::ByDate) => Ok(Scope::ByDate),
            Some(Node::DateDir { date, .. }) => Ok(Scope::Date(*date)),
            Some(_) => Err(ObjfsError::NotADirectory(parent)),
            None => Err(missing(parent)),
        }
    }

    /// Resolves `name` under `parent`. Each successful lookup of a dynamic
    /// node adds one kernel reference, released by [`Self::forget_inode`].
    pub async fn lookup_child(
        &self,
        parent: u64,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<FileAttr> {
        let scope = self.scope_of(parent)?;
        if name == README_NAME {
            return self.attr(README_INO);
        }

        let ino = match scope {
            Scope::Root => match name {
                FILES_DIR => FILES_INO,
                BY_DATE_DIR => BY_DATE_INO,
                _ => return Err(ObjfsError::NotFound(format!("/{name}"))),
            },
            Scope::ByDate => {
                let date = parse_partition(name)
                    .ok_or_else(|| ObjfsError::NotFound(format!("/{BY_DATE_DIR}/{name}")))?;
                self.table_date_dir(date, name)
            }
            Scope::Files => {
                let path = format!("/{name}");
                let record = self
                    .resolve_logged(&path, cancel, self.resolver.resolve(&path, cancel))
                    .await?;
                self.table_file(parent, name, record)
            }
            Scope::Date(date) => {
                let path = format!("/{name}");
                let record = self
                    .resolve_logged(
                        &path,
                        cancel,
                        self.resolver.resolve_in_partition(&path, date, cancel),
                    )
                    .await?;
                self.table_file(parent, name, record)
            }
        };
        self.attr(ino)
    }

    async fn resolve_logged<F>(&self, path: &str, cancel: &CancellationToken, fut: F) -> Result<ObjectRecord>
    where
        F: Future<Output = Result<ObjectRecord>>,
    {
        match with_deadline(cancel, self.timeout, fut).await {
            Ok(record) => Ok(record),
            Err(e) if e.is_not_found() => {
                debug!(path, "lookup miss");
                Err(e)
            }
            Err(e) => {
                warn!(path, error = %e, "lookup failed");
                Err(e)
            }
        }
    }

    /// `.`, `..`, the fixed children of the root and the sentinel. Resolved
    /// objects are never listed.
    pub fn list_dir(&self, ino: u64) -> Result<Vec<DirEntry>> {
        let table = self.table();
        let node = table.nodes.get(&ino).ok_or_else(|| missing(ino))?;
        if node.kind() != FileType::Dir {
            return Err(ObjfsError::NotADirectory(ino));
        }
        let entry = |ino: u64, name: &str, kind: FileType| DirEntry {
            ino,
            name: name.to_string(),
            kind,
        };
        let mut out = vec![
            entry(ino, ".", FileType::Dir),
            entry(node.parent(), "..", FileType::Dir),
        ];
        if matches!(node, Node::Root) {
            out.push(entry(FILES_INO, FILES_DIR, FileType::Dir));
            out.push(entry(BY_DATE_INO, BY_DATE_DIR, FileType::Dir));
        }
        out.push(entry(README_INO, README_NAME, FileType::File));
        Ok(out)
    }

    pub fn open_file(&self, ino: u64) -> Result<FileAttr> {
        let attr = self.attr(ino)?;
        match attr.kind {
            FileType::File => Ok(attr),
            FileType::Dir => Err(ObjfsError::IsADirectory(ino)),
        }
    }

    pub fn open_dir(&self, ino: u64) -> Result<FileAttr> {
        let attr = self.attr(ino)?;
        match attr.kind {
            FileType::Dir => Ok(attr),
            FileType::File => Err(ObjfsError::NotADirectory(ino)),
        }
    }

    /// `None` for the sentinel, which is served from memory.
    fn record_of(&self, ino: u64) -> Result<Option<ObjectRecord>> {
        match self.table().nodes.get(&ino) {
            Some(Node::File { record, .. }) => Ok(Some(record.clone())),
            Some(Node::Readme) => Ok(None),
            Some(_) => Err(ObjfsError::IsADirectory(ino)),
            None => Err(missing(ino)),
        }
    }

    /// Reads `size` bytes at `offset`.
    ///
    /// The backend is asked for the aligned range covering the window and
    /// the reply is cut back to exactly `[offset, offset + len)`, with `len`
    /// clamped to the object size. Zero-sized reads and reads at or past the
    /// end return no bytes without a fetch.
    pub async fn read_file(
        &self,
        ino: u64,
        offset: u64,
        size: u32,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        let Some(record) = self.record_of(ino)? else {
            let text = Bytes::from_static(README_TEXT.as_bytes());
            return Ok(slice_window(text, offset, u64::from(size)));
        };

        let object_size = record.len();
        if size == 0 || offset >= object_size {
            return Ok(Bytes::new());
        }
        let len = u64::from(size).min(object_size - offset);
        // One fetch never spans more than a prefetch window from the block
        // holding `offset`. A read crossing the end of that window comes back
        // short and the caller reads again for the rest.
        let (start, end) = self.layout.align(offset, len);
        let body = with_deadline(
            cancel,
            self.timeout,
            self.reader
                .get_range(&record.bucket, &record.key, start, end, cancel),
        )
        .await
        .inspect_err(|e| {
            warn!(path = %record.virtual_path, offset, size, error = %e, "read failed");
        })?;
        debug!(path = %record.virtual_path, offset, len, start, end, "read");
        Ok(slice_window(body, offset - start, len))
    }

    /// Drops `nlookup` kernel references; the node goes away at zero.
    pub fn forget_inode(&self, ino: u64, nlookup: u64) {
        self.table().forget(ino, nlookup);
    }
}

fn missing(ino: u64) -> ObjfsError {
    ObjfsError::NotFound(format!("inode {ino}"))
}

/// Date directory names must be canonical `YYYY-MM-DD`.
fn parse_partition(name: &str) -> Option<NaiveDate> {
    let date = NaiveDate::parse_from_str(name, DATE_FORMAT).ok()?;
    (date.format(DATE_FORMAT).to_string() == name).then_some(date)
}

/// `[shift, shift + len)` of `buf`, cut at its end. A window starting past
/// the end is empty.
fn slice_window(buf: Bytes, shift: u64, len: u64) -> Bytes {
    let Ok(shift) = usize::try_from(shift) else {
        return Bytes::new();
    };
    if shift >= buf.len() {
        return Bytes::new();
    }
    let len = usize::try_from(len).unwrap_or(usize::MAX);
    let stop = shift.saturating_add(len).min(buf.len());
    buf.slice(shift..stop)
}
