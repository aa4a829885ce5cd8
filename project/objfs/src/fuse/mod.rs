//! FUSE adapter and request handling
//!
//! Implements `rfuse3::raw::Filesystem` for [`ObjectFs`], translating kernel
//! requests into VFS calls and VFS errors into errno values.
//!
//! - Every mutating operation replies `EROFS`; so does `open` with write access.
//! - Files are opened with `FOPEN_DIRECT_IO`; reads bypass the page cache.
//! - `lookup` and `read` register a cancellation token under the request's
//!   `unique`; `interrupt` fires it.
pub mod mount;

use crate::cadapter::RangeBackend;
use crate::error::ObjfsError;
use crate::vfs::fs::{FileAttr as VfsFileAttr, FileType as VfsFileType, ObjectFs};
use rfuse3::raw::Request;
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, ReplyAttr, ReplyCreated, ReplyData, ReplyDirectory,
    ReplyDirectoryPlus, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs, ReplyWrite,
};
use rfuse3::{Errno, Result as FuseResult};
use std::ffi::{OsStr, OsString};
use std::num::NonZeroU32;
use std::pin::Pin;
use std::time::Duration;

use futures_util::stream::{self, Stream};
use rfuse3::raw::Filesystem;
use rfuse3::{FileType as FuseFileType, SetAttr, Timestamp};
use tracing::{debug, info};

/// Entry and attribute TTL handed to the kernel.
const TTL: Duration = Duration::from_secs(2);

// From <linux/fuse.h>.
const FOPEN_DIRECT_IO: u32 = 1 << 0;

#[cfg(all(test, target_os = "linux"))]
mod mount_tests {
    use super::*;
    use crate::cache::InMemoryDistributedCache;
    use crate::cadapter::LocalFsBackend;
    use crate::fuse::mount::mount_read_only;
    use crate::meta::{
        InMemoryMetaRepository, MetaRepository, ObjectRecord, ObjectStatus, Resolver,
        ResolverConfig,
    };
    use crate::metrics::Metrics;
    use crate::range::{RangeLayout, RangeReader};
    use chrono::{NaiveDate, Utc};
    use std::fs;
    use std::sync::Arc;

    // Mount smoke test; needs fusermount3, enabled with OBJFS_FUSE_TEST=1.
    #[tokio::test(flavor = "multi_thread")]
    async fn smoke_mount_and_read() {
        if std::env::var("OBJFS_FUSE_TEST").ok().as_deref() != Some("1") {
            eprintln!("skip fuse mount test: set OBJFS_FUSE_TEST=1 to enable");
            return;
        }

        let data = tempfile::tempdir().expect("tmp data");
        fs::create_dir_all(data.path().join("bkt")).expect("bucket dir");
        fs::write(data.path().join("bkt/hello.txt"), b"hello objfs").expect("object");

        let repo = Arc::new(InMemoryMetaRepository::new());
        let record = ObjectRecord {
            virtual_path: "/hello.txt".into(),
            filename: "hello.txt".into(),
            bucket: "bkt".into(),
            key: "hello.txt".into(),
            size: 11,
            etag: "\"e\"".into(),
            last_modified: Utc::now(),
            storage_class: "STANDARD".into(),
            version_id: None,
            checksum_md5: None,
            checksum_sha256: None,
        };
        let today = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        repo.upsert(&record, today, ObjectStatus::Active)
            .await
            .expect("seed");
        let metrics = Arc::new(Metrics::new().expect("metrics"));
        let resolver = Arc::new(Resolver::new(
            repo,
            Arc::new(InMemoryDistributedCache::default()),
            ResolverConfig::default(),
            metrics.clone(),
        ));
        let reader = Arc::new(RangeReader::new(
            LocalFsBackend::new(data.path()),
            8,
            4,
            metrics,
        ));
        let objfs = ObjectFs::new(
            resolver,
            reader,
            RangeLayout::default(),
            Duration::from_secs(5),
        );

        let mnt = tempfile::tempdir().expect("tmp mount");
        let mnt_path = mnt.path().to_path_buf();
        let handle = match mount_read_only(objfs, &mnt_path).await {
            Ok(h) => h,
            Err(e) => {
                eprintln!("skip fuse test: mount failed: {}", e);
                return;
            }
        };
        // Give the kernel time to finish INIT.
        tokio::time::sleep(Duration::from_millis(2000)).await;

        let content = fs::read(mnt_path.join("files/hello.txt")).expect("read");
        assert_eq!(content, b"hello objfs");
        assert!(fs::read(mnt_path.join("files/absent.txt")).is_err());
        assert!(fs::write(mnt_path.join("files/new.txt"), b"x").is_err());

        let list = fs::read_dir(mnt_path.join("files"))
            .expect("readdir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name())
            .collect::<Vec<_>>();
        assert_eq!(list, vec![OsString::from("README-LIMITED")]);

        if let Err(e) = handle.unmount().await {
            eprintln!("unmount error: {}", e);
        }
    }
}

impl<B> Filesystem for ObjectFs<B>
where
    B: RangeBackend + 'static,
{
    type DirEntryStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntry>> + Send + 'a>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntryPlus>> + Send + 'a>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        info!("objfs session initialized");
        // Nothing is ever written; the value only has to be valid.
        let max_write = NonZeroU32::new(128 * 1024).unwrap_or(NonZeroU32::MIN);
        Ok(ReplyInit { max_write })
    }

    async fn destroy(&self, _req: Request) {
        self.inflight().cancel_all();
        info!("objfs session destroyed");
    }

    async fn lookup(&self, req: Request, parent: u64, name: &OsStr) -> FuseResult<ReplyEntry> {
        let Some(name) = name.to_str() else {
            return Err(libc::ENOENT.into());
        };
        let guard = self.inflight().begin(req.unique);
        let attr = self
            .lookup_child(parent, name, guard.token())
            .await
            .map_err(to_errno)?;
        Ok(ReplyEntry {
            ttl: TTL,
            attr: to_fuse_attr(&attr, &req),
            generation: 0,
        })
    }

    async fn forget(&self, _req: Request, inode: u64, nlookup: u64) {
        self.forget_inode(inode, nlookup);
    }

    async fn batch_forget(&self, _req: Request, inodes: &[(u64, u64)]) {
        for &(inode, nlookup) in inodes {
            self.forget_inode(inode, nlookup);
        }
    }

    async fn getattr(
        &self,
        req: Request,
        ino: u64,
        _fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        let attr = self.attr(ino).map_err(to_errno)?;
        Ok(ReplyAttr {
            ttl: TTL,
            attr: to_fuse_attr(&attr, &req),
        })
    }

    async fn setattr(
        &self,
        _req: Request,
        _ino: u64,
        _fh: Option<u64>,
        _set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        Err(libc::EROFS.into())
    }

    async fn open(&self, _req: Request, ino: u64, flags: u32) -> FuseResult<ReplyOpen> {
        let write_flags = (libc::O_WRONLY | libc::O_RDWR | libc::O_TRUNC | libc::O_APPEND) as u32;
        if flags & write_flags != 0 {
            return Err(libc::EROFS.into());
        }
        self.open_file(ino).map_err(to_errno)?;
        Ok(ReplyOpen {
            fh: 0,
            flags: FOPEN_DIRECT_IO,
        })
    }

    async fn opendir(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        self.open_dir(ino).map_err(to_errno)?;
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn read(
        &self,
        req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        let guard = self.inflight().begin(req.unique);
        let data = self
            .read_file(ino, offset, size, guard.token())
            .await
            .map_err(to_errno)?;
        Ok(ReplyData { data })
    }

    async fn write(
        &self,
        _req: Request,
        _ino: u64,
        _fh: u64,
        _offset: u64,
        _data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FuseResult<ReplyWrite> {
        Err(libc::EROFS.into())
    }

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<Self::DirEntryStream<'a>>> {
        let entries = self.list_dir(ino).map_err(to_errno)?;
        // offset is the offset of the last entry already returned.
        let all: Vec<DirectoryEntry> = entries
            .into_iter()
            .enumerate()
            .map(|(i, e)| DirectoryEntry {
                inode: e.ino,
                kind: to_fuse_kind(e.kind),
                name: OsString::from(e.name),
                offset: (i as i64) + 1,
            })
            .collect();
        let start = usize::try_from(offset.max(0)).unwrap_or(usize::MAX);
        let slice: Vec<_> = all.into_iter().skip(start).collect();
        let boxed: Self::DirEntryStream<'a> = Box::pin(stream::iter(slice.into_iter().map(Ok)));
        Ok(ReplyDirectory { entries: boxed })
    }

    async fn readdirplus<'a>(
        &'a self,
        req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> FuseResult<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        let entries = self.list_dir(ino).map_err(to_errno)?;
        let mut all: Vec<DirectoryEntryPlus> = Vec::with_capacity(entries.len());
        for (i, e) in entries.into_iter().enumerate() {
            let Ok(attr) = self.attr(e.ino) else {
                continue;
            };
            all.push(DirectoryEntryPlus {
                inode: e.ino,
                generation: 0,
                kind: to_fuse_kind(e.kind),
                name: OsString::from(e.name),
                offset: (i as i64) + 1,
                attr: to_fuse_attr(&attr, &req),
                entry_ttl: TTL,
                attr_ttl: TTL,
            });
        }
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        let slice: Vec<_> = all.into_iter().skip(start).collect();
        let boxed: Self::DirEntryPlusStream<'a> =
            Box::pin(stream::iter(slice.into_iter().map(Ok)));
        Ok(ReplyDirectoryPlus { entries: boxed })
    }

    async fn access(&self, _req: Request, inode: u64, mask: u32) -> FuseResult<()> {
        self.attr(inode).map_err(to_errno)?;
        if mask & libc::W_OK as u32 != 0 {
            return Err(libc::EROFS.into());
        }
        Ok(())
    }

    // Capacity is unknown; only the inode count is meaningful.
    async fn statfs(&self, _req: Request, _ino: u64) -> FuseResult<ReplyStatFs> {
        Ok(ReplyStatFs {
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: self.inode_count() as u64,
            ffree: 0,
            bsize: 4096,
            namelen: 255,
            frsize: 4096,
        })
    }

    async fn mkdir(
        &self,
        _req: Request,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
    ) -> FuseResult<ReplyEntry> {
        Err(libc::EROFS.into())
    }

    async fn create(
        &self,
        _req: Request,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _flags: u32,
    ) -> FuseResult<ReplyCreated> {
        Err(libc::EROFS.into())
    }

    async fn unlink(&self, _req: Request, _parent: u64, _name: &OsStr) -> FuseResult<()> {
        Err(libc::EROFS.into())
    }

    async fn rmdir(&self, _req: Request, _parent: u64, _name: &OsStr) -> FuseResult<()> {
        Err(libc::EROFS.into())
    }

    async fn rename(
        &self,
        _req: Request,
        _parent: u64,
        _name: &OsStr,
        _new_parent: u64,
        _new_name: &OsStr,
    ) -> FuseResult<()> {
        Err(libc::EROFS.into())
    }

    // Handles are stateless (fh = 0).
    async fn release(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn releasedir(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _flags: u32,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn interrupt(&self, _req: Request, unique: u64) -> FuseResult<()> {
        let hit = self.inflight().cancel(unique);
        debug!(unique, hit, "interrupt");
        Ok(())
    }
}

// =============== helpers ===============
fn to_errno(err: ObjfsError) -> Errno {
    err.errno().into()
}

fn to_fuse_kind(k: VfsFileType) -> FuseFileType {
    match k {
        VfsFileType::Dir => FuseFileType::Directory,
        VfsFileType::File => FuseFileType::RegularFile,
    }
}

fn to_fuse_attr(v: &VfsFileAttr, req: &Request) -> rfuse3::raw::reply::FileAttr {
    let mtime = Timestamp::from(v.mtime);
    let nlink = match v.kind {
        VfsFileType::Dir => 2,
        VfsFileType::File => 1,
    };
    // blocks are 512B units
    let blocks = v.size.div_ceil(512);
    rfuse3::raw::reply::FileAttr {
        ino: v.ino,
        size: v.size,
        blocks,
        atime: mtime,
        mtime,
        ctime: mtime,
        #[cfg(target_os = "macos")]
        crtime: mtime,
        kind: to_fuse_kind(v.kind),
        perm: v.perm,
        nlink,
        uid: req.uid,
        gid: req.gid,
        rdev: 0,
        #[cfg(target_os = "macos")]
        flags: 0,
        blksize: 4096,
    }
}
