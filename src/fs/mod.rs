//! FUSE adapter: presents a [`Session`]'s object tree as a writable
//! filesystem — three-tier Root / storage directory / object hierarchy,
//! page-at-a-time reads, buffered sequential writes flushed on close,
//! the `O_RDWR` rejection, and `statfs` summing capacity across
//! attached storages — built on the `fuser` 0.11 `Filesystem` trait.

mod inode;

use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
};
use log::{debug, warn};

use crate::tree::{CreatePolicy, NodeKey};
use crate::{Session, Ticket, Tree};
use crate::transport::Transport;

pub use inode::{InodeTable, ROOT_INO};

/// Attribute cache lifetime handed back to the kernel with every
/// `ReplyEntry`/`ReplyAttr`. Short, since the device's own state can
/// change out from under us at any time (another host, or an in-camera
/// delete) and we have no invalidation channel back into the kernel.
const ATTR_TTL: Duration = Duration::from_secs(1);

/// A file handle's open-mode state, keyed by the `fh` returned from
/// `open`/`create`.
enum Handle {
    /// Downloaded once at open time; reads are just `BlockList::read_at`.
    Read(crate::BlockList),
    /// Accumulated until `release`, then written back as one object.
    Write { key: NodeKey, buf: Vec<u8> },
}

/// Presents one [`Session`]'s object tree as a FUSE filesystem.
///
/// Holds its session through a [`Ticket`] rather than owning it
/// outright, so the same device can be shared with another consumer
/// without this struct knowing about it.
pub struct PtpFilesystem<T: Transport> {
    session: Ticket<Session<T>>,
    tree: Mutex<Tree>,
    inodes: Mutex<InodeTable>,
    handles: Mutex<HashMap<u64, Handle>>,
    next_fh: AtomicU64,
    uid: u32,
    gid: u32,
    create_policy: CreatePolicy,
}

impl<T: Transport> PtpFilesystem<T> {
    pub fn new(session: Ticket<Session<T>>, uid: u32, gid: u32) -> PtpFilesystem<T> {
        PtpFilesystem {
            session,
            tree: Mutex::new(Tree::new()),
            inodes: Mutex::new(InodeTable::new()),
            handles: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
            uid,
            gid,
            create_policy: CreatePolicy::default(),
        }
    }

    fn alloc_fh(&self) -> u64 {
        self.next_fh.fetch_add(1, Ordering::Relaxed)
    }

    /// Builds the `FileAttr` the kernel expects for `key`/`ino`, reading
    /// size/kind/timestamp out of the tree cache.
    fn attr_for(&self, tree: &Tree, ino: u64, key: NodeKey) -> Option<FileAttr> {
        tree.kind(key)?;
        let is_dir = tree.is_dir(key).unwrap_or(true);
        let size = tree.size(key).unwrap_or(0);
        let mtime = tree
            .timestamp(key)
            .and_then(parse_ptp_date)
            .unwrap_or(UNIX_EPOCH);

        let (file_type, perm, nlink) = if is_dir {
            (FileType::Directory, 0o755, 2)
        } else {
            (FileType::RegularFile, 0o644, 1)
        };
        // blocks/blksize are nominal; the device has no notion of either.
        let blksize = 512u32;
        let blocks = (size + blksize as u64 - 1) / blksize as u64;

        Some(FileAttr {
            ino,
            size,
            blocks,
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind: file_type,
            perm,
            nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize,
            flags: 0,
        })
    }
}

/// Parses a PTP date string (`YYYYMMDDThhmmss`, optionally with a
/// trailing `.s`/timezone suffix the way some devices emit it) into a
/// `SystemTime`. Returns `None` on anything else, letting the caller
/// fall back rather than guess.
fn parse_ptp_date(s: &str) -> Option<SystemTime> {
    if s.len() < 15 {
        return None;
    }
    let core = &s[..15];
    let dt = chrono::NaiveDateTime::parse_from_str(core, "%Y%m%dT%H%M%S").ok()?;
    let secs = dt.and_utc().timestamp();
    if secs < 0 {
        return None;
    }
    Some(UNIX_EPOCH + Duration::from_secs(secs as u64))
}

impl<T: Transport> Filesystem for PtpFilesystem<T> {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = match name.to_str() {
            Some(n) => n,
            None => return reply.error(libc::EINVAL),
        };

        let mut session = self.session.lock();
        let mut tree = self.tree.lock().expect("tree mutex poisoned");
        let mut inodes = self.inodes.lock().expect("inode table mutex poisoned");

        let parent_key = match inodes.key(parent) {
            Some(k) => k,
            None => return reply.error(libc::ENOENT),
        };

        match tree.lookup(&mut session, parent_key, name) {
            Ok(Some(child_key)) => {
                let ino = inodes.intern(child_key);
                match self.attr_for(&tree, ino, child_key) {
                    Some(attr) => reply.entry(&ATTR_TTL, &attr, 0),
                    None => reply.error(libc::ENOENT),
                }
            }
            Ok(None) => reply.error(libc::ENOENT),
            Err(e) => {
                warn!("lookup({}, {:?}) failed: {}", parent, name, e);
                reply.error(e.to_errno());
            }
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        let mut session = self.session.lock();
        let mut tree = self.tree.lock().expect("tree mutex poisoned");
        let inodes = self.inodes.lock().expect("inode table mutex poisoned");

        let key = match inodes.key(ino) {
            Some(k) => k,
            None => return reply.error(libc::ENOENT),
        };

        // getattr on a directory we've never listed still needs its
        // kind/size populated, so force a listing of its parent first
        // when the node itself is unknown to the tree cache.
        if tree.kind(key).is_none() {
            if let Some(parent) = tree.parent(key) {
                if let Err(e) = tree.list(&mut session, parent) {
                    return reply.error(e.to_errno());
                }
            }
        }

        match self.attr_for(&tree, ino, key) {
            Some(attr) => reply.attr(&ATTR_TTL, &attr),
            None => reply.error(libc::ENOENT),
        }
    }

    fn setattr(
        &mut self,
        req: &Request,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        _size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        _mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        // The device has no notion of permissions/ownership/timestamps
        // to mutate; a truncate-to-zero arrives as a plain `open` with
        // `O_TRUNC` followed by `write`/`release`, not through here.
        self.getattr(req, ino, reply);
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let mut session = self.session.lock();
        let mut tree = self.tree.lock().expect("tree mutex poisoned");
        let mut inodes = self.inodes.lock().expect("inode table mutex poisoned");

        let key = match inodes.key(ino) {
            Some(k) => k,
            None => return reply.error(libc::ENOENT),
        };

        let parent_ino = tree.parent(key).map(|p| inodes.intern(p)).unwrap_or(ROOT_INO);

        let children = match tree.list(&mut session, key) {
            Ok(c) => c,
            Err(e) => return reply.error(e.to_errno()),
        };

        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_owned()),
            (parent_ino, FileType::Directory, "..".to_owned()),
        ];
        for child in children {
            let child_ino = inodes.intern(child);
            let kind = if tree.is_dir(child).unwrap_or(false) {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            let name = tree.filename(child).unwrap_or("").to_owned();
            entries.push((child_ino, kind, name));
        }

        for (i, (entry_ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(entry_ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        let access_mode = flags & libc::O_ACCMODE;
        if access_mode == libc::O_RDWR {
            // Read-write opens are rejected outright; the device
            // protocol has no partial-update operation to back them.
            return reply.error(libc::EFAULT);
        }

        let mut session = self.session.lock();
        let tree = self.tree.lock().expect("tree mutex poisoned");
        let inodes = self.inodes.lock().expect("inode table mutex poisoned");

        let key = match inodes.key(ino) {
            Some(k) => k,
            None => return reply.error(libc::ENOENT),
        };
        let handle = match tree.object_handle(key) {
            Some(h) => h,
            None => return reply.error(libc::EISDIR),
        };

        let fh = self.alloc_fh();
        if access_mode == libc::O_WRONLY {
            self.handles
                .lock()
                .expect("file handle table mutex poisoned")
                .insert(fh, Handle::Write { key, buf: Vec::new() });
            return reply.opened(fh, 0);
        }

        match session.get_object(handle) {
            Ok(blocks) => {
                self.handles
                    .lock()
                    .expect("file handle table mutex poisoned")
                    .insert(fh, Handle::Read(blocks));
                reply.opened(fh, 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let handles = self.handles.lock().expect("file handle table mutex poisoned");
        match handles.get(&fh) {
            Some(Handle::Read(blocks)) => {
                let mut buf = vec![0u8; size as usize];
                let n = blocks.read_at(offset.max(0) as usize, &mut buf);
                reply.data(&buf[..n]);
            }
            Some(Handle::Write { .. }) => reply.error(libc::EBADF),
            None => reply.error(libc::EBADF),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let mut handles = self.handles.lock().expect("file handle table mutex poisoned");
        match handles.get_mut(&fh) {
            // Writes are only ever sequential appends from the tools this
            // adapter targets; offset is not
            // honored for out-of-order or sparse writes.
            Some(Handle::Write { buf, .. }) => {
                buf.extend_from_slice(data);
                reply.written(data.len() as u32);
            }
            _ => reply.error(libc::EBADF),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let handle = self.handles.lock().expect("file handle table mutex poisoned").remove(&fh);

        let (key, buf) = match handle {
            Some(Handle::Write { key, buf }) => (key, buf),
            Some(Handle::Read(_)) | None => return reply.ok(),
        };

        let mut session = self.session.lock();
        let mut tree = self.tree.lock().expect("tree mutex poisoned");

        match tree.write_back(&mut session, key, &buf, self.create_policy) {
            Ok(new_key) => {
                // the object handle backing this inode changed underneath
                // it; re-point the table instead of minting a new ino.
                self.inodes
                    .lock()
                    .expect("inode table mutex poisoned")
                    .remap(ino, new_key);
                reply.ok();
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let name = match name.to_str() {
            Some(n) => n,
            None => return reply.error(libc::EINVAL),
        };
        if flags & libc::O_ACCMODE == libc::O_RDWR {
            return reply.error(libc::EFAULT);
        }

        let mut session = self.session.lock();
        let mut tree = self.tree.lock().expect("tree mutex poisoned");
        let mut inodes = self.inodes.lock().expect("inode table mutex poisoned");

        let parent_key = match inodes.key(parent) {
            Some(k) => k,
            None => return reply.error(libc::ENOENT),
        };

        match tree.create(&mut session, parent_key, name, self.create_policy) {
            Ok(new_key) => {
                let ino = inodes.intern(new_key);
                let attr = match self.attr_for(&tree, ino, new_key) {
                    Some(a) => a,
                    None => return reply.error(libc::EIO),
                };
                let fh = self.alloc_fh();
                self.handles.lock().expect("file handle table mutex poisoned").insert(
                    fh,
                    Handle::Write {
                        key: new_key,
                        buf: Vec::new(),
                    },
                );
                reply.created(&ATTR_TTL, &attr, 0, fh, 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let name = match name.to_str() {
            Some(n) => n,
            None => return reply.error(libc::EINVAL),
        };

        let mut session = self.session.lock();
        let mut tree = self.tree.lock().expect("tree mutex poisoned");
        let mut inodes = self.inodes.lock().expect("inode table mutex poisoned");

        let parent_key = match inodes.key(parent) {
            Some(k) => k,
            None => return reply.error(libc::ENOENT),
        };

        match tree.mkdir(&mut session, parent_key, name, self.create_policy) {
            Ok(new_key) => {
                let ino = inodes.intern(new_key);
                match self.attr_for(&tree, ino, new_key) {
                    Some(attr) => reply.entry(&ATTR_TTL, &attr, 0),
                    None => reply.error(libc::EIO),
                }
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.remove(parent, name, reply)
    }

    /// Folders are deleted the same way as files: no emptiness check
    /// is performed locally, since devices vary in whether they
    /// reject deleting a non-empty folder themselves.
    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.remove(parent, name, reply)
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        let mut session = self.session.lock();
        let ids = match session.get_storage_ids() {
            Ok(ids) => ids,
            Err(e) => return reply.error(e.to_errno()),
        };

        const BLOCK_SIZE: u32 = 1024;
        let mut capacity_blocks: u64 = 0;
        let mut free_blocks: u64 = 0;
        for id in ids.into_iter().filter(|id| id.is_attached()) {
            match session.get_storage_info(id) {
                Ok(info) => {
                    capacity_blocks += info.max_capacity / BLOCK_SIZE as u64;
                    free_blocks += info.free_space_in_bytes / BLOCK_SIZE as u64;
                }
                // an unreachable storage contributes zero.
                Err(e) => debug!("statfs: storage {} unreachable: {}", id, e),
            }
        }

        reply.statfs(
            capacity_blocks,
            free_blocks,
            free_blocks,
            0,
            0,
            BLOCK_SIZE,
            255,
            BLOCK_SIZE,
        );
    }
}

impl<T: Transport> PtpFilesystem<T> {
    fn remove(&mut self, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match name.to_str() {
            Some(n) => n,
            None => return reply.error(libc::EINVAL),
        };

        let mut session = self.session.lock();
        let mut tree = self.tree.lock().expect("tree mutex poisoned");
        let inodes = self.inodes.lock().expect("inode table mutex poisoned");

        let parent_key = match inodes.key(parent) {
            Some(k) => k,
            None => return reply.error(libc::ENOENT),
        };

        let key = match tree.lookup(&mut session, parent_key, name) {
            Ok(Some(k)) => k,
            Ok(None) => return reply.error(libc::ENOENT),
            Err(e) => return reply.error(e.to_errno()),
        };

        match tree.delete(&mut session, key) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ptp_date_reads_a_well_formed_timestamp() {
        let t = parse_ptp_date("20200101T120000").unwrap();
        let secs = t.duration_since(UNIX_EPOCH).unwrap().as_secs();
        assert_eq!(secs, 1_577_880_000);
    }

    #[test]
    fn parse_ptp_date_rejects_garbage() {
        assert!(parse_ptp_date("").is_none());
        assert!(parse_ptp_date("not-a-date").is_none());
    }
}
