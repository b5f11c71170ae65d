// This file is part of nzbfs, a Usenet-backed streaming filesystem.
// Copyright (C) 2025 The nzbfs Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! FUSE front-end.
//!
//! Maps the filesystem facade onto kernel callbacks. Inodes are allocated
//! lazily per path and never reused within a mount; file handles remember
//! their position so the kernel's sequential ~128 KiB reads skip the seek
//! entirely. Every write-shaped operation fails with `EACCES`, except
//! `setattr`, which reports success without doing anything because file
//! managers insist on touching times during a move.

use std::ffi::OsStr;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use base::{ErrorKind, FastHashMap};
use fuser::{
    FileAttr, FileType, KernelConfig, MountOption, ReplyAttr, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, Request, TimeOrNow, FUSE_ROOT_ID,
};
use tracing::{debug, info, warn};

use crate::vfs::file::VirtualFile;
use crate::vfs::{Filesystem, ReqContext};

const TTL: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct MountOptions {
    pub mount_path: std::path::PathBuf,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Kernel readahead, e.g. `128K`; becomes a `max_read=` mount option.
    pub readahead: Option<u64>,
    pub allow_other: bool,
}

struct OpenHandle {
    file: Arc<VirtualFile>,
    /// Expected offset of the next sequential read.
    pos: u64,
}

struct Inodes {
    by_ino: FastHashMap<u64, String>,
    by_path: FastHashMap<String, u64>,
    next: u64,
}

impl Inodes {
    fn new() -> Self {
        let mut t = Inodes {
            by_ino: FastHashMap::default(),
            by_path: FastHashMap::default(),
            next: FUSE_ROOT_ID + 1,
        };
        t.by_ino.insert(FUSE_ROOT_ID, "/".to_owned());
        t.by_path.insert("/".to_owned(), FUSE_ROOT_ID);
        t
    }

    fn path(&self, ino: u64) -> Option<String> {
        self.by_ino.get(&ino).cloned()
    }

    fn ino_for(&mut self, path: &str) -> u64 {
        if let Some(&ino) = self.by_path.get(path) {
            return ino;
        }
        let ino = self.next;
        self.next += 1;
        self.by_ino.insert(ino, path.to_owned());
        self.by_path.insert(path.to_owned(), ino);
        ino
    }

    fn child(&self, parent: u64, name: &OsStr) -> Option<String> {
        let parent = self.path(parent)?;
        let name = name.to_str()?;
        Some(if parent == "/" {
            format!("/{name}")
        } else {
            format!("{parent}/{name}")
        })
    }

    fn rename(&mut self, from: &str, to: &str) {
        if let Some(ino) = self.by_path.remove(from) {
            self.by_path.insert(to.to_owned(), ino);
            self.by_ino.insert(ino, to.to_owned());
        }
    }
}

pub struct NzbMount {
    fs: Arc<Filesystem>,
    rt: tokio::runtime::Handle,
    inodes: Mutex<Inodes>,
    handles: Mutex<FastHashMap<u64, OpenHandle>>,
    next_fh: AtomicU64,
    uid: u32,
    gid: u32,
}

fn errno(e: &base::Error) -> libc::c_int {
    match e.kind() {
        ErrorKind::NotFound => libc::ENOENT,
        ErrorKind::PermissionDenied => libc::EACCES,
        ErrorKind::InvalidArgument => libc::EINVAL,
        ErrorKind::FailedPrecondition => libc::EBADF,
        ErrorKind::Aborted | ErrorKind::Cancelled => libc::EINTR,
        ErrorKind::DataLoss => libc::EIO,
        _ => libc::EIO,
    }
}

impl NzbMount {
    pub fn new(fs: Arc<Filesystem>, rt: tokio::runtime::Handle, uid: u32, gid: u32) -> Self {
        NzbMount {
            fs,
            rt,
            inodes: Mutex::new(Inodes::new()),
            handles: Mutex::new(FastHashMap::default()),
            next_fh: AtomicU64::new(1),
            uid,
            gid,
        }
    }

    fn attr(&self, ino: u64, info: &metadata::FileInfo) -> FileAttr {
        let mtime: SystemTime = info.mtime.into();
        FileAttr {
            ino,
            size: info.size,
            blocks: info.size.div_ceil(512),
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind: if info.is_dir {
                FileType::Directory
            } else {
                FileType::RegularFile
            },
            perm: if info.is_dir { 0o555 } else { 0o444 },
            nlink: 1,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }

    fn stat_ino(&self, ino: u64) -> Result<FileAttr, libc::c_int> {
        let path = self
            .inodes
            .lock()
            .unwrap()
            .path(ino)
            .ok_or(libc::ENOENT)?;
        let info = self.fs.stat(&path).map_err(|e| errno(&e))?;
        Ok(self.attr(ino, &info))
    }
}

impl fuser::Filesystem for NzbMount {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
        info!("fuse: filesystem initialized");
        Ok(())
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(path) = self.inodes.lock().unwrap().child(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.stat(&path) {
            Ok(info) => {
                let ino = self.inodes.lock().unwrap().ino_for(&path);
                reply.entry(&TTL, &self.attr(ino, &info), 0);
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.stat_ino(ino) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    /// No-op success: catalog tools set times/modes as part of a move and
    /// treat failure as fatal.
    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        if size.is_some() {
            // Truncation is a write.
            reply.error(libc::EACCES);
            return;
        }
        match self.stat_ino(ino) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.inodes.lock().unwrap().path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let entries = match self.fs.readdir(&path) {
            Ok(e) => e,
            Err(e) => {
                reply.error(errno(&e));
                return;
            }
        };
        let mut all: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_owned()),
            (FUSE_ROOT_ID, FileType::Directory, "..".to_owned()),
        ];
        {
            let mut inodes = self.inodes.lock().unwrap();
            for e in &entries {
                let child = if path == "/" {
                    format!("/{}", e.name)
                } else {
                    format!("{path}/{}", e.name)
                };
                let kind = if e.is_dir {
                    FileType::Directory
                } else {
                    FileType::RegularFile
                };
                all.push((inodes.ino_for(&child), kind, e.name.clone()));
            }
        }
        for (i, (ino, kind, name)) in all.into_iter().enumerate().skip(offset as usize) {
            if reply.add(ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        if flags & (libc::O_WRONLY | libc::O_RDWR) != 0 {
            reply.error(libc::EACCES);
            return;
        }
        let Some(path) = self.inodes.lock().unwrap().path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.open(&path, &ReqContext::default()) {
            Ok(file) => {
                // Start fetching right away; media players stat then read
                // almost immediately and the first segments dominate
                // time-to-first-frame.
                self.rt.block_on(file.warm_up());
                let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
                self.handles
                    .lock()
                    .unwrap()
                    .insert(fh, OpenHandle { file, pos: 0 });
                reply.opened(fh, 0);
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let offset = offset as u64;
        let Some((file, pos)) = self
            .handles
            .lock()
            .unwrap()
            .get(&fh)
            .map(|h| (h.file.clone(), h.pos))
        else {
            reply.error(libc::EBADF);
            return;
        };
        let result = self.rt.block_on(async {
            // Fast path: the kernel almost always reads sequentially, so the
            // tracked position usually matches and no seek is needed.
            if offset != pos {
                file.seek(io::SeekFrom::Start(offset.min(file.size()))).await?;
            }
            let mut buf = vec![0u8; size as usize];
            let mut n = 0;
            while n < buf.len() {
                match file.read(&mut buf[n..]).await? {
                    0 => break,
                    k => n += k,
                }
            }
            buf.truncate(n);
            Ok::<Vec<u8>, base::Error>(buf)
        });
        match result {
            Ok(data) => {
                if let Some(h) = self.handles.lock().unwrap().get_mut(&fh) {
                    h.pos = offset + data.len() as u64;
                }
                reply.data(&data);
            }
            Err(e) => {
                warn!(fh, offset, err = %e.chain(), "fuse read failed");
                reply.error(errno(&e));
            }
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        if let Some(h) = self.handles.lock().unwrap().remove(&fh) {
            self.rt.block_on(h.file.close());
        }
        reply.ok();
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.inodes.lock().unwrap().child(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        if let Err(e) = self.fs.mkdir(&path) {
            reply.error(errno(&e));
            return;
        }
        match self.fs.stat(&path) {
            Ok(info) => {
                let ino = self.inodes.lock().unwrap().ino_for(&path);
                reply.entry(&TTL, &self.attr(ino, &info), 0);
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.inodes.lock().unwrap().child(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.remove(&path) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.inodes.lock().unwrap().child(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.remove(&path) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (from, to) = {
            let inodes = self.inodes.lock().unwrap();
            match (inodes.child(parent, name), inodes.child(newparent, newname)) {
                (Some(f), Some(t)) => (f, t),
                _ => {
                    reply.error(libc::ENOENT);
                    return;
                }
            }
        };
        match self.fs.rename(&from, &to) {
            Ok(()) => {
                self.inodes.lock().unwrap().rename(&from, &to);
                reply.ok();
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _offset: i64,
        _data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyWrite,
    ) {
        reply.error(libc::EACCES);
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        reply.error(libc::EACCES);
    }
}

/// Mounts in the background; dropping the returned session unmounts.
pub fn mount(
    fs: Arc<Filesystem>,
    rt: tokio::runtime::Handle,
    options: &MountOptions,
) -> io::Result<fuser::BackgroundSession> {
    let uid = options.uid.unwrap_or_else(|| unsafe { libc::getuid() });
    let gid = options.gid.unwrap_or_else(|| unsafe { libc::getgid() });
    let mut mount_options = vec![
        MountOption::RO,
        MountOption::FSName("nzbfs".to_owned()),
        MountOption::AutoUnmount,
    ];
    if options.allow_other {
        mount_options.push(MountOption::AllowOther);
    }
    if let Some(readahead) = options.readahead {
        mount_options.push(MountOption::CUSTOM(format!("max_read={readahead}")));
    }
    debug!(path = %options.mount_path.display(), "fuse: mounting");
    fuser::spawn_mount2(
        NzbMount::new(fs, rt, uid, gid),
        &options.mount_path,
        &mount_options,
    )
}
