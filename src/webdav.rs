// This file is part of nzbfs, a Usenet-backed streaming filesystem.
// Copyright (C) 2025 The nzbfs Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! WebDAV/HTTP front-end.
//!
//! GET and HEAD are served directly: the virtual-file reader honors `Range`
//! precisely and maps corruption onto status codes, which a generic DAV
//! file adapter cannot express. Everything else (PROPFIND, MKCOL, MOVE,
//! DELETE, OPTIONS, LOCK) is delegated to `dav-server` over the same
//! filesystem facade. COPY is refused outright so media managers fall back
//! to MOVE, which is cheap here.

use std::convert::Infallible;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

use base::{Error, ErrorKind};
use bytes::Bytes;
use dav_server::davpath::DavPath;
use dav_server::fakels::FakeLs;
use dav_server::fs::{
    DavDirEntry, DavFile, DavFileSystem, DavMetaData, DavProp, FsError, FsFuture, FsStream,
    OpenOptions, ReadDirMeta,
};
use dav_server::DavHandler;
use futures::FutureExt as _;
use http::{header, Method, Request, Response, StatusCode};
use http_body::Frame;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt as _, Full, StreamBody};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::character::complete::digit1;
use nom::combinator::{all_consuming, map, map_res, opt};
use nom::sequence::{preceded, separated_pair};
use nom::IResult;
use subtle::ConstantTimeEq as _;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::vfs::file::{PartialContentError, VirtualFile};
use crate::vfs::{Filesystem, ReqContext};

/// Value of the custom `{altmount:}filesystem-id` live property. Media
/// managers compare it across paths to detect same-filesystem MOVE support.
const FILESYSTEM_ID: &str = "altmount-nzbfs-v1";
const PROP_NAMESPACE: &str = "altmount:";
const PROP_NAME: &str = "filesystem-id";

const DEFAULT_CHUNK_SIZE: usize = 64 << 10;

#[derive(Clone, Debug)]
pub struct WebdavOptions {
    pub username: Option<String>,
    pub password: Option<String>,
    /// URL prefix the share is served under.
    pub prefix: String,
    pub debug: bool,
    /// Read size used when streaming GET bodies.
    pub chunk_size: usize,
}

impl Default for WebdavOptions {
    fn default() -> Self {
        WebdavOptions {
            username: None,
            password: None,
            prefix: "/webdav/".to_owned(),
            debug: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

type BoxedBody = UnsyncBoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;

fn full_body<B: Into<Bytes>>(b: B) -> BoxedBody {
    UnsyncBoxBody::new(Full::new(b.into()).map_err(|e| match e {}))
}

fn empty_body() -> BoxedBody {
    full_body(Bytes::new())
}

fn plain_response(status: StatusCode, body: &'static str) -> Response<BoxedBody> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(full_body(body))
        .expect("hardcoded head should be valid")
}

/// One HTTP `Range` specifier. Multi-range requests are not honored (the
/// whole representation is served instead), which RFC 7233 permits.
#[derive(Debug, PartialEq, Eq)]
enum RangeSpec {
    FromTo(u64, u64),
    From(u64),
    Suffix(u64),
}

fn num(i: &str) -> IResult<&str, u64> {
    map_res(digit1, str::parse)(i)
}

fn parse_range(i: &str) -> Option<RangeSpec> {
    let spec = alt((
        map(preceded(tag("-"), num), RangeSpec::Suffix),
        map(
            separated_pair(num, tag("-"), opt(num)),
            |(start, end)| match end {
                Some(end) => RangeSpec::FromTo(start, end),
                None => RangeSpec::From(start),
            },
        ),
    ));
    all_consuming(preceded(tag("bytes="), spec))(i)
        .ok()
        .map(|(_, spec)| spec)
}

impl RangeSpec {
    /// Resolves against the representation size; `None` = unsatisfiable.
    fn resolve(&self, size: u64) -> Option<(u64, u64)> {
        match *self {
            RangeSpec::FromTo(s, e) => {
                if s >= size || e < s {
                    None
                } else {
                    Some((s, e.min(size - 1)))
                }
            }
            RangeSpec::From(s) => {
                if s >= size {
                    None
                } else {
                    Some((s, size - 1))
                }
            }
            RangeSpec::Suffix(n) => {
                if n == 0 || size == 0 {
                    None
                } else {
                    Some((size - n.min(size), size - 1))
                }
            }
        }
    }
}

fn percent_decode(path: &str) -> String {
    let bytes = path.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|h| u8::from_str_radix(h, 16).ok());
                match hex {
                    Some(b) => {
                        out.push(b);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

pub struct Server {
    fs: Arc<Filesystem>,
    dav: DavHandler,
    options: WebdavOptions,
}

impl Server {
    pub fn new(fs: Arc<Filesystem>, options: WebdavOptions) -> Arc<Self> {
        let dav = DavHandler::builder()
            .filesystem(Box::new(DavFs { fs: fs.clone() }))
            .locksystem(FakeLs::new())
            .strip_prefix(options.prefix.trim_end_matches('/').to_owned())
            .build_handler();
        Arc::new(Server { fs, dav, options })
    }

    /// Accept loop with graceful shutdown: in-flight requests get a chance
    /// to finish when the receiver fires.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: base::shutdown::Receiver,
    ) -> Result<(), Error> {
        let graceful = hyper_util::server::graceful::GracefulShutdown::new();
        info!(prefix = %self.options.prefix, "webdav: serving");
        loop {
            let (stream, remote) = tokio::select! {
                _ = shutdown.as_future() => break,
                r = listener.accept() => match r {
                    Ok(x) => x,
                    Err(e) => {
                        warn!(err = %e, "accept failed");
                        continue;
                    }
                },
            };
            let this = self.clone();
            let svc = hyper::service::service_fn(move |req| {
                let this = this.clone();
                async move { Ok::<_, Infallible>(this.handle(req, remote).await) }
            });
            let conn = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(stream), svc);
            let watched = graceful.watch(conn);
            tokio::spawn(async move {
                if let Err(e) = watched.await {
                    debug!(err = %e, "connection error");
                }
            });
        }
        info!("webdav: draining connections");
        graceful.shutdown().await;
        Ok(())
    }

    fn authorized(&self, req: &Request<Incoming>) -> bool {
        let Some(expect_user) = &self.options.username else {
            return true;
        };
        let expect_pass = self.options.password.as_deref().unwrap_or("");
        let Some(header) = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
        else {
            return false;
        };
        let Some(b64) = header.strip_prefix("Basic ") else {
            return false;
        };
        let Ok(decoded) = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, b64)
        else {
            return false;
        };
        let Ok(creds) = String::from_utf8(decoded) else {
            return false;
        };
        let Some((user, pass)) = creds.split_once(':') else {
            return false;
        };
        let user_ok: bool = user.as_bytes().ct_eq(expect_user.as_bytes()).into();
        let pass_ok: bool = pass.as_bytes().ct_eq(expect_pass.as_bytes()).into();
        user_ok && pass_ok
    }

    async fn handle(
        self: Arc<Self>,
        req: Request<Incoming>,
        remote: std::net::SocketAddr,
    ) -> Response<BoxedBody> {
        if self.options.debug {
            debug!(method = %req.method(), uri = %req.uri(), %remote, "webdav request");
        }
        if !self.authorized(&req) {
            let mut resp = plain_response(StatusCode::UNAUTHORIZED, "authentication required");
            resp.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                header::HeaderValue::from_static("Basic realm=\"nzbfs\""),
            );
            return resp;
        }
        let mut resp = if req.method() == Method::GET {
            self.serve_file(&req, false).await
        } else if req.method() == Method::HEAD {
            self.serve_file(&req, true).await
        } else if req.method().as_str() == "COPY" {
            plain_response(StatusCode::FORBIDDEN, "copying is not permitted; use MOVE")
        } else {
            let resp = self.dav.handle(req).await;
            resp.map(|b| UnsyncBoxBody::new(b.map_err(|e| e.into())))
        };
        resp.headers_mut().insert(
            header::ACCEPT_RANGES,
            header::HeaderValue::from_static("bytes"),
        );
        resp
    }

    /// Resolves the request path below the configured prefix.
    fn vfs_path(&self, req: &Request<Incoming>) -> Option<String> {
        let decoded = percent_decode(req.uri().path());
        let prefix = self.options.prefix.trim_end_matches('/');
        let rest = decoded.strip_prefix(prefix)?;
        if !rest.is_empty() && !rest.starts_with('/') {
            return None;
        }
        Some(metadata::normalize(rest))
    }

    async fn serve_file(&self, req: &Request<Incoming>, head_only: bool) -> Response<BoxedBody> {
        let Some(path) = self.vfs_path(req) else {
            return plain_response(StatusCode::NOT_FOUND, "outside webdav prefix");
        };
        let info = match self.fs.stat(&path) {
            Ok(info) => info,
            Err(e) => return error_response(&e, true),
        };
        if info.is_dir {
            return plain_response(StatusCode::FORBIDDEN, "is a directory");
        }
        let size = info.size;
        let range = req
            .headers()
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_range);
        let resolved = match &range {
            Some(spec) => match spec.resolve(size) {
                Some(r) => Some(r),
                None => {
                    let mut resp =
                        plain_response(StatusCode::RANGE_NOT_SATISFIABLE, "range not satisfiable");
                    resp.headers_mut().insert(
                        header::CONTENT_RANGE,
                        header::HeaderValue::from_str(&format!("bytes */{size}")).unwrap(),
                    );
                    return resp;
                }
            },
            None => None,
        };
        let (start, end) = resolved.unwrap_or((0, size.saturating_sub(1)));
        let content_length = if size == 0 { 0 } else { end - start + 1 };

        let mut builder = Response::builder()
            .status(if resolved.is_some() {
                StatusCode::PARTIAL_CONTENT
            } else {
                StatusCode::OK
            })
            .header(header::CONTENT_LENGTH, content_length)
            .header(
                header::CONTENT_TYPE,
                mime_guess::from_path(&path)
                    .first_or_octet_stream()
                    .as_ref(),
            );
        if resolved.is_some() {
            builder = builder.header(
                header::CONTENT_RANGE,
                format!("bytes {start}-{end}/{size}"),
            );
        }

        if head_only {
            return builder.body(empty_body()).expect("valid response head");
        }

        let ctx = ReqContext {
            range: resolved.map(|(s, e)| (s, Some(e))),
            is_copy: false,
            origin: Some(req.uri().to_string()),
        };
        let file = match self.fs.open(&path, &ctx) {
            Ok(f) => f,
            Err(e) => return error_response(&e, true),
        };
        if size > 0 && start > 0 {
            if let Err(e) = file.seek(io::SeekFrom::Start(start)).await {
                file.close().await;
                return error_response(&e, true);
            }
        }
        let body = stream_body(file, content_length, self.options.chunk_size);
        builder.body(body).expect("valid response head")
    }
}

/// Streams up to `remaining` bytes from the handle, closing it at the end.
/// A permanent failure mid-stream aborts the connection; the bytes already
/// flushed are the partial content the client keeps.
fn stream_body(file: Arc<VirtualFile>, remaining: u64, chunk_size: usize) -> BoxedBody {
    let chunk_size = chunk_size.max(4 << 10);
    let stream = futures::stream::unfold(
        (file, remaining),
        move |(file, remaining)| async move {
            if remaining == 0 {
                file.close().await;
                return None;
            }
            let mut buf = vec![0u8; chunk_size.min(remaining as usize)];
            match file.read(&mut buf).await {
                Ok(0) => {
                    file.close().await;
                    None
                }
                Ok(n) => {
                    buf.truncate(n);
                    Some((
                        Ok(Frame::data(Bytes::from(buf))),
                        (file, remaining - n as u64),
                    ))
                }
                Err(e) => {
                    if e.downcast_source_ref::<PartialContentError>().is_some() {
                        info!(path = file.path(), err = %e.chain(), "stream ended with partial content");
                    } else {
                        warn!(path = file.path(), err = %e.chain(), "stream failed");
                    }
                    file.close().await;
                    let boxed: Box<dyn std::error::Error + Send + Sync> =
                        Box::new(io::Error::other(e.to_string()));
                    Some((Err(boxed), (file, 0)))
                }
            }
        },
    );
    UnsyncBoxBody::new(StreamBody::new(stream))
}

/// Maps a facade error onto an HTTP status. Corruption discovered at open
/// maps to 404 (mid-stream it surfaces as a connection abort instead).
fn error_response(e: &Error, at_open: bool) -> Response<BoxedBody> {
    let status = match e.kind() {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
        ErrorKind::InvalidArgument | ErrorKind::FailedPrecondition => StatusCode::BAD_REQUEST,
        ErrorKind::DataLoss => {
            if at_open {
                StatusCode::NOT_FOUND
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(full_body(e.to_string()))
        .expect("hardcoded head should be valid")
}

fn fs_error(e: Error) -> FsError {
    match e.kind() {
        ErrorKind::NotFound => FsError::NotFound,
        ErrorKind::PermissionDenied => FsError::Forbidden,
        ErrorKind::AlreadyExists => FsError::Exists,
        ErrorKind::DataLoss => FsError::NotFound,
        _ => FsError::GeneralFailure,
    }
}

fn dav_to_vfs_path(p: &DavPath) -> String {
    metadata::normalize(&p.as_rel_ospath().to_string_lossy())
}

/// The DAV-facing view of the facade, used for everything but GET/HEAD.
#[derive(Clone)]
struct DavFs {
    fs: Arc<Filesystem>,
}

#[derive(Clone, Debug)]
struct Meta {
    len: u64,
    modified: std::time::SystemTime,
    is_dir: bool,
}

impl DavMetaData for Meta {
    fn len(&self) -> u64 {
        self.len
    }

    fn modified(&self) -> dav_server::fs::FsResult<std::time::SystemTime> {
        Ok(self.modified)
    }

    fn is_dir(&self) -> bool {
        self.is_dir
    }
}

fn meta_from_info(info: &metadata::FileInfo) -> Meta {
    Meta {
        len: info.size,
        modified: info.mtime.into(),
        is_dir: info.is_dir,
    }
}

struct Entry {
    name: String,
    meta: Meta,
}

impl DavDirEntry for Entry {
    fn name(&self) -> Vec<u8> {
        self.name.as_bytes().to_vec()
    }

    fn metadata(&self) -> FsFuture<'_, Box<dyn DavMetaData>> {
        let meta = self.meta.clone();
        async move { Ok(Box::new(meta) as Box<dyn DavMetaData>) }.boxed()
    }
}

impl DavFileSystem for DavFs {
    fn open<'a>(
        &'a self,
        path: &'a DavPath,
        options: OpenOptions,
    ) -> FsFuture<'a, Box<dyn DavFile>> {
        async move {
            if options.write || options.append || options.truncate || options.create {
                return Err(FsError::Forbidden);
            }
            let path = dav_to_vfs_path(path);
            let file = self
                .fs
                .open(&path, &ReqContext::default())
                .map_err(fs_error)?;
            Ok(Box::new(DavVirtualFile { file }) as Box<dyn DavFile>)
        }
        .boxed()
    }

    fn read_dir<'a>(
        &'a self,
        path: &'a DavPath,
        _meta: ReadDirMeta,
    ) -> FsFuture<'a, FsStream<Box<dyn DavDirEntry>>> {
        async move {
            let vpath = dav_to_vfs_path(path);
            let entries = self.fs.readdir(&vpath).map_err(fs_error)?;
            let mut out: Vec<Box<dyn DavDirEntry>> = Vec::with_capacity(entries.len());
            for e in entries {
                let child = if vpath == "/" {
                    format!("/{}", e.name)
                } else {
                    format!("{vpath}/{}", e.name)
                };
                let meta = match self.fs.stat(&child) {
                    Ok(info) => meta_from_info(&info),
                    Err(_) => continue,
                };
                out.push(Box::new(Entry { name: e.name, meta }));
            }
            let stream = futures::stream::iter(out.into_iter().map(Ok));
            Ok(Box::pin(stream) as FsStream<Box<dyn DavDirEntry>>)
        }
        .boxed()
    }

    fn metadata<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, Box<dyn DavMetaData>> {
        async move {
            let info = self.fs.stat(&dav_to_vfs_path(path)).map_err(fs_error)?;
            Ok(Box::new(meta_from_info(&info)) as Box<dyn DavMetaData>)
        }
        .boxed()
    }

    fn create_dir<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()> {
        async move { self.fs.mkdir(&dav_to_vfs_path(path)).map_err(fs_error) }.boxed()
    }

    fn remove_dir<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()> {
        async move { self.fs.remove(&dav_to_vfs_path(path)).map_err(fs_error) }.boxed()
    }

    fn remove_file<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()> {
        async move { self.fs.remove(&dav_to_vfs_path(path)).map_err(fs_error) }.boxed()
    }

    fn rename<'a>(&'a self, from: &'a DavPath, to: &'a DavPath) -> FsFuture<'a, ()> {
        async move {
            self.fs
                .rename(&dav_to_vfs_path(from), &dav_to_vfs_path(to))
                .map_err(fs_error)
        }
        .boxed()
    }

    fn copy<'a>(&'a self, _from: &'a DavPath, _to: &'a DavPath) -> FsFuture<'a, ()> {
        async move { Err(FsError::Forbidden) }.boxed()
    }

    fn have_props<'a>(
        &'a self,
        _path: &'a DavPath,
    ) -> Pin<Box<dyn futures::Future<Output = bool> + Send + 'a>> {
        Box::pin(futures::future::ready(true))
    }

    fn get_props<'a>(&'a self, path: &'a DavPath, _do_content: bool) -> FsFuture<'a, Vec<DavProp>> {
        async move {
            // Existence check so PROPFIND of a missing path 404s.
            self.fs.stat(&dav_to_vfs_path(path)).map_err(fs_error)?;
            Ok(vec![filesystem_id_prop(true)])
        }
        .boxed()
    }

    fn get_prop<'a>(&'a self, path: &'a DavPath, prop: DavProp) -> FsFuture<'a, Vec<u8>> {
        async move {
            self.fs.stat(&dav_to_vfs_path(path)).map_err(fs_error)?;
            if prop.name == PROP_NAME && prop.namespace.as_deref() == Some(PROP_NAMESPACE) {
                Ok(FILESYSTEM_ID.as_bytes().to_vec())
            } else {
                Err(FsError::NotFound)
            }
        }
        .boxed()
    }
}

fn filesystem_id_prop(with_value: bool) -> DavProp {
    DavProp {
        name: PROP_NAME.to_owned(),
        prefix: None,
        namespace: Some(PROP_NAMESPACE.to_owned()),
        xml: with_value.then(|| FILESYSTEM_ID.as_bytes().to_vec()),
    }
}

/// DavFile wrapper used by the delegated methods (PROPFIND content probes
/// and such); GET/HEAD bypass this entirely.
struct DavVirtualFile {
    file: Arc<VirtualFile>,
}

impl std::fmt::Debug for DavVirtualFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DavVirtualFile")
            .field("path", &self.file.path())
            .finish()
    }
}

impl DavFile for DavVirtualFile {
    fn metadata(&mut self) -> FsFuture<'_, Box<dyn DavMetaData>> {
        let info = self.file.stat();
        async move { Ok(Box::new(meta_from_info(&info)) as Box<dyn DavMetaData>) }.boxed()
    }

    fn write_buf(&mut self, _buf: Box<dyn bytes::Buf + Send>) -> FsFuture<'_, ()> {
        async move { Err(FsError::Forbidden) }.boxed()
    }

    fn write_bytes(&mut self, _buf: Bytes) -> FsFuture<'_, ()> {
        async move { Err(FsError::Forbidden) }.boxed()
    }

    fn read_bytes(&mut self, count: usize) -> FsFuture<'_, Bytes> {
        async move {
            let mut buf = vec![0u8; count];
            let mut n = 0;
            while n < count {
                match self.file.read(&mut buf[n..]).await {
                    Ok(0) => break,
                    Ok(k) => n += k,
                    Err(_) => return Err(FsError::GeneralFailure),
                }
            }
            buf.truncate(n);
            Ok(Bytes::from(buf))
        }
        .boxed()
    }

    fn seek(&mut self, pos: io::SeekFrom) -> FsFuture<'_, u64> {
        async move {
            self.file
                .seek(pos)
                .await
                .map_err(|_| FsError::GeneralFailure)
        }
        .boxed()
    }

    fn flush(&mut self) -> FsFuture<'_, ()> {
        async move { Ok(()) }.boxed()
    }
}

impl Drop for DavVirtualFile {
    fn drop(&mut self) {
        let file = self.file.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { file.close().await });
        }
    }
}
