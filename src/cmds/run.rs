// This file is part of nzbfs, a Usenet-backed streaming filesystem.
// Copyright (C) 2025 The nzbfs Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Subcommand to serve the filesystem over WebDAV and/or a FUSE mount.

use std::path::PathBuf;
use std::sync::Arc;

use base::{bail, err, Error, ErrorKind, ResultExt as _};
use bpaf::Bpaf;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use crate::config::{read_config, ConfigFile};
use crate::pool::{static_pool, UnconfiguredPool};
use crate::vfs;
use crate::webdav;
use crate::{crypt, fuse};

/// Serves the virtual filesystem.
#[derive(Bpaf, Debug)]
#[bpaf(command("run"))]
pub struct Args {
    /// Path of the TOML configuration file.
    #[bpaf(long, argument("PATH"), fallback("/etc/nzbfs.toml".into()), debug_fallback)]
    config: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let config = read_config(&args.config)?;

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(worker_threads) = config.worker_threads {
        builder.worker_threads(worker_threads);
    }
    let rt = builder.build().err_kind(ErrorKind::Internal)?;
    let r = rt.block_on(async_run(&config, rt.handle().clone()));

    // In the graceful path everything of note was awaited; in the immediate
    // path we don't want to wait for stragglers.
    rt.shutdown_background();

    r
}

async fn async_run(config: &ConfigFile, rt: tokio::runtime::Handle) -> Result<i32, Error> {
    let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
    let mut shutdown_tx = Some(shutdown_tx);

    tokio::pin! {
        let int = signal(SignalKind::interrupt()).err_kind(ErrorKind::Internal)?;
        let term = signal(SignalKind::terminate()).err_kind(ErrorKind::Internal)?;
        let inner = inner(config, rt, shutdown_rx);
    }

    tokio::select! {
        _ = int.recv() => {
            info!("received SIGINT; shutting down gracefully. \
                   Send another SIGINT or SIGTERM to shut down immediately.");
            shutdown_tx.take();
        },
        _ = term.recv() => {
            info!("received SIGTERM; shutting down gracefully. \
                   Send another SIGINT or SIGTERM to shut down immediately.");
            shutdown_tx.take();
        },
        result = &mut inner => return result,
    }

    tokio::select! {
        _ = int.recv() => bail!(Cancelled, msg("immediate shutdown due to second signal (SIGINT)")),
        _ = term.recv() => bail!(Cancelled, msg("immediate shutdown due to second signal (SIGTERM)")),
        result = &mut inner => result,
    }
}

fn build_filesystem(config: &ConfigFile) -> Result<Arc<vfs::Filesystem>, Error> {
    let store = super::open_store(config)?;
    // Provider transport plugs in here; without one the tree is browsable
    // and reads fail cleanly.
    warn!("no provider transport configured; article fetches will fail");
    let pool = static_pool(Arc::new(UnconfiguredPool));
    let tracker = Arc::new(vfs::tracker::StreamTracker::new(Arc::new(
        base::clock::RealClocks::default(),
    )));
    let health: Arc<dyn metadata::health::HealthReporter> =
        Arc::new(metadata::health::NoopHealth);
    let fs_config = vfs::Config {
        categories: config
            .categories
            .iter()
            .map(|c| vfs::Category {
                name: c.name.clone(),
                dir: c.dir.clone(),
            })
            .collect(),
        hide_corrupted: !config.show_corrupted_files,
        max_download_workers: config.effective_workers(),
        max_range_size: config.streaming.max_range_size,
        cipher_defaults: crypt::Defaults {
            password: config.cipher.rclone_password.clone(),
            salt: config.cipher.rclone_salt.clone(),
        },
        delete_source_nzb_on_removal: config.metadata.delete_source_nzb_on_removal,
        resolve_repair_on_import: config.health.resolve_repair_on_import,
        library_dir: config.health.library_dir.clone(),
        cache: vfs::cache::CacheConfig::default(),
    };
    Ok(Arc::new(vfs::Filesystem::new(
        store, pool, health, tracker, fs_config,
    )))
}

async fn inner(
    config: &ConfigFile,
    rt: tokio::runtime::Handle,
    shutdown_rx: base::shutdown::Receiver,
) -> Result<i32, Error> {
    let fs = build_filesystem(config)?;
    info!("metadata store is open");

    let mut web_handle = None;
    if let Some(webdav_config) = &config.webdav {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", webdav_config.port))
            .await
            .map_err(|e| {
                err!(
                    Unavailable,
                    msg("unable to bind webdav port {}", webdav_config.port),
                    source(e)
                )
            })?;
        info!(port = webdav_config.port, "webdav: listening");
        let server = webdav::Server::new(
            fs.clone(),
            webdav::WebdavOptions {
                username: webdav_config.username.clone(),
                password: webdav_config.password.clone(),
                prefix: webdav_config.prefix.clone(),
                debug: webdav_config.debug,
                chunk_size: config.streaming.streaming_chunk_size.unwrap_or(64 << 10),
            },
        );
        web_handle = Some(tokio::spawn(server.serve(listener, shutdown_rx.clone())));
    }

    let mut fuse_session = None;
    if let Some(fuse_config) = &config.fuse {
        let options = fuse::MountOptions {
            mount_path: fuse_config.mount_path.clone(),
            uid: fuse_config.uid,
            gid: fuse_config.gid,
            readahead: config.readahead_bytes()?,
            allow_other: fuse_config.allow_other,
        };
        let session = tokio::task::block_in_place(|| fuse::mount(fs.clone(), rt, &options))
            .map_err(|e| {
                err!(
                    Unavailable,
                    msg("unable to mount {}", fuse_config.mount_path.display()),
                    source(e)
                )
            })?;
        info!(path = %fuse_config.mount_path.display(), "fuse: mounted");
        fuse_session = Some(session);
    }

    if web_handle.is_none() && fuse_session.is_none() {
        bail!(
            FailedPrecondition,
            msg("neither [webdav] nor [fuse] is configured; nothing to serve")
        );
    }

    info!("ready");
    shutdown_rx.as_future().await;

    info!("unmounting and draining");
    if let Some(session) = fuse_session {
        tokio::task::block_in_place(move || drop(session));
    }
    if let Some(handle) = web_handle {
        handle.await.err_kind(ErrorKind::Internal)??;
    }

    info!("exiting");
    Ok(0)
}
