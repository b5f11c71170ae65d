// This file is part of nzbfs, a Usenet-backed streaming filesystem.
// Copyright (C) 2025 The nzbfs Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Subcommand to spot-check article availability for files in the catalog.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base::{bail, Error, ErrorKind, ResultExt as _};
use bpaf::Bpaf;
use tracing::warn;

use crate::config::read_config;
use crate::pool::{ArticlePool, UnconfiguredPool};
use crate::validate::{validate, ValidationConfig};
use metadata::MetadataStore;

/// Checks that a sampling of each file's articles is still retrievable.
#[derive(Bpaf, Debug)]
#[bpaf(command("validate"))]
pub struct Args {
    /// Path of the TOML configuration file.
    #[bpaf(long, argument("PATH"), fallback("/etc/nzbfs.toml".into()), debug_fallback)]
    config: PathBuf,

    /// Fetch a body probe per sampled segment instead of a stat.
    #[bpaf(long)]
    deep: bool,

    /// Percentage of segments to sample per file.
    #[bpaf(long, argument("PCT"), fallback(5.0))]
    sample_percent: f64,

    /// Concurrent checks per file.
    #[bpaf(long, argument("N"), fallback(10))]
    workers: usize,

    /// Per-segment check timeout, in seconds.
    #[bpaf(long, argument("SECS"), fallback(10))]
    timeout: u64,

    /// Virtual path of the file or directory to validate.
    #[bpaf(positional("VPATH"))]
    path: String,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let config = read_config(&args.config)?;
    let store = super::open_store(&config)?;
    warn!("no provider transport configured; checks will report errors");
    let pool: Arc<dyn ArticlePool> = Arc::new(UnconfiguredPool);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .err_kind(ErrorKind::Internal)?;
    rt.block_on(run_inner(args, store, pool))
}

fn collect_targets(
    store: &Arc<dyn MetadataStore>,
    path: &str,
    out: &mut Vec<String>,
) -> Result<(), Error> {
    if store.file_exists(path)? {
        out.push(path.to_owned());
        return Ok(());
    }
    if !store.directory_exists(path)? && path != "/" {
        bail!(NotFound, msg("{path} not found"));
    }
    for (name, _) in store.list_files(path)? {
        out.push(if path == "/" {
            format!("/{name}")
        } else {
            format!("{path}/{name}")
        });
    }
    for name in store.list_directory(path)? {
        let child = if path == "/" {
            format!("/{name}")
        } else {
            format!("{path}/{name}")
        };
        collect_targets(store, &child, out)?;
    }
    Ok(())
}

async fn run_inner(
    args: Args,
    store: Arc<dyn MetadataStore>,
    pool: Arc<dyn ArticlePool>,
) -> Result<i32, Error> {
    let path = metadata::normalize(&args.path);
    let mut targets = Vec::new();
    collect_targets(&store, &path, &mut targets)?;
    if targets.is_empty() {
        println!("nothing to validate under {path}");
        return Ok(0);
    }

    let validation = ValidationConfig {
        sample_percent: args.sample_percent,
        deep: args.deep,
        max_workers: args.workers.max(1),
        per_segment_timeout: Duration::from_secs(args.timeout),
        fail_fast: false,
    };

    let mut unhealthy = 0usize;
    let mut failed = 0usize;
    for target in &targets {
        let Some(meta) = store.read_file(target)? else {
            continue;
        };
        match validate(pool.clone(), &meta.segments, &validation).await {
            Ok(report) if report.is_healthy() => {
                println!("{target}: ok ({} segments checked)", report.total_checked);
            }
            Ok(report) => {
                unhealthy += 1;
                println!(
                    "{target}: {} of {} checked segments missing: {}",
                    report.missing_count,
                    report.total_checked,
                    report.missing_ids.join(", "),
                );
            }
            Err(e) => {
                failed += 1;
                println!("{target}: check failed: {}", e.chain());
            }
        }
    }
    println!(
        "{} file(s) checked, {} unhealthy, {} check failure(s)",
        targets.len(),
        unhealthy,
        failed
    );
    Ok(if unhealthy > 0 || failed > 0 { 1 } else { 0 })
}
