// This file is part of nzbfs, a Usenet-backed streaming filesystem.
// Copyright (C) 2025 The nzbfs Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use base::Error;
use bpaf::Bpaf;
use tracing::{debug, error};

mod cmds;
mod config;
mod crypt;
mod fuse;
mod mapper;
mod pool;
mod reader;
mod segment;
#[cfg(test)]
mod testutil;
mod validate;
mod vfs;
mod webdav;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// nzbfs: Usenet-backed read-only streaming filesystem.
#[derive(Bpaf, Debug)]
#[bpaf(options, version(VERSION))]
enum Args {
    // See docstrings of `cmds::*::Args` structs for a description of the
    // respective subcommands.
    Run(#[bpaf(external(cmds::run::args))] cmds::run::Args),
    Validate(#[bpaf(external(cmds::validate::args))] cmds::validate::Args),
}

impl Args {
    fn run(self) -> Result<i32, Error> {
        match self {
            Args::Run(a) => cmds::run::run(a),
            Args::Validate(a) => cmds::validate::run(a),
        }
    }
}

fn main() {
    base::tracing_setup::install();

    // Get the program name from the OS (e.g. if invoked as
    // `target/debug/nzbfs`: `nzbfs`), falling back to the crate name if
    // conversion to a path/UTF-8 string fails.
    let progname = std::env::args_os().next().map(PathBuf::from);
    let progname = progname
        .as_deref()
        .and_then(Path::file_name)
        .and_then(OsStr::to_str)
        .unwrap_or(env!("CARGO_PKG_NAME"));

    let args = match args()
        .fallback_to_usage()
        .run_inner(bpaf::Args::current_args().set_name(progname))
    {
        Ok(a) => a,
        Err(e) => std::process::exit(e.exit_code()),
    };
    tracing::trace!("parsed command-line arguments: {args:#?}");

    match args.run() {
        Err(e) => {
            error!(err = %e.chain(), "exiting due to error");
            ::std::process::exit(1);
        }
        Ok(rv) => {
            debug!("exiting with status {}", rv);
            std::process::exit(rv)
        }
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn bpaf_invariants() {
        super::args().check_invariants(false);
    }
}
