// This file is part of nzbfs, a Usenet-backed streaming filesystem.
// Copyright (C) 2025 The nzbfs Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

use std::sync::Arc;

use base::Error;
use metadata::{DiskStore, MetadataStore};

pub mod run;
pub mod validate;

/// Opens the on-disk metadata store named by the configuration.
fn open_store(config: &crate::config::ConfigFile) -> Result<Arc<dyn MetadataStore>, Error> {
    let store = DiskStore::new(&config.metadata.root_path)?;
    Ok(Arc::new(store))
}
