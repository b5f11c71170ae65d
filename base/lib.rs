// This file is part of nzbfs, a Usenet-backed streaming filesystem.
// Copyright (C) 2025 The nzbfs Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod clock;
mod error;
pub mod shutdown;
pub mod strutil;
pub mod tracing_setup;

pub use crate::error::{Error, ErrorBuilder, ErrorKind, ResultExt};

pub type FastHashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;
pub type FastHashSet<K> = std::collections::HashSet<K, ahash::RandomState>;
