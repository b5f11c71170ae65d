// This file is part of nzbfs, a Usenet-backed streaming filesystem.
// Copyright (C) 2025 The nzbfs Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

use std::error::Error as StdError;
use std::fmt;

/// Error kind.
///
/// These codes are taken from
/// [grpc::StatusCode](https://github.com/grpc/grpc/blob/master/include/grpcpp/impl/codegen/status_code_enum.h),
/// which is a nice general-purpose classification of errors. See that link for
/// descriptions of each error.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
#[rustfmt::skip]
pub enum ErrorKind {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    Unauthenticated,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Unknown => "Unknown",
            ErrorKind::InvalidArgument => "Invalid argument",
            ErrorKind::DeadlineExceeded => "Deadline exceeded",
            ErrorKind::NotFound => "Not found",
            ErrorKind::AlreadyExists => "Already exists",
            ErrorKind::PermissionDenied => "Permission denied",
            ErrorKind::Unauthenticated => "Unauthenticated",
            ErrorKind::ResourceExhausted => "Resource exhausted",
            ErrorKind::FailedPrecondition => "Failed precondition",
            ErrorKind::Aborted => "Aborted",
            ErrorKind::OutOfRange => "Out of range",
            ErrorKind::Unimplemented => "Unimplemented",
            ErrorKind::Internal => "Internal",
            ErrorKind::Unavailable => "Unavailable",
            ErrorKind::DataLoss => "Data loss",
        };
        f.write_str(s)
    }
}

struct ErrorInner {
    kind: ErrorKind,
    msg: Option<String>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

/// A general-purpose error with a [`ErrorKind`] code, an optional message,
/// and an optional source error.
///
/// Kept to a single pointer so `Result<(), Error>` stays register-sized.
pub struct Error(Box<ErrorInner>);

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Error(Box::new(ErrorInner {
            kind,
            msg: None,
            source: None,
        }))
    }

    pub fn wrap<E: Into<Box<dyn StdError + Send + Sync>>>(kind: ErrorKind, source: E) -> Self {
        Error(Box::new(ErrorInner {
            kind,
            msg: None,
            source: Some(source.into()),
        }))
    }

    pub fn kind(&self) -> ErrorKind {
        self.0.kind
    }

    pub fn msg(&self) -> Option<&str> {
        self.0.msg.as_deref()
    }

    /// Returns an object which displays the full chain of causes.
    pub fn chain(&self) -> ErrorChain<'_> {
        ErrorChain(self)
    }

    /// Searches the source chain for an error of concrete type `T`.
    pub fn downcast_source_ref<T: StdError + 'static>(&self) -> Option<&T> {
        let mut cur: Option<&(dyn StdError + 'static)> = match &self.0.source {
            Some(s) => Some(s.as_ref()),
            None => None,
        };
        while let Some(e) = cur {
            if let Some(t) = e.downcast_ref::<T>() {
                return Some(t);
            }
            cur = e.source();
        }
        None
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0.msg {
            Some(msg) => write!(f, "{}: {}", self.0.kind, msg),
            None => fmt::Display::fmt(&self.0.kind, f),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.chain())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.0
            .source
            .as_ref()
            .map(|s| s.as_ref() as &(dyn StdError + 'static))
    }
}

/// Displays an [`Error`] and all its causes, separated by `: `.
pub struct ErrorChain<'a>(&'a Error);

impl fmt::Display for ErrorChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.0, f)?;
        let mut cur = self.0.source();
        while let Some(e) = cur {
            write!(f, ": {e}")?;
            cur = e.source();
        }
        Ok(())
    }
}

/// Builder used by the [`err!`](crate::err) macro; rarely constructed directly.
pub struct ErrorBuilder(Error);

impl ErrorBuilder {
    pub fn new(kind: ErrorKind) -> Self {
        ErrorBuilder(Error::new(kind))
    }

    pub fn msg(mut self, msg: String) -> Self {
        self.0 .0.msg = Some(msg);
        self
    }

    pub fn source<E: Into<Box<dyn StdError + Send + Sync>>>(mut self, source: E) -> Self {
        self.0 .0.source = Some(source.into());
        self
    }

    pub fn build(self) -> Error {
        self.0
    }
}

/// Extension methods for `Result`.
pub trait ResultExt<T> {
    /// Annotates an error with the given kind.
    ///
    /// Example:
    /// ```
    /// use nzbfs_base::{ErrorKind, ResultExt as _};
    /// use std::io::Read;
    /// let mut buf = [0u8; 1];
    /// let r = std::io::Cursor::new("").read_exact(&mut buf[..]).err_kind(ErrorKind::Internal);
    /// assert_eq!(r.unwrap_err().kind(), ErrorKind::Internal);
    /// ```
    fn err_kind(self, k: ErrorKind) -> Result<T, Error>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<Box<dyn StdError + Send + Sync>>,
{
    fn err_kind(self, k: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| Error::wrap(k, e))
    }
}

/// Constructs an [`Error`] from an [`ErrorKind`], an optional `msg(...)`
/// format clause, and an optional `source(...)` cause.
///
/// Example:
/// ```
/// use nzbfs_base::{err, ErrorKind};
/// let e = err!(NotFound, msg("no such article <{}>", "x@y"));
/// assert_eq!(e.kind(), ErrorKind::NotFound);
/// assert_eq!(e.to_string(), "Not found: no such article <x@y>");
/// ```
#[macro_export]
macro_rules! err {
    ($kind:ident) => {
        $crate::ErrorBuilder::new($crate::ErrorKind::$kind).build()
    };
    ($kind:ident, msg($($msg:tt)*) $(,)?) => {
        $crate::ErrorBuilder::new($crate::ErrorKind::$kind)
            .msg(format!($($msg)*))
            .build()
    };
    ($kind:ident, msg($($msg:tt)*), source($source:expr) $(,)?) => {
        $crate::ErrorBuilder::new($crate::ErrorKind::$kind)
            .msg(format!($($msg)*))
            .source($source)
            .build()
    };
    ($kind:ident, source($source:expr) $(,)?) => {
        $crate::ErrorBuilder::new($crate::ErrorKind::$kind)
            .source($source)
            .build()
    };
}

/// Like [`err!`] but immediately returns the error from the enclosing
/// function.
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::err!($($arg)*))
    };
}
