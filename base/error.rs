// This file is part of Dashcam, an automotive dual-camera trip recorder.
// Copyright (C) 2024 The Dashcam Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! Error type used at module boundaries throughout the crate tree.
//!
//! Every error carries an [`ErrorKind`], an optional human-readable message,
//! and an optional source. The kind is what callers dispatch on: e.g. the
//! trip store retries `StorageBusy` but aborts on `StorageFatal`, and the
//! MJPEG generator treats `ClientDisconnected` as a normal exit rather than
//! a failure.

use std::fmt::Write as _;

/// Classification of an [`Error`].
///
/// The domain-specific kinds mirror the failure taxonomy of the recording
/// pipeline; the generic ones cover everything else.
#[derive(Copy, Clone, Eq, PartialEq, Debug, thiserror::Error)]
#[non_exhaustive]
#[rustfmt::skip]
pub enum ErrorKind {
    #[error("operation cancelled")] Cancelled,
    #[error("invalid argument")] InvalidArgument,
    #[error("not found")] NotFound,
    #[error("already exists")] AlreadyExists,
    #[error("failed precondition")] FailedPrecondition,
    #[error("internal error")] Internal,

    /// A camera could not be opened; recoverable by a driver reset.
    #[error("camera device unavailable")] DeviceUnavailable,
    /// Starting an encoder failed.
    #[error("encoder error")] EncoderError,
    /// A single frame capture failed; counted toward the reset threshold.
    #[error("frame capture failed")] FrameCaptureFailed,
    /// Database lock contention outlasted the retry budget.
    #[error("storage busy")] StorageBusy,
    /// Database corruption or an IO failure on write. Not recoverable.
    #[error("storage fatal")] StorageFatal,
    /// A transient network failure (e.g. one geocoding request).
    #[error("transient network error")] NetworkTransient,
    /// A sustained network failure; the job should stop.
    #[error("network error")] NetworkFatal,
    /// The HTTP peer went away. Expected for streams; not a real error.
    #[error("client disconnected")] ClientDisconnected,
    /// A camera is owned by the recorder (or vice versa).
    #[error("camera in use")] CameraContention,
}

/// Error type carrying an [`ErrorKind`], message, and source chain.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: Option<String>,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Error {
            kind,
            msg: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub fn msg(mut self, msg: impl Into<String>) -> Self {
        self.msg = Some(msg.into());
        self
    }

    #[must_use]
    pub fn source(mut self, source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Returns a `Display` adapter that includes the full source chain,
    /// for logging.
    pub fn chain(&self) -> Chain<'_> {
        Chain(self)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.msg {
            Some(m) => write!(f, "{}: {}", self.kind, m),
            None => std::fmt::Display::fmt(&self.kind, f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|s| s.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

pub struct Chain<'a>(&'a Error);

impl std::fmt::Display for Chain<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut out = self.0.to_string();
        let mut cur: Option<&(dyn std::error::Error + 'static)> =
            std::error::Error::source(self.0);
        while let Some(e) = cur {
            write!(&mut out, ": {e}")?;
            cur = e.source();
        }
        f.write_str(&out)
    }
}

/// Extension methods for `Result`.
pub trait ResultExt<T> {
    /// Annotates an error with the given kind, keeping it as the source.
    fn err_kind(self, k: ErrorKind) -> Result<T, Error>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    fn err_kind(self, k: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| Error::new(k).source(e))
    }
}

/// Constructs an [`Error`] from a kind and optional `msg(...)` / `source(...)`
/// arguments.
///
/// ```
/// use dashcam_base::{err, ErrorKind};
/// let e = err!(NotFound, msg("no trip with id {}", 3));
/// assert_eq!(e.kind(), ErrorKind::NotFound);
/// assert_eq!(e.to_string(), "not found: no trip with id 3");
/// ```
#[macro_export]
macro_rules! err {
    ($kind:ident) => {
        $crate::Error::new($crate::ErrorKind::$kind)
    };
    ($kind:ident, msg($($msg:tt)+)) => {
        $crate::Error::new($crate::ErrorKind::$kind).msg(format!($($msg)+))
    };
    ($kind:ident, source($source:expr)) => {
        $crate::Error::new($crate::ErrorKind::$kind).source($source)
    };
    ($kind:ident, source($source:expr), msg($($msg:tt)+)) => {
        $crate::Error::new($crate::ErrorKind::$kind)
            .source($source)
            .msg(format!($($msg)+))
    };
}

/// Like [`err!`], but returns from the enclosing function.
#[macro_export]
macro_rules! bail {
    ($($t:tt)*) => {
        return Err($crate::err!($($t)*).into())
    };
}
