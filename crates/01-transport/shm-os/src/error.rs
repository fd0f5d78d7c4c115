//! Error surface of the OS integration layer.
//!
//! Every failure falls in one of four kinds. Configuration and resource errors
//! abort session establishment, thread errors abort it after rollback, and
//! command errors never leave the notification channel: they are logged where
//! they happen and only counted.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::notify::NotifyCmd;

/// Convenience result alias for fallible session operations.
pub type ShmResult<T, E = ShmError> = Result<T, E>;

/// Steps of the session bootstrap transaction, in acquisition order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InitStep {
    LoadModule,
    OpenMemory,
    MapLocal,
    MapRemote,
    OpenNotify,
    StartDispatcher,
}

impl InitStep {
    /// All steps in the order `Session::init` performs them.
    pub const ORDER: [InitStep; 6] = [
        InitStep::LoadModule,
        InitStep::OpenMemory,
        InitStep::MapLocal,
        InitStep::MapRemote,
        InitStep::OpenNotify,
        InitStep::StartDispatcher,
    ];
}

impl fmt::Display for InitStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InitStep::LoadModule => "load interrupt module",
            InitStep::OpenMemory => "open memory device",
            InitStep::MapLocal => "map local shared memory",
            InitStep::MapRemote => "map remote shared memory",
            InitStep::OpenNotify => "open notification device",
            InitStep::StartDispatcher => "start rx dispatcher",
        };
        f.write_str(name)
    }
}

/// Coarse classification of [`ShmError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Resource,
    Command,
    Thread,
}

/// Errors surfaced by the session and its components.
#[derive(Debug, Error)]
pub enum ShmError {
    /// A configuration field was rejected before any resource was touched.
    #[error("invalid configuration: {field} {reason}")]
    Config {
        field: &'static str,
        reason: &'static str,
    },

    /// A privileged host resource could not be acquired or released.
    #[error("failed to {step}: {source}")]
    Resource {
        step: InitStep,
        #[source]
        source: io::Error,
    },

    /// A notification command was only partially written.
    #[error("notification command {cmd:?} wrote {written} of {expected} bytes")]
    Command {
        cmd: NotifyCmd,
        written: usize,
        expected: usize,
    },

    /// The rx dispatcher thread could not be started.
    #[error("rx dispatcher failed to start: {0}")]
    Thread(#[source] io::Error),
}

impl ShmError {
    pub fn config(field: &'static str, reason: &'static str) -> Self {
        ShmError::Config { field, reason }
    }

    pub fn resource(step: InitStep, source: io::Error) -> Self {
        ShmError::Resource { step, source }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ShmError::Config { .. } => ErrorKind::Config,
            ShmError::Resource { .. } => ErrorKind::Resource,
            ShmError::Command { .. } => ErrorKind::Command,
            ShmError::Thread(_) => ErrorKind::Thread,
        }
    }

    /// The bootstrap step this error aborted, if any.
    pub fn step(&self) -> Option<InitStep> {
        match self {
            ShmError::Resource { step, .. } => Some(*step),
            ShmError::Thread(_) => Some(InitStep::StartDispatcher),
            ShmError::Config { .. } | ShmError::Command { .. } => None,
        }
    }
}
