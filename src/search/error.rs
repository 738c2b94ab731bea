use std::{io, path::PathBuf};

use thiserror::Error;

use super::machine::State;
use crate::mesh::{self, Rank};

/// Problems with how a run was set up. Always reported before any work starts.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("horizon must be between 1 and {max} slots, got {got}")]
    Horizon { got: u32, max: u32 },
    #[error("worker count must be at least 1")]
    NoWorkers,
    #[error("rank {rank} is outside 0..{workers}")]
    RankOutOfRange { rank: Rank, workers: usize },
    #[error("no state can serve a deficit slot")]
    NoDeficitState,
    #[error("cost of {state} must be finite and non-negative, got {cost}")]
    InvalidCost { state: State, cost: f64 },
    #[error("{field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("rank {rank} was given {peers} peer addresses for {workers} workers")]
    PeerCount {
        rank: Rank,
        peers: usize,
        workers: usize,
    },
    #[error("coordinator plans {theirs}, this rank is configured for {ours}")]
    PlanMismatch { ours: String, theirs: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("could not {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("transport failure: {0}")]
    Transport(#[source] mesh::Error),
    #[error("rank {rank} aborted the run")]
    PeerAborted { rank: Rank },
    #[error("invalid scenario input: {0}")]
    Input(String),
    #[error("worker {rank} panicked")]
    Panicked { rank: Rank },
    #[error("could not start a worker runtime: {0}")]
    Runtime(#[source] io::Error),
}

/// Broad category of an [`Error`], used to pick a process exit status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Io,
    Transport,
    Input,
    Internal,
}

impl Error {
    pub(crate) fn io(action: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            action,
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Config,
            Error::Io { .. } => ErrorKind::Io,
            Error::Transport(_) | Error::PeerAborted { .. } => ErrorKind::Transport,
            Error::Input(_) => ErrorKind::Input,
            Error::Panicked { .. } | Error::Runtime(_) => ErrorKind::Internal,
        }
    }
}

impl From<mesh::Error> for Error {
    fn from(e: mesh::Error) -> Self {
        match e {
            mesh::Error::Interrupted(rank) => Error::PeerAborted { rank },
            e => Error::Transport(e),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
