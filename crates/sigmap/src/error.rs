//! Error taxonomy carried across the wire and cached by replicated servers
//!
//! Errors are plain data: they travel inside `Rerror` replies and are stored
//! in reply caches, so every variant is `Clone` and serializable. Underlying
//! subsystem errors are wrapped as their rendered message.

use serde::{Deserialize, Serialize};

use crate::ids::{Fid, Tag};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum SigmaError {
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("unknown fid: {0}")]
    UnknownFid(Fid),
    #[error("stale: {0}")]
    Stale(String),
    #[error("version mismatch: {0}")]
    Version(String),
    #[error("unreachable: {0}")]
    Unreachable(String),
    #[error("file exists: {0}")]
    Exists(String),
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("invalid argument: {0}")]
    Inval(String),
    #[error("closed: {0}")]
    Closed(String),
    #[error("not a directory: {0}")]
    NotDir(String),
    #[error("is a directory: {0}")]
    IsDir(String),
    #[error("directory not empty: {0}")]
    NotEmpty(String),
    #[error("duplicate tag: {0}")]
    DupTag(Tag),
    #[error("unknown fence: {0}")]
    UnknownFence(String),
    #[error("bad fcall: {0}")]
    BadFcall(String),
    #[error("{0}")]
    Error(String),
}

impl SigmaError {
    /// Wrap an error from a subsystem outside the taxonomy
    pub fn wrap(e: impl std::fmt::Display) -> Self {
        Self::Error(e.to_string())
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::UnknownFid(_))
    }

    pub fn is_exists(&self) -> bool {
        matches!(self, Self::Exists(_))
    }

    /// Conditional write lost a race; re-read and retry
    pub fn is_version(&self) -> bool {
        matches!(self, Self::Version(_))
    }
}

impl From<bincode::Error> for SigmaError {
    fn from(e: bincode::Error) -> Self {
        Self::BadFcall(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates() {
        assert!(SigmaError::Unreachable("x".into()).is_unreachable());
        assert!(SigmaError::UnknownFid(Fid(3)).is_not_found());
        assert!(SigmaError::NotFound("a".into()).is_not_found());
        assert!(!SigmaError::Stale("f".into()).is_closed());
    }

    #[test]
    fn test_display() {
        let e = SigmaError::Stale("fence /cfg epoch 1 < 2".into());
        assert_eq!(e.to_string(), "stale: fence /cfg epoch 1 < 2");
        assert_eq!(SigmaError::wrap("boom").to_string(), "boom");
    }

    #[test]
    fn test_survives_encoding() {
        let e = SigmaError::DupTag(Tag(9));
        let bytes = bincode::serialize(&e).unwrap();
        let back: SigmaError = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, e);
    }
}
