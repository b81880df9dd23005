// CLASSIFICATION: COMMUNITY
// Filename: error.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

//! Error taxonomy shared by every stage of the peripheral image loader.

use std::fmt;

use thiserror::Error;

use crate::platform::PhysAddr;

/// Implementation hook that reported a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookStage {
    ProxyVote,
    InitImage,
    MemSetup,
    VerifySegment(usize),
    AuthAndReset,
    Shutdown,
}

impl fmt::Display for HookStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookStage::ProxyVote => f.write_str("proxy vote"),
            HookStage::InitImage => f.write_str("image metadata init"),
            HookStage::MemSetup => f.write_str("memory setup"),
            HookStage::VerifySegment(num) => write!(f, "verification of blob {num}"),
            HookStage::AuthAndReset => f.write_str("auth and reset"),
            HookStage::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// Errors produced while planning, loading, booting or dumping an image.
#[derive(Debug, Error)]
pub enum PilError {
    /// Malformed metadata, size mismatch or short blob read.
    #[error("integrity check failed: {0}")]
    Integrity(String),
    /// A fixed segment would overwrite memory owned by the host.
    #[error("kernel memory would be overwritten [{start:#010x}, {end:#010x})")]
    Permission { start: PhysAddr, end: PhysAddr },
    #[error("out of resources: {0}")]
    ResourceExhausted(String),
    /// An existing region is too small to be reused for the new image.
    #[error("can't reuse PIL memory, too small (have {have:#x}, need {need:#x})")]
    Sizing { have: u64, need: u64 },
    #[error("failed to locate blob {0} or blob is too big")]
    NotFound(String),
    #[error("entry address {0:#x} not within range")]
    UnreachableEntryPoint(PhysAddr),
    #[error("{stage} failed")]
    Hook {
        stage: HookStage,
        #[source]
        source: anyhow::Error,
    },
    /// Suspend refused while boot-window wake sources are held.
    #[error("suspend blocked by {0} active wake source(s)")]
    Busy(usize),
    #[error("pil state lock poisoned")]
    LockPoisoned,
}

impl PilError {
    pub(crate) fn integrity(msg: impl Into<String>) -> Self {
        PilError::Integrity(msg.into())
    }

    pub(crate) fn hook(stage: HookStage, source: anyhow::Error) -> Self {
        PilError::Hook { stage, source }
    }

    /// Stage tag for hook failures, `None` for every other error.
    #[must_use]
    pub fn hook_stage(&self) -> Option<HookStage> {
        match self {
            PilError::Hook { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

/// Result alias used across the crate.
pub type PilResult<T> = Result<T, PilError>;
