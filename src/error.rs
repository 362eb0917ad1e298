//! Error taxonomy and the per-engine "last error" latch.
//!
//! Mirrors the category + message shape the source keeps per engine
//! (§3 "Error state", §7 of the spec): a failure sets the latch, most
//! public methods short-circuit to a benign default while the latch is
//! set, and the caller clears it explicitly to isolate the next
//! operation.

use crate::mach::KernelError;
use thiserror::Error;

/// Categorical error kind, matching the taxonomy table in §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    None,
    AllocationFail,
    BinaryNotFound,
    SegmentNotFound,
    InvalidArgument,
    VMReadFail,
    VMWriteFail,
    VMProtectFail,
    VMDeallocateFail,
    VMQueryFail,
    InvalidState,
}

impl ErrorKind {
    /// The category name surfaced to a CLI-like caller, per §7
    /// "User-visible behavior".
    pub fn name(self) -> &'static str {
        match self {
            Self::None => "None",
            Self::AllocationFail => "AllocationFail",
            Self::BinaryNotFound => "BinaryNotFound",
            Self::SegmentNotFound => "SegmentNotFound",
            Self::InvalidArgument => "InvalidArgument",
            Self::VMReadFail => "VMReadFail",
            Self::VMWriteFail => "VMWriteFail",
            Self::VMProtectFail => "VMProtectFail",
            Self::VMDeallocateFail => "VMDeallocateFail",
            Self::VMQueryFail => "VMQueryFail",
            Self::InvalidState => "InvalidState",
        }
    }
}

/// An engine-level error: a category plus a human-readable message and,
/// where applicable, the underlying kernel error.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}", kind = self.kind.name())]
pub struct EngineError {
    pub kind: ErrorKind,
    pub message: String,
    #[source]
    pub kernel: Option<KernelError>,
}

impl EngineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            kernel: None,
        }
    }

    pub fn kernel(kind: ErrorKind, message: impl Into<String>, kernel: KernelError) -> Self {
        Self {
            kind,
            message: message.into(),
            kernel: Some(kernel),
        }
    }
}

/// The engine's single error slot. Transitions from `None` to any other
/// kind on the first failure and stays there until explicitly cleared.
#[derive(Debug, Default)]
pub struct LastError {
    current: Option<EngineError>,
}

impl LastError {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once an error has been latched and not yet cleared.
    pub fn is_set(&self) -> bool {
        self.current.is_some()
    }

    pub fn kind(&self) -> ErrorKind {
        self.current.as_ref().map_or(ErrorKind::None, |e| e.kind)
    }

    pub fn get(&self) -> Option<&EngineError> {
        self.current.as_ref()
    }

    /// Latches `err`, replacing whatever was previously latched.
    pub fn set(&mut self, err: EngineError) {
        self.current = Some(err);
    }

    pub fn clear(&mut self) {
        self.current = None;
    }
}
