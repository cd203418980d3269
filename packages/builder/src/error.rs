//! Error taxonomy for the build engine.
//!
//! Every failure the engine reports carries a stable numeric code, a human
//! message, an ordered list of context frames describing the operations that
//! led to it, and optional actionable suggestions. Code ranges are grouped by
//! the subsystem that raised the error:
//!
//! - `1xxx` build
//! - `2xxx` cache
//! - `3xxx` graph
//! - `4xxx` io
//! - `5xxx` process
//! - `6xxx` network / distributed
//! - `7xxx` language
//! - `8xxx` system
//!
//! [`BuildError`] implements [`std::error::Error`], so it flows through
//! `color_eyre::Result` like any other error; layers that need to make policy
//! decisions (notably retry) downcast back out with
//! [`BuildError::from_report`].

use std::fmt;

use derive_more::Display;
use strum::{EnumIter, IntoStaticStr};

/// The specific kind of failure, each with a stable code.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, EnumIter, IntoStaticStr)]
pub enum ErrorKind {
    // Build
    #[display("target not found")]
    TargetNotFound,
    #[display("handler not found")]
    HandlerNotFound,
    #[display("declared output missing")]
    OutputMissing,
    #[display("build failed")]
    BuildFailed,
    #[display("build timed out")]
    BuildTimeout,
    #[display("build cancelled")]
    Cancelled,

    // Cache
    #[display("cache load failed")]
    CacheLoadFailed,
    #[display("cache save failed")]
    CacheSaveFailed,
    #[display("cache corrupted")]
    CacheCorrupted,
    #[display("cache miss")]
    CacheMiss,
    #[display("cache unauthorized")]
    CacheUnauthorized,
    #[display("cache entry too large")]
    CacheTooLarge,
    #[display("cache timed out")]
    CacheTimeout,
    #[display("cache in use")]
    CacheInUse,
    #[display("cache gc failed")]
    CacheGcFailed,

    // Graph
    #[display("duplicate target")]
    DuplicateTarget,
    #[display("dependency cycle")]
    GraphCycle,
    #[display("invalid edge")]
    InvalidEdge,
    #[display("node not found")]
    NodeNotFound,

    // Io
    #[display("file not found")]
    IoNotFound,
    #[display("read failed")]
    ReadFailed,
    #[display("write failed")]
    WriteFailed,
    #[display("permission denied")]
    PermissionDenied,

    // Process
    #[display("spawn failed")]
    SpawnFailed,
    #[display("process timed out")]
    ProcessTimeout,
    #[display("process crashed")]
    ProcessCrashed,
    #[display("process out of memory")]
    OutOfMemory,

    // Network / distributed
    #[display("coordinator unreachable")]
    CoordinatorUnreachable,
    #[display("worker timed out")]
    WorkerTimeout,
    #[display("worker failed")]
    WorkerFailed,
    #[display("artifact transfer failed")]
    ArtifactTransferFailed,

    // Language
    #[display("syntax error")]
    Syntax,
    #[display("compilation failed")]
    CompilationFailed,
    #[display("unsupported language")]
    UnsupportedLanguage,
    #[display("missing compiler")]
    MissingCompiler,

    // System
    #[display("initialization failed")]
    InitFailed,
    #[display("not supported")]
    NotSupported,
    #[display("not implemented")]
    NotImplemented,
}

impl ErrorKind {
    /// The stable numeric code for this kind.
    pub fn code(self) -> u32 {
        match self {
            Self::TargetNotFound => 1001,
            Self::HandlerNotFound => 1002,
            Self::OutputMissing => 1003,
            Self::BuildFailed => 1004,
            Self::BuildTimeout => 1005,
            Self::Cancelled => 1006,

            Self::CacheLoadFailed => 2001,
            Self::CacheSaveFailed => 2002,
            Self::CacheCorrupted => 2003,
            Self::CacheMiss => 2004,
            Self::CacheUnauthorized => 2005,
            Self::CacheTooLarge => 2006,
            Self::CacheTimeout => 2007,
            Self::CacheInUse => 2008,
            Self::CacheGcFailed => 2009,

            Self::DuplicateTarget => 3001,
            Self::GraphCycle => 3002,
            Self::InvalidEdge => 3003,
            Self::NodeNotFound => 3004,

            Self::IoNotFound => 4001,
            Self::ReadFailed => 4002,
            Self::WriteFailed => 4003,
            Self::PermissionDenied => 4004,

            Self::SpawnFailed => 5001,
            Self::ProcessTimeout => 5002,
            Self::ProcessCrashed => 5003,
            Self::OutOfMemory => 5004,

            Self::CoordinatorUnreachable => 6001,
            Self::WorkerTimeout => 6002,
            Self::WorkerFailed => 6003,
            Self::ArtifactTransferFailed => 6004,

            Self::Syntax => 7001,
            Self::CompilationFailed => 7002,
            Self::UnsupportedLanguage => 7003,
            Self::MissingCompiler => 7004,

            Self::InitFailed => 8001,
            Self::NotSupported => 8002,
            Self::NotImplemented => 8003,
        }
    }

    /// The retry class for this kind.
    pub fn class(self) -> ErrorClass {
        match self {
            Self::CoordinatorUnreachable | Self::ArtifactTransferFailed => {
                ErrorClass::TransientNetwork
            }
            Self::ReadFailed | Self::WriteFailed | Self::CacheTimeout => ErrorClass::TransientIo,
            Self::WorkerTimeout | Self::ProcessTimeout | Self::BuildTimeout => {
                ErrorClass::WorkerTimeout
            }
            Self::WorkerFailed | Self::ProcessCrashed => ErrorClass::WorkerCrash,
            Self::CacheMiss => ErrorClass::RemoteCacheMiss,
            Self::CompilationFailed | Self::Syntax | Self::BuildFailed => ErrorClass::CompileFailure,
            Self::PermissionDenied => ErrorClass::SandboxViolation,
            Self::GraphCycle => ErrorClass::Cycle,
            _ => ErrorClass::Fatal,
        }
    }

    /// Whether errors of this kind are eligible for retry at all.
    pub fn is_recoverable(self) -> bool {
        self.class().is_recoverable()
    }
}

/// Coarse classification used by the retry layer to select a policy.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, EnumIter)]
pub enum ErrorClass {
    #[display("transient-network")]
    TransientNetwork,
    #[display("transient-io")]
    TransientIo,
    #[display("worker-timeout")]
    WorkerTimeout,
    #[display("worker-crash")]
    WorkerCrash,
    #[display("remote-cache-miss")]
    RemoteCacheMiss,
    #[display("compile-failure")]
    CompileFailure,
    #[display("sandbox-violation")]
    SandboxViolation,
    #[display("cycle")]
    Cycle,
    #[display("fatal")]
    Fatal,
}

impl ErrorClass {
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            Self::TransientNetwork
                | Self::TransientIo
                | Self::WorkerTimeout
                | Self::WorkerCrash
                | Self::RemoteCacheMiss
        )
    }
}

/// One step of context recorded as an error propagates outward.
#[derive(Clone, Eq, PartialEq, Debug, Display)]
#[display("{operation}: {details} ({location})")]
pub struct Frame {
    /// The operation that was being performed.
    pub operation: String,
    /// Operation-specific details.
    pub details: String,
    /// Source location that recorded the frame.
    pub location: String,
}

/// A structured engine error.
#[derive(Clone, Debug)]
pub struct BuildError {
    kind: ErrorKind,
    message: String,
    frames: Vec<Frame>,
    suggestions: Vec<String>,
}

impl BuildError {
    /// Create a new error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            frames: Vec::new(),
            suggestions: Vec::new(),
        }
    }

    /// Record a context frame. Frames are ordered innermost-first.
    #[track_caller]
    pub fn frame(mut self, operation: impl Into<String>, details: impl Into<String>) -> Self {
        let caller = std::panic::Location::caller();
        self.frames.push(Frame {
            operation: operation.into(),
            details: details.into(),
            location: format!("{}:{}", caller.file(), caller.line()),
        });
        self
    }

    /// Attach an actionable suggestion shown to the user.
    pub fn suggest(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> u32 {
        self.kind.code()
    }

    pub fn class(&self) -> ErrorClass {
        self.kind.class()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn suggestions(&self) -> &[String] {
        &self.suggestions
    }

    /// Recover the structured error from an [`eyre::Report`] chain, if the
    /// root cause was a [`BuildError`].
    pub fn from_report(report: &color_eyre::Report) -> Option<&BuildError> {
        report.chain().find_map(|err| err.downcast_ref::<BuildError>())
    }

    /// Classify an arbitrary report for retry purposes.
    ///
    /// Reports without a structured root cause are treated as fatal.
    pub fn classify(report: &color_eyre::Report) -> ErrorClass {
        Self::from_report(report).map_or(ErrorClass::Fatal, BuildError::class)
    }
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[E{}] {}: {}", self.code(), self.kind, self.message)?;
        for frame in &self.frames {
            write!(f, "\n  while {frame}")?;
        }
        for suggestion in &self.suggestions {
            write!(f, "\n  hint: {suggestion}")?;
        }
        Ok(())
    }
}

impl std::error::Error for BuildError {}
