//! Kiln Core Library
//!
//! Turns uploaded agent archives into validated, versioned artifacts and
//! runs their declared entrypoint on demand under a time bound.
//!
//! ## Key Components
//!
//! - `TarballCodec` / `ArtifactPackager`: gzip tar archives and project packaging
//! - `ArtifactValidator`: extract, locate `kiln.toml`, prove the entrypoint callable
//! - `ArtifactIntake`: accept uploads and create QUEUED versions
//! - `BuildOrchestrator`: QUEUED → BUILDING → READY | FAILED
//! - `ExecutionOrchestrator`: PENDING → RUNNING → COMPLETED | FAILED | CANCELLED
//!
//! Agent code is Rhai script, loaded into a private engine per build and per
//! execution. There is no process isolation: loaded code runs in-process.

pub mod archive;
pub mod blob;
pub mod build;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod execution;
pub mod intake;
pub mod loader;
pub mod metrics;
pub mod obs;
pub mod resolve;
pub mod runtime;
pub mod telemetry;
pub mod validator;

pub use archive::{
    ArchiveError, ArtifactPackager, ExcludeRules, PackageSummary, TarballCodec,
};
pub use blob::FsBlobStore;
pub use build::{BuildOrchestrator, BuildOutcome};
pub use config::KilnConfig;
pub use descriptor::{Descriptor, Entrypoint, DEPENDENCY_FILE, DESCRIPTOR_FILE};
pub use error::{KilnError, Result};
pub use execution::{ExecutionOrchestrator, Page};
pub use intake::ArtifactIntake;
pub use loader::CancelFlag;
pub use validator::{ArtifactValidator, ValidationReport};

pub use kiln_state::{
    AgentId, AgentVersion, CallerId, Execution, ExecutionId, ExecutionStatus, VersionId,
    VersionStatus,
};
