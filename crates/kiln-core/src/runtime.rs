//! Blocking execution worker.
//!
//! Runs on a `spawn_blocking` thread: unpacks the archive into a private
//! scratch directory, loads the entrypoint module under a unique namespace
//! and calls the entrypoint function with the payload.

use std::path::Path;

use crate::archive::TarballCodec;
use crate::descriptor::Entrypoint;
use crate::error::{KilnError, Result};
use crate::loader::{load_module, CancelFlag};
use crate::obs::ExecutionSpan;
use crate::resolve::resolve_module;

/// What a worker produced, including script output captured before a failure.
#[derive(Debug)]
pub struct WorkerOutcome {
    pub result: Result<serde_json::Value>,
    pub printed: Vec<String>,
}

/// Everything a worker needs, owned so it can move onto a blocking thread.
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub execution_id: i64,
    pub archive: Vec<u8>,
    pub entrypoint: Entrypoint,
    pub payload: serde_json::Value,
}

/// Run one execution to completion on the current thread.
pub fn run_entrypoint(request: WorkerRequest, scratch_root: &Path, cancel: &CancelFlag) -> WorkerOutcome {
    let _span = ExecutionSpan::enter(request.execution_id);
    let mut printed = Vec::new();
    let result = run_inner(&request, scratch_root, cancel, &mut printed);
    WorkerOutcome { result, printed }
}

fn run_inner(
    request: &WorkerRequest,
    scratch_root: &Path,
    cancel: &CancelFlag,
    printed: &mut Vec<String>,
) -> Result<serde_json::Value> {
    std::fs::create_dir_all(scratch_root)?;
    let scratch = tempfile::Builder::new()
        .prefix(&format!("kiln-exec-{}-", request.execution_id))
        .tempdir_in(scratch_root)?;
    let root = scratch.path().join("artifact");
    TarballCodec::extract_bytes(&request.archive, &root)?;

    let module = &request.entrypoint.module;
    let file = resolve_module(&root, module)?;
    let namespace = format!(
        "kiln_exec_{}_{}",
        request.execution_id,
        uuid::Uuid::new_v4().simple()
    );

    let mut loaded = load_module(&root, &file, module, &namespace, cancel)?;
    let result = loaded.invoke(&request.entrypoint.function, &request.payload);
    printed.extend(loaded.take_output());

    if cancel.is_raised() {
        return Err(KilnError::Execution("execution interrupted".into()));
    }
    result
}
