//! The stage contract.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::context::RunContext;
use crate::error::StageError;
use crate::pipeline::types::{Batch, StageResult};

pub const EXTRACT: &str = "extract";
pub const TRANSFORM: &str = "transform";
pub const LOAD: &str = "load";
pub const SYNC: &str = "sync";

/// One unit of the pipeline chain.
///
/// The orchestrator calls `validate_input` first and never calls `execute`
/// when it returns false. `execute` processes items independently: a failed
/// item goes into `StageResult::failures` and the rest of the batch carries
/// on. Returning `Err` means the whole batch failed (no successes).
#[async_trait]
pub trait Stage: Send + Sync {
    fn validate_input(&self, batch: &Batch) -> bool;

    async fn execute(&self, batch: Batch, ctx: &mut RunContext) -> Result<StageResult, StageError>;
}

/// Item ids must be unique within a batch.
pub fn has_unique_ids(batch: &Batch) -> bool {
    let ids = batch.ids();
    let unique: HashSet<&String> = ids.iter().collect();
    unique.len() == ids.len()
}
