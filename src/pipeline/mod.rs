//! Email batch pipeline.
//!
//! Every run drives a batch through a linear chain of stages:
//! 1. `ExtractStage`: fetch from the mail store or the persisted store
//! 2. `TransformStage`: categorize each email
//! 3. `LoadStage`: resolve and apply category actions
//! 4. `SyncStage`: upsert enriched records and request the metrics export
//!
//! The [`Orchestrator`] owns sequencing and the continue/abort policy; custom
//! stages can be spliced into the [`StageChain`] before a run starts.

pub mod extract;
pub mod factory;
pub mod load;
pub mod orchestrator;
pub mod retry;
pub mod stage;
pub mod sync;
pub mod transform;
pub mod types;

pub use factory::{Collaborators, build_orchestrator, standard_chain};
pub use orchestrator::{Orchestrator, RunReport, StageChain};
pub use stage::Stage;
pub use types::{Batch, EmailRecord, EnrichedEmailRecord, ItemFailure, StageResult};
