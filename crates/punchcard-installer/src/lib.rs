mod apply;
mod archive;
mod fetch;
mod migrate;
mod pipeline;
mod run_state;
mod types;
mod verify;

pub use apply::{apply_tree, ApplySummary, ProtectedPaths};
pub use archive::{
    detect_archive_kind, extract_artifact, inspect_artifact, locate_payload_root, ArchiveKind,
    ArtifactExpectations, ArtifactFacts,
};
pub use fetch::{ArtifactFetcher, HttpFetcher};
pub use migrate::{
    Migration, MigrationContext, MigrationSet, MigrationWarning, RecordUpdateHistory,
};
pub use pipeline::{new_run_id, pipeline_status, UpdatePipeline};
pub use run_state::{
    clear_active_marker, read_active_marker, read_run_state, write_run_state, RunGuard,
};
pub use types::{
    FailureCause, PipelineStage, PipelineStatus, RunOutcome, RunReport, RunState, StageRecord,
};
pub use verify::{verify_system, SqliteProbe, StoreProbe};

#[cfg(test)]
mod tests;
