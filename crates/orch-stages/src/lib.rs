pub mod output;
pub mod sequence;

pub use output::{
    parse_stage_output, CheckOutput, CheckStatus, DispatchOutput, PlanOutput, PlannedTask,
    ReportArtifact, ReportOutput, Stage, StageOutput, StageOutputError, WorkerDispatchItem,
};
pub use sequence::{StageOutcome, StageSequencer};
