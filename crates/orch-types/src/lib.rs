pub mod checklist;
pub mod event;
pub mod package;
pub mod run;
pub mod task;
pub mod validate;

pub use checklist::parse_checklist_ids;
pub use event::{event_type, Event};
pub use package::*;
pub use run::{Run, RunCounters, RunStatus};
pub use task::{Artifact, Evidence, EvidenceType, ResultRecord, Task, TaskStatus};
pub use validate::{validate, ValidationError};

/// Returns the current time as an RFC 3339 UTC string.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
