use serde::{Deserialize, Serialize};
use thiserror::Error;

use orch_types::parse_checklist_ids;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Plan,
    Act,
    Check,
    Fix,
    Report,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Plan => "plan",
            Stage::Act => "act",
            Stage::Check => "check",
            Stage::Fix => "fix",
            Stage::Report => "report",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedTask {
    pub task_id: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanOutput {
    pub implementation_plan_md: String,
    pub tasks: Vec<PlannedTask>,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerDispatchItem {
    pub task_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchOutput {
    pub worker_dispatch: Vec<WorkerDispatchItem>,
    pub notes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckOutput {
    pub status: CheckStatus,
    #[serde(default)]
    pub failed_criteria: Vec<String>,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportArtifact {
    pub kind: String,
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportOutput {
    pub summary: String,
    #[serde(default)]
    pub artifacts: Vec<ReportArtifact>,
}

#[derive(Debug, Clone)]
pub enum StageOutput {
    Plan(PlanOutput),
    Act(DispatchOutput),
    Check(CheckOutput),
    Fix(DispatchOutput),
    Report(ReportOutput),
}

#[derive(Debug, Error)]
pub enum StageOutputError {
    #[error("malformed orchestrator output: {0}")]
    Malformed(String),
    #[error("task id '{0}' in PLAN output does not appear in its own checklist markdown")]
    TaskIdNotInChecklist(String),
}

/// Parses a stage's raw JSON text into its typed output and, for PLAN,
/// cross-checks every declared `taskId` against the checklist grammar
/// parsed from `implementationPlanMd` (§4.4).
pub fn parse_stage_output(stage: Stage, raw: &str) -> Result<StageOutput, StageOutputError> {
    match stage {
        Stage::Plan => {
            let output: PlanOutput =
                serde_json::from_str(raw).map_err(|err| StageOutputError::Malformed(err.to_string()))?;
            let checklist_ids = parse_checklist_ids(&output.implementation_plan_md);
            for task in &output.tasks {
                if !checklist_ids.contains(&task.task_id) {
                    return Err(StageOutputError::TaskIdNotInChecklist(task.task_id.clone()));
                }
            }
            Ok(StageOutput::Plan(output))
        }
        Stage::Act => serde_json::from_str(raw)
            .map(StageOutput::Act)
            .map_err(|err| StageOutputError::Malformed(err.to_string())),
        Stage::Check => serde_json::from_str(raw)
            .map(StageOutput::Check)
            .map_err(|err| StageOutputError::Malformed(err.to_string())),
        Stage::Fix => serde_json::from_str(raw)
            .map(StageOutput::Fix)
            .map_err(|err| StageOutputError::Malformed(err.to_string())),
        Stage::Report => serde_json::from_str(raw)
            .map(StageOutput::Report)
            .map_err(|err| StageOutputError::Malformed(err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plan_output_with_matching_task_ids() {
        let raw = r#"{
            "implementationPlanMd": "- [ ] T1: build it\n",
            "tasks": [{"taskId": "T1", "description": "build it"}],
            "summary": "ready"
        }"#;
        let output = parse_stage_output(Stage::Plan, raw).unwrap();
        assert!(matches!(output, StageOutput::Plan(_)));
    }

    #[test]
    fn rejects_plan_task_id_missing_from_checklist() {
        let raw = r#"{
            "implementationPlanMd": "- [ ] T1: build it\n",
            "tasks": [{"taskId": "T2", "description": "ghost"}],
            "summary": "ready"
        }"#;
        let err = parse_stage_output(Stage::Plan, raw).unwrap_err();
        assert!(matches!(err, StageOutputError::TaskIdNotInChecklist(id) if id == "T2"));
    }

    #[test]
    fn rejects_malformed_check_output() {
        let err = parse_stage_output(Stage::Check, "not json").unwrap_err();
        assert!(matches!(err, StageOutputError::Malformed(_)));
    }

    #[test]
    fn parses_check_fail_with_failed_criteria() {
        let raw = r#"{"status": "fail", "failedCriteria": ["dc1"], "summary": "nope"}"#;
        let output = parse_stage_output(Stage::Check, raw).unwrap();
        match output {
            StageOutput::Check(check) => {
                assert_eq!(check.status, CheckStatus::Fail);
                assert_eq!(check.failed_criteria, vec!["dc1".to_string()]);
            }
            _ => panic!("expected check output"),
        }
    }
}
