use serde::Deserialize;
use serde_json::Value;

use orch_types::EvidenceType;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerEvidenceItem {
    #[serde(rename = "type")]
    pub evidence_type: EvidenceType,
    pub payload: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerOutput {
    pub result_json: Value,
    #[serde(default)]
    pub evidence: Vec<WorkerEvidenceItem>,
}
