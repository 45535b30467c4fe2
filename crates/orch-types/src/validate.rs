use std::collections::HashSet;

use serde::Serialize;
use serde_json::Value;

use crate::package::OrchestrationPackage;

/// A single validation failure, carrying a JSON-pointer-style path so a
/// caller can pinpoint the offending field.
#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[error("{path}: {message}")]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl ValidationError {
    fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Validates a raw JSON payload against the OrchestrationPackage schema.
/// Returns the typed package on success, or the full list of field errors
/// (not just the first) on failure.
pub fn validate(raw: &Value) -> Result<OrchestrationPackage, Vec<ValidationError>> {
    let mut errors = Vec::new();

    let pkg: OrchestrationPackage = match serde_path_to_error::deserialize(raw.clone()) {
        Ok(pkg) => pkg,
        Err(err) => {
            let path = err.path().to_string();
            let path = if path.is_empty() || path == "." {
                "/".to_string()
            } else {
                format!("/{}", path.replace('.', "/"))
            };
            errors.push(ValidationError::new(path, format!("{}", err.inner())));
            return Err(errors);
        }
    };

    if pkg.package_version.trim().is_empty() {
        errors.push(ValidationError::new("/packageVersion", "must not be empty"));
    }

    if pkg.objective.title.trim().is_empty() {
        errors.push(ValidationError::new("/objective/title", "must not be empty"));
    }
    if pkg.objective.description.trim().is_empty() {
        errors.push(ValidationError::new(
            "/objective/description",
            "must not be empty",
        ));
    }
    if pkg.objective.done_criteria.is_empty() {
        errors.push(ValidationError::new(
            "/objective/doneCriteria",
            "must contain at least one entry",
        ));
    }
    let mut seen_criteria = HashSet::new();
    for (i, criterion) in pkg.objective.done_criteria.iter().enumerate() {
        if criterion.id.trim().is_empty() {
            errors.push(ValidationError::new(
                format!("/objective/doneCriteria/{i}/id"),
                "must not be empty",
            ));
        } else if !seen_criteria.insert(criterion.id.clone()) {
            errors.push(ValidationError::new(
                format!("/objective/doneCriteria/{i}/id"),
                format!("duplicate doneCriteria id '{}'", criterion.id),
            ));
        }
        for (j, ty) in criterion.required_evidence_types.iter().enumerate() {
            if !is_known_evidence_type(ty) {
                errors.push(ValidationError::new(
                    format!("/objective/doneCriteria/{i}/requiredEvidenceTypes/{j}"),
                    format!("unknown evidence type '{ty}'"),
                ));
            }
        }
    }

    validate_model_ref(&pkg.agents.orchestrator.model, "/agents/orchestrator/model", &mut errors);
    validate_model_ref(&pkg.agents.worker.model, "/agents/worker/model", &mut errors);

    let mut seen_skills = HashSet::new();
    for (i, skill) in pkg.registries.skills.iter().enumerate() {
        if skill.id.trim().is_empty() {
            errors.push(ValidationError::new(
                format!("/registries/skills/{i}/id"),
                "must not be empty",
            ));
        } else if !seen_skills.insert(skill.id.clone()) {
            errors.push(ValidationError::new(
                format!("/registries/skills/{i}/id"),
                format!("duplicate skill id '{}'", skill.id),
            ));
        }
    }

    let limits = &pkg.run_policy.limits;
    if limits.max_orchestrator_iterations < 1 {
        errors.push(ValidationError::new(
            "/runPolicy/limits/maxOrchestratorIterations",
            "must be >= 1",
        ));
    }
    if limits.max_worker_iterations < 1 {
        errors.push(ValidationError::new(
            "/runPolicy/limits/maxWorkerIterations",
            "must be >= 1",
        ));
    }
    if limits.max_run_wall_clock_ms == 0 {
        errors.push(ValidationError::new(
            "/runPolicy/limits/maxRunWallClockMs",
            "must be > 0",
        ));
    }

    if pkg.run_policy.concurrency.max_workers < 1 {
        errors.push(ValidationError::new(
            "/runPolicy/concurrency/maxWorkers",
            "must be >= 1",
        ));
    }

    if pkg.run_policy.timeouts.worker_task_ms == 0 {
        errors.push(ValidationError::new(
            "/runPolicy/timeouts/workerTaskMs",
            "must be > 0",
        ));
    }
    if pkg.run_policy.timeouts.orchestrator_step_ms == 0 {
        errors.push(ValidationError::new(
            "/runPolicy/timeouts/orchestratorStepMs",
            "must be > 0",
        ));
    }

    if pkg.run_policy.budget.max_cost_usd < 0.0 {
        errors.push(ValidationError::new(
            "/runPolicy/budget/maxCostUsd",
            "must be >= 0",
        ));
    }

    if let Some(preview) = &pkg.preview {
        if preview.enabled && preview.command.trim().is_empty() {
            errors.push(ValidationError::new("/preview/command", "must not be empty when preview is enabled"));
        }
        if preview.enabled && preview.ready_path.trim().is_empty() {
            errors.push(ValidationError::new("/preview/readyPath", "must not be empty when preview is enabled"));
        }
    }

    if errors.is_empty() {
        Ok(pkg)
    } else {
        Err(errors)
    }
}

fn validate_model_ref(model: &str, path: &str, errors: &mut Vec<ValidationError>) {
    match model.split_once('/') {
        Some((provider, id)) if !provider.is_empty() && !id.is_empty() => {}
        _ => errors.push(ValidationError::new(
            path,
            "must match '<provider>/<id>'",
        )),
    }
}

fn is_known_evidence_type(ty: &str) -> bool {
    matches!(ty, "log_excerpt" | "diff" | "file_ref" | "test_report" | "url")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_package() -> Value {
        json!({
            "packageVersion": "0.1.0",
            "metadata": {"packageId": "p1", "createdAt": "2026-08-01T00:00:00Z", "createdBy": "tester"},
            "objective": {
                "title": "t",
                "description": "d",
                "inputs": {},
                "doneCriteria": [{"id": "dc1", "description": "d1", "requiredEvidenceTypes": ["log_excerpt"]}]
            },
            "agents": {
                "orchestrator": {"name": "o", "model": "anthropic/orch", "systemPromptRef": "p"},
                "worker": {"name": "w", "model": "anthropic/worker", "systemPromptRef": "p"}
            },
            "registries": {"skills": [], "variables": []},
            "runPolicy": {
                "limits": {"maxOrchestratorIterations": 1, "maxWorkerIterations": 1, "maxRunWallClockMs": 60000},
                "retries": {"maxWorkerTaskRetries": 1, "maxMalformedOutputRetries": 1},
                "concurrency": {"maxWorkers": 1},
                "timeouts": {"workerTaskMs": 1000, "orchestratorStepMs": 1000},
                "budget": {"maxTokens": 1000, "maxCostUsd": 1.0},
                "determinism": {"enforceStageOrder": true, "requireStrictJson": true, "singleSessionPerRun": true}
            }
        })
    }

    #[test]
    fn accepts_valid_package() {
        assert!(validate(&valid_package()).is_ok());
    }

    #[test]
    fn rejects_missing_objective() {
        let mut raw = valid_package();
        raw.as_object_mut().unwrap().remove("objective");
        let errs = validate(&raw).unwrap_err();
        assert!(errs.iter().any(|e| e.path.contains("objective")));
    }

    #[test]
    fn rejects_zero_max_workers() {
        let mut raw = valid_package();
        raw["runPolicy"]["concurrency"]["maxWorkers"] = json!(0);
        let errs = validate(&raw).unwrap_err();
        assert!(errs.iter().any(|e| e.path == "/runPolicy/concurrency/maxWorkers"));
    }

    #[test]
    fn rejects_bad_model_ref() {
        let mut raw = valid_package();
        raw["agents"]["orchestrator"]["model"] = json!("no-slash-here");
        let errs = validate(&raw).unwrap_err();
        assert!(errs.iter().any(|e| e.path == "/agents/orchestrator/model"));
    }

    #[test]
    fn rejects_duplicate_done_criteria_ids() {
        let mut raw = valid_package();
        raw["objective"]["doneCriteria"] = json!([
            {"id": "dc1", "description": "a", "requiredEvidenceTypes": []},
            {"id": "dc1", "description": "b", "requiredEvidenceTypes": []}
        ]);
        let errs = validate(&raw).unwrap_err();
        assert!(errs.iter().any(|e| e.message.contains("duplicate")));
    }
}
