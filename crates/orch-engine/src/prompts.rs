use orch_stages::Stage;
use orch_types::OrchestrationPackage;

/// Every orchestrator-agent prompt carries a leading `STAGE:<name>` marker
/// line so an adapter (in particular the mock) can key its response on the
/// stage without the `AgentAdapter` trait itself knowing about stages.
pub fn stage_prompt(stage: Stage, pkg: &OrchestrationPackage, iteration: u32, retry_hint: Option<&str>) -> String {
    let mut prompt = format!("STAGE:{}\n", stage.as_str());
    prompt.push_str(&format!("objective: {}\n", pkg.objective.title));
    prompt.push_str(&format!("description: {}\n", pkg.objective.description));
    prompt.push_str(&format!("iteration: {iteration}\n"));
    if let Some(hint) = retry_hint {
        prompt.push_str(&format!("previous attempt was rejected: {hint}\n"));
    }
    prompt
}

/// Worker prompts carry a leading `WORKER_TASK:<id>` marker for the same
/// reason.
pub fn worker_prompt(task_id: &str, description: &str, retry_hint: Option<&str>) -> String {
    let mut prompt = format!("WORKER_TASK:{task_id}\n");
    prompt.push_str(&format!("description: {description}\n"));
    if let Some(hint) = retry_hint {
        prompt.push_str(&format!("previous attempt failed: {hint}\n"));
    }
    prompt
}
