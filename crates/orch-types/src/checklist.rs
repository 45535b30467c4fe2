use regex::Regex;
use std::sync::OnceLock;

/// Matches a markdown checklist line such as `- [ ] TASK-1: do the thing`
/// and captures the task ID grammar named in the implementation-plan
/// checklist ID glossary entry.
fn checklist_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^[-*]\s+\[[ xX]\]\s+([A-Za-z][A-Za-z0-9_-]{0,31})(?:\b|:)").unwrap()
    })
}

/// Parses every implementation-plan checklist ID out of `markdown`,
/// preserving first-seen order and de-duplicating repeats.
pub fn parse_checklist_ids(markdown: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut ids = Vec::new();
    for cap in checklist_regex().captures_iter(markdown) {
        let id = cap[1].to_string();
        if seen.insert(id.clone()) {
            ids.push(id);
        }
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_checklist() {
        let md = "- [ ] TASK-1: write the parser\n* [x] TASK_2 ship it\n";
        assert_eq!(parse_checklist_ids(md), vec!["TASK-1", "TASK_2"]);
    }

    #[test]
    fn ignores_non_checklist_lines() {
        let md = "plain text\n- not a checklist\n1. [ ] TASK-3 numbered list isn't matched\n";
        assert!(parse_checklist_ids(md).is_empty());
    }

    #[test]
    fn dedups_repeated_ids() {
        let md = "- [ ] A1 first mention\n- [x] A1 second mention\n";
        assert_eq!(parse_checklist_ids(md), vec!["A1"]);
    }
}
