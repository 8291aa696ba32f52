use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;

/// A single line of tofu `-json` output.
#[derive(Debug, Deserialize)]
pub struct TofuJsonLine {
    #[serde(rename = "@level")]
    pub level: Option<String>,
    #[serde(rename = "@message")]
    pub message: Option<String>,
    #[serde(rename = "type")]
    pub line_type: Option<String>,
    pub change: Option<TofuChange>,
    pub changes: Option<ChangeSummary>,
    pub diagnostic: Option<TofuDiagnostic>,
}

/// A planned change to one resource.
#[derive(Debug, Deserialize)]
pub struct TofuChange {
    pub resource: Option<TofuResource>,
    pub action: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TofuResource {
    pub addr: Option<String>,
    pub resource_type: Option<String>,
}

/// Totals line emitted at the end of a plan or apply.
#[derive(Debug, Deserialize)]
pub struct ChangeSummary {
    #[serde(default)]
    pub add: usize,
    #[serde(default)]
    pub change: usize,
    #[serde(default)]
    pub remove: usize,
}

/// A diagnostic (error/warning).
#[derive(Debug, Deserialize)]
pub struct TofuDiagnostic {
    pub severity: Option<String>,
    pub summary: Option<String>,
    pub detail: Option<String>,
}

/// Summary of changes from a plan.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PlanSummary {
    pub to_add: usize,
    pub to_change: usize,
    pub to_destroy: usize,
}

fn plain_plan_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Plan: (\d+) to add, (\d+) to change, (\d+) to destroy\.").unwrap())
}

/// Parse plan output into a change summary.
///
/// Uses the `change_summary` line when present, otherwise counts
/// `planned_change` lines, otherwise falls back to the human readable
/// `Plan: ...` line. "No changes." yields all zeros.
pub fn parse_plan_output(lines: &[String]) -> PlanSummary {
    let mut counted = PlanSummary::default();
    let mut saw_json = false;

    for line in lines {
        let Ok(parsed) = serde_json::from_str::<TofuJsonLine>(line) else {
            continue;
        };
        saw_json = true;
        if parsed.line_type.as_deref() == Some("change_summary") {
            if let Some(c) = parsed.changes {
                return PlanSummary {
                    to_add: c.add,
                    to_change: c.change,
                    to_destroy: c.remove,
                };
            }
        }
        if parsed.line_type.as_deref() != Some("planned_change") {
            continue;
        }
        match parsed.change.as_ref().and_then(|c| c.action.as_deref()) {
            Some("create") => counted.to_add += 1,
            Some("update") => counted.to_change += 1,
            Some("delete") => counted.to_destroy += 1,
            Some("replace") => {
                counted.to_add += 1;
                counted.to_destroy += 1;
            }
            _ => {}
        }
    }

    if saw_json {
        return counted;
    }

    for line in lines {
        if let Some(caps) = plain_plan_regex().captures(line) {
            let n = |i: usize| caps.get(i).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
            return PlanSummary {
                to_add: n(1),
                to_change: n(2),
                to_destroy: n(3),
            };
        }
    }
    PlanSummary::default()
}

/// Extract error diagnostics from JSON output.
pub fn extract_errors(lines: &[String]) -> Vec<String> {
    let mut errors = Vec::new();

    for line in lines {
        if let Ok(parsed) = serde_json::from_str::<TofuJsonLine>(line) {
            if let Some(diag) = &parsed.diagnostic {
                if diag.severity.as_deref() == Some("error") {
                    let summary = diag.summary.as_deref().unwrap_or("Unknown error");
                    match diag.detail.as_deref().filter(|d| !d.is_empty()) {
                        Some(detail) => errors.push(format!("{summary}: {detail}")),
                        None => errors.push(summary.to_string()),
                    }
                }
            }
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn change_summary_wins() {
        let out = lines(&[
            r#"{"@level":"info","type":"planned_change","change":{"resource":{"addr":"a.b"},"action":"create"}}"#,
            r#"{"@level":"info","type":"change_summary","changes":{"add":1,"change":2,"remove":3,"operation":"plan"}}"#,
        ]);
        assert_eq!(
            parse_plan_output(&out),
            PlanSummary { to_add: 1, to_change: 2, to_destroy: 3 }
        );
    }

    #[test]
    fn counts_planned_changes() {
        let out = lines(&[
            r#"{"type":"planned_change","change":{"action":"replace"}}"#,
            r#"{"type":"planned_change","change":{"action":"delete"}}"#,
        ]);
        let s = parse_plan_output(&out);
        assert_eq!(s.to_add, 1);
        assert_eq!(s.to_destroy, 2);
    }

    #[test]
    fn plain_text_fallback() {
        let out = lines(&["", "Plan: 0 to add, 1 to change, 4 to destroy."]);
        assert_eq!(parse_plan_output(&out).to_destroy, 4);
        assert_eq!(parse_plan_output(&lines(&["No changes."])), PlanSummary::default());
    }

    #[test]
    fn errors_from_diagnostics() {
        let out = lines(&[
            r#"{"@level":"error","type":"diagnostic","diagnostic":{"severity":"error","summary":"Invalid reference","detail":"var.x"}}"#,
            r#"{"@level":"warn","type":"diagnostic","diagnostic":{"severity":"warning","summary":"deprecated"}}"#,
        ]);
        assert_eq!(extract_errors(&out), vec!["Invalid reference: var.x"]);
    }
}
