use crate::cmd::{parse_time, runtime, Workspace};
use crate::output::print_json;
use chrono::Utc;
use std::path::Path;
use tokio_util::sync::CancellationToken;

/// One scheduler pass: expire stale recommendations, run due actions and
/// start or resume workflows.
pub fn run(root: &Path, at: Option<&str>, recover: bool, json: bool) -> anyhow::Result<()> {
    let ws = Workspace::open(root)?;
    let now = at.map(parse_time).transpose()?.unwrap_or_else(Utc::now);

    let recovery = if recover {
        Some(ws.engines.startup_recovery(now)?)
    } else {
        None
    };
    let report = runtime()?.block_on(ws.engines.tick(now, &CancellationToken::new()))?;

    if json {
        return print_json(&serde_json::json!({
            "recovery": recovery,
            "report": report,
        }));
    }

    if let Some(r) = recovery {
        println!(
            "Recovered {} action(s), {} workflow execution(s).",
            r.actions, r.workflow_executions
        );
    }
    if report.is_idle() {
        println!("Nothing to do.");
        return Ok(());
    }
    if !report.expired_recommendations.is_empty() {
        println!(
            "Expired {} recommendation(s).",
            report.expired_recommendations.len()
        );
    }
    for result in &report.actions {
        println!(
            "action   {}  {:<11} {}",
            result.action_id,
            result.status.as_str(),
            result.message
        );
    }
    for result in &report.workflows {
        let note = match (result.resume_at, result.message.as_deref()) {
            (Some(at), _) => format!("parked until {}", at.to_rfc3339()),
            (None, Some(message)) => message.to_string(),
            (None, None) => format!("{} step(s)", result.steps_run),
        };
        println!(
            "workflow {}  {:<11} {note}",
            result.workflow_id,
            result.status.as_str()
        );
    }
    Ok(())
}
