use crate::cmd::{parse_id, parse_time, runtime, Workspace};
use crate::output::{fmt_time, or_dash, print_fields, print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use cloudopt_core::action::{Action, NewAction};
use cloudopt_core::execution::{ActionFilter, ExecutionResult};
use cloudopt_core::recommendation::ResourceRef;
use cloudopt_core::types::{ActionKind, ActionStatus};
use serde_json::{Map, Value};
use std::path::Path;

#[derive(Subcommand)]
pub enum ActionSubcommand {
    /// Create an action that applies an open recommendation
    FromRec {
        recommendation_id: String,
        /// Create the action pre-approved
        #[arg(long)]
        no_approval: bool,
        /// Run no earlier than this RFC 3339 time
        #[arg(long)]
        at: Option<String>,
        #[arg(long, default_value = "cli")]
        by: String,
    },

    /// Create an action directly
    Create {
        #[arg(long)]
        account: String,
        #[arg(long = "type")]
        action_type: ActionKind,
        #[arg(long)]
        resource: Option<String>,
        /// Resource kind, e.g. ec2_instance
        #[arg(long, requires = "resource")]
        kind: Option<String>,
        /// Parameters as a JSON object
        #[arg(long)]
        params: Option<String>,
        #[arg(long)]
        no_approval: bool,
        #[arg(long)]
        at: Option<String>,
        #[arg(long, default_value = "cli")]
        by: String,
    },

    /// Approve a pending action
    Approve {
        id: String,
        #[arg(long, default_value = "cli")]
        by: String,
        #[arg(long)]
        comment: Option<String>,
    },

    /// Reject a pending action
    Reject {
        id: String,
        #[arg(long, default_value = "cli")]
        by: String,
        #[arg(long)]
        comment: Option<String>,
    },

    /// Cancel a pending or failed action
    Cancel { id: String },

    /// Set the scheduled time of one or more actions
    Schedule {
        #[arg(required = true)]
        ids: Vec<String>,
        /// RFC 3339 time
        #[arg(long)]
        at: String,
    },

    /// Run an action now against its account's provider
    Execute {
        id: String,
        #[arg(long, default_value = "cli")]
        by: String,
    },

    /// List actions
    List {
        #[arg(long)]
        account: Option<String>,
        #[arg(long)]
        status: Option<ActionStatus>,
    },

    /// Show an action with its approvals and executions
    Show { id: String },
}

pub fn run(root: &Path, subcmd: ActionSubcommand, json: bool) -> anyhow::Result<()> {
    let ws = Workspace::open(root)?;
    let engine = ws.engines.actions();

    match subcmd {
        ActionSubcommand::FromRec {
            recommendation_id,
            no_approval,
            at,
            by,
        } => {
            let scheduled = at.as_deref().map(parse_time).transpose()?;
            let action = engine.create_from_recommendation(
                parse_id(&recommendation_id)?,
                !no_approval,
                &by,
                scheduled,
            )?;
            created(&action, json)
        }
        ActionSubcommand::Create {
            account,
            action_type,
            resource,
            kind,
            params,
            no_approval,
            at,
            by,
        } => {
            let parameters = match params {
                Some(raw) => serde_json::from_str::<Map<String, Value>>(&raw)
                    .context("--params must be a JSON object")?,
                None => Map::new(),
            };
            let action = engine.create(NewAction {
                account_id: account,
                resource: resource
                    .map(|id| ResourceRef::new(id, kind.unwrap_or_else(|| "unknown".to_string()))),
                action_type,
                parameters,
                requires_approval: !no_approval,
                scheduled_time: at.as_deref().map(parse_time).transpose()?,
                recommendation_id: None,
                retry: None,
                created_by: by,
            })?;
            created(&action, json)
        }
        ActionSubcommand::Approve { id, by, comment } => {
            let action = engine.approve(parse_id(&id)?, &by, comment)?;
            if json {
                return print_json(&action);
            }
            println!("Approved action {} as {by}.", action.id);
            Ok(())
        }
        ActionSubcommand::Reject { id, by, comment } => {
            let action = engine.reject(parse_id(&id)?, &by, comment)?;
            if json {
                return print_json(&action);
            }
            println!("Rejected action {} as {by}.", action.id);
            Ok(())
        }
        ActionSubcommand::Cancel { id } => {
            let action = engine.cancel(parse_id(&id)?)?;
            if json {
                return print_json(&action);
            }
            println!("Cancelled action {}.", action.id);
            Ok(())
        }
        ActionSubcommand::Schedule { ids, at } => {
            let ids = ids.iter().map(|id| parse_id(id)).collect::<anyhow::Result<Vec<_>>>()?;
            let actions = engine.schedule(&ids, parse_time(&at)?)?;
            if json {
                return print_json(&actions);
            }
            println!("Scheduled {} action(s) for {at}.", actions.len());
            Ok(())
        }
        ActionSubcommand::Execute { id, by } => {
            let id = parse_id(&id)?;
            let action = engine.get(id)?;
            let provider = ws.provider(&action.account_id)?;
            let result = runtime()?.block_on(engine.execute(id, provider.as_ref(), &by))?;
            if json {
                print_json(&result)?;
            } else {
                print_result(&result);
            }
            if !result.succeeded() {
                anyhow::bail!("action {id} failed: {}", result.message);
            }
            Ok(())
        }
        ActionSubcommand::List { account, status } => {
            let actions = engine.list(&ActionFilter {
                account_id: account,
                status,
                recommendation_id: None,
            })?;
            if json {
                return print_json(&actions);
            }
            if actions.is_empty() {
                println!("No actions.");
                return Ok(());
            }
            let rows = actions
                .iter()
                .map(|a| {
                    vec![
                        a.id.to_string(),
                        a.action_type.to_string(),
                        a.account_id.clone(),
                        or_dash(a.resource.as_ref().map(|r| r.id.as_str())),
                        a.status.to_string(),
                        a.approval_status.to_string(),
                        fmt_time(a.scheduled_time),
                    ]
                })
                .collect();
            print_table(
                &["ID", "TYPE", "ACCOUNT", "RESOURCE", "STATUS", "APPROVAL", "SCHEDULED"],
                rows,
            );
            Ok(())
        }
        ActionSubcommand::Show { id } => {
            let id = parse_id(&id)?;
            let action = engine.get(id)?;
            let approvals = engine.approvals(id)?;
            let executions = engine.executions(id)?;
            if json {
                return print_json(&serde_json::json!({
                    "action": action,
                    "approvals": approvals,
                    "executions": executions,
                }));
            }
            show(&action);
            if !approvals.is_empty() {
                println!("\nApprovals:");
                for a in &approvals {
                    println!(
                        "  {}  {:<9} {}{}",
                        fmt_time(Some(a.created_at)),
                        a.decision.as_str(),
                        a.approver,
                        a.comment.as_deref().map(|c| format!(" ({c})")).unwrap_or_default()
                    );
                }
            }
            if !executions.is_empty() {
                println!("\nExecutions:");
                for e in &executions {
                    println!(
                        "  #{} {}  {:<11} {}",
                        e.attempt,
                        fmt_time(Some(e.start_time)),
                        e.status.as_str(),
                        e.logs
                    );
                }
            }
            Ok(())
        }
    }
}

fn created(action: &Action, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(action);
    }
    println!("Created action {}", action.id);
    if action.requires_approval {
        println!("  approval required: cloudopt action approve {}", action.id);
    }
    Ok(())
}

fn show(action: &Action) {
    print_fields(&[
        ("id", action.id.to_string()),
        ("type", action.action_type.to_string()),
        ("account", action.account_id.clone()),
        (
            "resource",
            action
                .resource
                .as_ref()
                .map(|r| format!("{} ({})", r.id, r.kind))
                .unwrap_or_else(|| "-".to_string()),
        ),
        ("status", action.status.to_string()),
        ("approval", action.approval_status.to_string()),
        ("attempts", format!("{}/{}", action.attempts, action.retry.max_attempts)),
        ("scheduled", fmt_time(action.scheduled_time)),
        ("next attempt", fmt_time(action.next_attempt_at)),
        ("created by", action.created_by.clone()),
        (
            "recommendation",
            action
                .recommendation_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string()),
        ),
    ]);
}

fn print_result(result: &ExecutionResult) {
    println!("Action {} attempt {}: {}", result.action_id, result.attempt, result.status);
    println!("  {}", result.message);
    if result.recommendation_applied {
        println!("  recommendation marked applied");
    }
    if let Some(at) = result.next_attempt_at {
        println!("  next retry after {}", fmt_time(Some(at)));
    }
}
