use crate::cmd::{parse_id, runtime, Workspace};
use crate::output::{fmt_time, or_dash, print_fields, print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use cloudopt_core::io;
use cloudopt_core::types::{ExecutionStatus, WorkflowStatus};
use cloudopt_core::workflow::{NewWorkflow, Workflow, WorkflowExecution, WorkflowResult};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

#[derive(Subcommand)]
pub enum WorkflowSubcommand {
    /// Create a workflow from a YAML or JSON definition
    Create {
        #[arg(long)]
        file: PathBuf,
    },

    /// List workflows, oldest first
    List {
        #[arg(long)]
        org: Option<String>,
    },

    /// Show a workflow and its executions
    Show { id: String },

    /// Run an active workflow now
    Run {
        id: String,
        #[arg(long, default_value = "cli")]
        by: String,
    },

    /// Show one workflow execution with its step trail
    Execution { id: String },

    /// Cancel an in-progress execution
    Cancel { execution_id: String },

    /// Activate, deactivate or archive a workflow
    SetStatus { id: String, status: WorkflowStatus },
}

pub fn run(root: &Path, subcmd: WorkflowSubcommand, json: bool) -> anyhow::Result<()> {
    let ws = Workspace::open(root)?;
    let engine = ws.engines.workflows();

    match subcmd {
        WorkflowSubcommand::Create { file } => {
            let new: NewWorkflow = io::read_yaml(&file)
                .with_context(|| format!("failed to load workflow {}", file.display()))?;
            let workflow = engine.create(new)?;
            if json {
                return print_json(&workflow);
            }
            println!(
                "Created workflow {} '{}' with {} step(s)",
                workflow.id,
                workflow.name,
                workflow.steps.len()
            );
        }
        WorkflowSubcommand::List { org } => {
            let workflows = engine.list(org.as_deref())?;
            if json {
                return print_json(&workflows);
            }
            if workflows.is_empty() {
                println!("No workflows.");
                return Ok(());
            }
            let rows = workflows
                .iter()
                .map(|w| {
                    vec![
                        w.id.to_string(),
                        w.name.clone(),
                        w.organization_id.clone(),
                        w.trigger_type.to_string(),
                        w.status.to_string(),
                        w.steps.len().to_string(),
                    ]
                })
                .collect();
            print_table(&["ID", "NAME", "ORG", "TRIGGER", "STATUS", "STEPS"], rows);
        }
        WorkflowSubcommand::Show { id } => {
            let id = parse_id(&id)?;
            let workflow = engine.get(id)?;
            let executions = engine.executions(id)?;
            if json {
                return print_json(&serde_json::json!({
                    "workflow": workflow,
                    "executions": executions,
                }));
            }
            show(&workflow);
            if !executions.is_empty() {
                println!("\nExecutions:");
                let rows = executions
                    .iter()
                    .map(|e| {
                        vec![
                            e.id.to_string(),
                            e.status.to_string(),
                            e.initiator.clone(),
                            fmt_time(Some(e.start_time)),
                            fmt_time(e.end_time),
                        ]
                    })
                    .collect();
                print_table(&["ID", "STATUS", "INITIATOR", "STARTED", "ENDED"], rows);
            }
        }
        WorkflowSubcommand::Run { id, by } => {
            let id = parse_id(&id)?;
            let providers = ws.engines.providers();
            let cancel = CancellationToken::new();
            let result = runtime()?.block_on(async {
                let run = engine.execute(id, providers, &by, &cancel);
                tokio::pin!(run);
                tokio::select! {
                    result = &mut run => result,
                    _ = tokio::signal::ctrl_c() => {
                        eprintln!("interrupted; cancelling the run");
                        cancel.cancel();
                        run.await
                    }
                }
            })?;
            if json {
                print_json(&result)?;
            } else {
                print_run(&result);
            }
            if result.status == ExecutionStatus::Failed {
                anyhow::bail!(
                    "workflow {id} failed: {}",
                    result.message.as_deref().unwrap_or("unknown error")
                );
            }
        }
        WorkflowSubcommand::Execution { id } => {
            let execution = engine.get_execution(parse_id(&id)?)?;
            if json {
                return print_json(&execution);
            }
            show_execution(&execution);
        }
        WorkflowSubcommand::Cancel { execution_id } => {
            let execution = engine.cancel_execution(parse_id(&execution_id)?)?;
            if json {
                return print_json(&execution);
            }
            println!("Cancelled execution {}.", execution.id);
        }
        WorkflowSubcommand::SetStatus { id, status } => {
            let workflow = engine.set_status(parse_id(&id)?, status)?;
            if json {
                return print_json(&workflow);
            }
            println!("Workflow {} is now {}.", workflow.id, workflow.status);
        }
    }
    Ok(())
}

fn show(workflow: &Workflow) {
    print_fields(&[
        ("id", workflow.id.to_string()),
        ("name", workflow.name.clone()),
        ("org", workflow.organization_id.clone()),
        ("description", or_dash(workflow.description.as_deref())),
        ("trigger", workflow.trigger_type.to_string()),
        ("status", workflow.status.to_string()),
        ("last run", fmt_time(workflow.trigger_config.last_execution)),
    ]);
    println!("\nSteps:");
    for (i, step) in workflow.steps.iter().enumerate() {
        println!("  {i}: {:<10} {}", step.kind_name(), or_dash(step.name.as_deref()));
    }
}

fn show_execution(execution: &WorkflowExecution) {
    print_fields(&[
        ("id", execution.id.to_string()),
        ("workflow", execution.workflow_id.to_string()),
        ("status", execution.status.to_string()),
        ("initiator", execution.initiator.clone()),
        ("started", fmt_time(Some(execution.start_time))),
        ("ended", fmt_time(execution.end_time)),
        ("resume at", fmt_time(execution.resume_at)),
        ("message", or_dash(execution.message.as_deref())),
    ]);
    if execution.trail.is_empty() {
        return;
    }
    println!("\nTrail:");
    let rows = execution
        .trail
        .iter()
        .map(|s| {
            vec![
                s.index.to_string(),
                s.kind.clone(),
                s.status.to_string(),
                or_dash(s.message.as_deref()),
            ]
        })
        .collect();
    print_table(&["STEP", "KIND", "STATUS", "MESSAGE"], rows);
}

fn print_run(result: &WorkflowResult) {
    println!(
        "Execution {}: {} after {} step(s)",
        result.execution_id, result.status, result.steps_run
    );
    if let Some(at) = result.resume_at {
        println!("  parked until {}; 'cloudopt tick' or the daemon resumes it", fmt_time(Some(at)));
    }
    if let Some(message) = &result.message {
        println!("  {message}");
    }
}
