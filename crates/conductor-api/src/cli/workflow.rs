//! CLI workflow subcommands: submit, run, status, list, delete, example.

use std::path::Path;

use anyhow::{bail, Context, Result};
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;
use uuid::Uuid;

use conductor_core::workflow::engine::{EngineError, ExecutionReport};
use conductor_types::workflow::{DocumentFormat, StepStatus, Workflow, WorkflowStatus};

use super::{FormatArg, StatusArg, Template};
use crate::state::AppState;
use crate::templates;

fn short_id(id: &Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

fn parse_id(id: &str) -> Result<Uuid> {
    id.parse::<Uuid>()
        .with_context(|| format!("'{id}' is not a workflow id"))
}

// ---------------------------------------------------------------------------
// Submit
// ---------------------------------------------------------------------------

pub async fn submit(state: &AppState, file: &Path, json: bool) -> Result<()> {
    let format = DocumentFormat::from_path(file)?;
    let text = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let id = state
        .engine
        .submit(&text, format)
        .await
        .with_context(|| format!("Failed to submit {}", file.display()))?;

    if json {
        println!("{}", serde_json::json!({ "id": id.to_string(), "status": "pending" }));
    } else {
        println!();
        println!(
            "  {} Submitted workflow {}",
            style("*").green().bold(),
            style(id).cyan()
        );
        println!(
            "  Run it with: {}",
            style(format!("cndr run {id}")).dim()
        );
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Resolve a run target: an existing file, then a stored id, then a stored name.
async fn load_target(state: &AppState, target: &str) -> Result<Workflow> {
    let path = Path::new(target);
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        let workflow = Workflow::load_from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?;
        workflow.validate()?;
        return Ok(workflow);
    }

    let found = match target.parse::<Uuid>() {
        Ok(id) => state.engine.load(&id).await,
        Err(_) => state.engine.load_by_name(target).await,
    };
    match found {
        Ok(workflow) => Ok(workflow),
        Err(EngineError::NotFound(_)) => {
            bail!("No workflow file, id, or name matches '{target}'")
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn run(state: &AppState, target: &str, json: bool) -> Result<()> {
    let mut workflow = load_target(state, target).await?;
    let id = workflow.id;

    if !json {
        println!();
        println!(
            "  {} Running '{}' ({} steps)",
            style(">").cyan().bold(),
            style(&workflow.name).cyan(),
            workflow.steps.len()
        );
    }

    // Ctrl+C requests cooperative cancellation; in-flight steps finish.
    let engine = state.engine.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            engine.cancel(&id);
        }
    });
    let outcome = state.engine.execute(&mut workflow).await;
    watcher.abort();
    let report = outcome.with_context(|| format!("Failed to execute workflow {id}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report_json(&workflow, &report))?);
    } else {
        println!();
        println!("{}", steps_table(&workflow));
        println!();
        println!("  Status: {}", format_status(report.status).content());
        if let Some(err) = &report.error {
            println!("  Error: {}", style(err).red());
        }
        println!();
    }

    match report.status {
        WorkflowStatus::Completed => Ok(()),
        status => bail!("workflow {} {status}", short_id(&id)),
    }
}

fn report_json(workflow: &Workflow, report: &ExecutionReport) -> serde_json::Value {
    serde_json::json!({
        "id": report.workflow_id.to_string(),
        "name": workflow.name,
        "status": report.status.as_str(),
        "error": report.error,
        "variables": workflow.variables,
        "steps": report.steps.iter().map(|s| serde_json::json!({
            "id": s.step_id,
            "status": s.status.as_str(),
            "attempts": s.attempts,
            "result": s.result,
            "error": s.error,
        })).collect::<Vec<_>>(),
    })
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

pub async fn status(state: &AppState, id: &str, json: bool) -> Result<()> {
    let id = parse_id(id)?;
    let workflow = state.engine.load(&id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&workflow)?);
        return Ok(());
    }

    println!();
    println!("  {} {}", style("Workflow:").bold(), style(&workflow.name).cyan());
    println!("  ID:          {}", workflow.id);
    println!("  Description: {}", workflow.description());
    println!("  Status:      {}", format_status(workflow.status).content());
    println!("  Created:     {}", workflow.created_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(t) = workflow.started_at {
        println!("  Started:     {}", t.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(t) = workflow.completed_at {
        println!("  Completed:   {}", t.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(circuit) = state.engine.circuit_status(&workflow.id) {
        println!("  Circuit:     {circuit}");
    }
    println!();
    println!("{}", steps_table(&workflow));
    println!();
    Ok(())
}

fn steps_table(workflow: &Workflow) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Action"),
            Cell::new("Status"),
            Cell::new("Attempts"),
            Cell::new("Duration"),
            Cell::new("Error"),
        ]);

    for step in &workflow.steps {
        let duration = match (step.start_time, step.end_time) {
            (Some(start), Some(end)) => format!("{}ms", (end - start).num_milliseconds()),
            _ => "-".to_string(),
        };
        table.add_row(vec![
            Cell::new(&step.id),
            Cell::new(&step.action),
            format_step_status(step.status),
            Cell::new(step.attempts),
            Cell::new(duration),
            Cell::new(step.error.as_deref().unwrap_or("")),
        ]);
    }
    table
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

pub async fn list(state: &AppState, status: Option<StatusArg>, json: bool) -> Result<()> {
    let workflows = state
        .engine
        .list(status.map(WorkflowStatus::from))
        .await
        .context("Failed to list workflows")?;

    if json {
        let out: Vec<_> = workflows
            .iter()
            .map(|w| {
                serde_json::json!({
                    "id": w.id.to_string(),
                    "name": w.name,
                    "status": w.status.as_str(),
                    "steps": w.steps.len(),
                    "created_at": w.created_at.to_rfc3339(),
                    "completed_at": w.completed_at.map(|t| t.to_rfc3339()),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if workflows.is_empty() {
        println!();
        println!("  No workflows stored.");
        println!(
            "  Submit one with: {}",
            style("cndr submit <file.yaml>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Name"),
            Cell::new("Status"),
            Cell::new("Steps"),
            Cell::new("Created"),
            Cell::new("Completed"),
        ]);

    for w in &workflows {
        let completed = w
            .completed_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(short_id(&w.id)),
            Cell::new(&w.name),
            format_status(w.status),
            Cell::new(w.steps.len()),
            Cell::new(w.created_at.format("%Y-%m-%d %H:%M").to_string()),
            Cell::new(completed),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------------

pub async fn delete(state: &AppState, id: &str, json: bool) -> Result<()> {
    let id = parse_id(id)?;
    let deleted = state.engine.delete(&id).await?;
    if !deleted {
        bail!("Workflow {id} not found");
    }

    if json {
        println!("{}", serde_json::json!({ "id": id.to_string(), "deleted": true }));
    } else {
        println!();
        println!("  {} Deleted workflow {}", style("*").green().bold(), style(short_id(&id)).cyan());
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Example
// ---------------------------------------------------------------------------

pub fn example(template: Template, url: &str, format: FormatArg) -> Result<()> {
    let workflow = match template {
        Template::Search => templates::search(),
        Template::Browser => templates::browser(url),
        Template::Extraction => templates::extraction(url),
    };
    print!("{}", workflow.to_document(format.into())?);
    Ok(())
}

fn format_status(status: WorkflowStatus) -> Cell {
    let color = match status {
        WorkflowStatus::Pending => Color::Yellow,
        WorkflowStatus::Running => Color::Blue,
        WorkflowStatus::Paused => Color::Magenta,
        WorkflowStatus::Completed => Color::Green,
        WorkflowStatus::Failed => Color::Red,
        WorkflowStatus::Cancelled => Color::DarkYellow,
    };
    Cell::new(status.as_str()).fg(color)
}

fn format_step_status(status: StepStatus) -> Cell {
    let color = match status {
        StepStatus::Pending => Color::Yellow,
        StepStatus::Running => Color::Blue,
        StepStatus::Completed => Color::Green,
        StepStatus::Failed => Color::Red,
        StepStatus::Skipped => Color::DarkGrey,
    };
    Cell::new(status.as_str()).fg(color)
}
