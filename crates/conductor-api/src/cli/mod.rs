//! CLI command definitions for the `cndr` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod workflow;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use conductor_types::workflow::{DocumentFormat, WorkflowStatus};

/// Run declarative automation workflows with retries and circuit breaking.
#[derive(Parser)]
#[command(name = "cndr", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true, env = "CONDUCTOR_OTEL")]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a workflow document and store it as pending.
    Submit {
        /// Path to a .yaml, .yml or .json workflow document.
        file: PathBuf,
    },

    /// Execute a workflow from a file, a stored id, or a stored name.
    Run {
        /// File path, workflow UUID, or workflow name.
        target: String,
    },

    /// Show a stored workflow and its steps.
    Status {
        /// Workflow UUID.
        id: String,
    },

    /// List stored workflows.
    #[command(alias = "ls")]
    List {
        /// Only show workflows with this status.
        #[arg(long, value_enum)]
        status: Option<StatusArg>,
    },

    /// Delete a stored workflow.
    #[command(alias = "rm")]
    Delete {
        /// Workflow UUID.
        id: String,
    },

    /// Print an example workflow document.
    Example {
        #[arg(long, value_enum, default_value_t = Template::Search)]
        template: Template,

        /// Target URL for the browser and extraction templates.
        #[arg(long, default_value = "https://example.com")]
        url: String,

        #[arg(long, value_enum, default_value_t = FormatArg::Yaml)]
        format: FormatArg,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StatusArg {
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
    Cancelled,
}

impl From<StatusArg> for WorkflowStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Pending => WorkflowStatus::Pending,
            StatusArg::Running => WorkflowStatus::Running,
            StatusArg::Completed => WorkflowStatus::Completed,
            StatusArg::Failed => WorkflowStatus::Failed,
            StatusArg::Paused => WorkflowStatus::Paused,
            StatusArg::Cancelled => WorkflowStatus::Cancelled,
        }
    }
}

/// Built-in example workflows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Template {
    /// Type a search term into a search page.
    Search,
    /// Open a browser, navigate, take a screenshot.
    Browser,
    /// Navigate and extract text and UI elements.
    Extraction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FormatArg {
    Yaml,
    Json,
}

impl From<FormatArg> for DocumentFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Yaml => DocumentFormat::Yaml,
            FormatArg::Json => DocumentFormat::Json,
        }
    }
}
