use clap::{Parser, Subcommand, ValueEnum};
use stackgraph_models::StackKind;

/// StackGraph - declare, plan and apply the notifier and Jenkins stacks
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub mode: Mode,
}

#[derive(Subcommand, Debug)]
pub enum Mode {
    /// Show what apply would change
    Plan {
        /// Stack to plan (notifier or jenkins)
        stack: StackKind,

        /// Output format
        #[arg(short, long, value_enum, default_value = "table")]
        output: OutputFormat,
    },

    /// Create or update every resource of a stack
    Apply {
        /// Stack to apply (notifier or jenkins)
        stack: StackKind,

        /// Apply against an in-memory provisioner; nothing is created and
        /// the state file is left untouched
        #[arg(long)]
        dry_run: bool,

        /// After applying jenkins, wait for the pod to become ready
        #[arg(long)]
        wait: bool,

        /// Readiness timeout in seconds
        #[arg(long, default_value = "600")]
        timeout: u64,
    },

    /// Delete every recorded resource of a stack
    Destroy {
        /// Stack to destroy (notifier or jenkins)
        stack: StackKind,

        /// Report the deletion order without deleting anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Print the rendered manifests of the jenkins stack as YAML
    Render {
        /// Only jenkins has manifests
        stack: StackKind,
    },

    /// Print the outputs recorded by the last successful apply
    Outputs {
        /// Stack to read (notifier or jenkins)
        stack: StackKind,

        /// Output format
        #[arg(short, long, value_enum, default_value = "table")]
        output: OutputFormat,
    },

    /// List upcoming firings of a schedule expression
    Schedule {
        /// Schedule expression (default: the notifier's daily trigger)
        #[arg(short, long)]
        expression: Option<String>,

        /// Number of days to look ahead
        #[arg(short, long, default_value = "30")]
        days: u32,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
}
