use anyhow::{Context, Result};
use stackgraph_models::{PlannedAction, ResourceOutcome, StackKind};
use stackgraph_stacks::engine::{self, Engine};
use stackgraph_stacks::k8s_client::{get_k8s_client, wait_for_ready};
use stackgraph_stacks::names::jenkins as jenkins_names;
use stackgraph_stacks::provisioners::aws::AwsProvisioner;
use stackgraph_stacks::provisioners::kube::KubeProvisioner;
use stackgraph_stacks::provisioners::memory::MemoryProvisioner;
use stackgraph_stacks::provisioners::Provisioner;
use stackgraph_stacks::stacks::jenkins::JenkinsManifests;
use stackgraph_stacks::stacks::{jenkins, notifier, StackDefinition};
use stackgraph_stacks::{Plan, RunReport};
use std::sync::Arc;
use std::time::Duration;

use crate::cli::OutputFormat;
use crate::config::Config;

const READY_POLL_INTERVAL: Duration = Duration::from_secs(10);

fn definition(kind: StackKind, config: &Config) -> Result<StackDefinition> {
    let stack = match kind {
        StackKind::Notifier => notifier::build(&config.notifier()),
        StackKind::Jenkins => jenkins::build(&config.jenkins()?),
    };
    stack.with_context(|| format!("Failed to declare the {} stack", kind))
}

/// State is kept per stack name and kind, so both stacks can share a name
fn state_key(kind: StackKind, config: &Config) -> String {
    format!("{}-{}", config.stack, kind)
}

async fn provisioner(kind: StackKind) -> Result<Arc<dyn Provisioner>> {
    let provisioner: Arc<dyn Provisioner> = match kind {
        StackKind::Notifier => Arc::new(AwsProvisioner::from_env().await),
        StackKind::Jenkins => Arc::new(KubeProvisioner::connect().await?),
    };
    Ok(provisioner)
}

pub async fn run_plan(kind: StackKind, output: OutputFormat) -> Result<()> {
    let config = Config::load()?;
    let stack = definition(kind, &config)?;
    let state = config.state_store().load(&state_key(kind, &config))?;

    let plan = engine::plan(&stack, &state)?;

    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&plan)?),
        OutputFormat::Table => print_plan(&plan),
    }
    Ok(())
}

pub async fn run_apply(kind: StackKind, dry_run: bool, wait: bool, timeout: u64) -> Result<()> {
    let config = Config::load()?;
    let stack = definition(kind, &config)?;
    let store = config.state_store();
    let key = state_key(kind, &config);
    let mut state = store.load(&key)?;

    for warning in &stack.warnings {
        tracing::warn!("{}", warning);
    }

    let engine = if dry_run {
        tracing::info!("Dry run: using the in-memory provisioner");
        Engine::new(Arc::new(MemoryProvisioner::new()))
    } else {
        Engine::new(provisioner(kind).await?).with_store(store)
    };

    let report = engine.apply(&stack, &mut state).await?;
    print_report(&report);

    if !report.succeeded() {
        anyhow::bail!("{} resource(s) failed or were skipped", report.failures().count());
    }

    if wait && kind == StackKind::Jenkins && !dry_run {
        println!();
        println!("Waiting for Jenkins to become ready...");
        let client = get_k8s_client().await?;
        let readiness = wait_for_ready(
            &client,
            &config.namespace,
            jenkins_names::APP_LABEL,
            Duration::from_secs(timeout),
            READY_POLL_INTERVAL,
        )
        .await?;
        println!("✓ Jenkins is ready (phase: {})", readiness.phase);
    }

    Ok(())
}

pub async fn run_destroy(kind: StackKind, dry_run: bool) -> Result<()> {
    let config = Config::load()?;
    let store = config.state_store();
    let key = state_key(kind, &config);
    let mut state = store.load(&key)?;

    if state.is_empty() {
        println!("Nothing recorded for stack '{}'", key);
        return Ok(());
    }

    let engine = if dry_run {
        Engine::new(Arc::new(MemoryProvisioner::new()))
    } else {
        Engine::new(provisioner(kind).await?).with_store(store)
    };

    let report = engine.destroy(&mut state).await?;
    print_report(&report);

    if !report.succeeded() {
        anyhow::bail!("{} resource(s) could not be deleted", report.failures().count());
    }
    Ok(())
}

pub async fn run_render(kind: StackKind) -> Result<()> {
    if kind != StackKind::Jenkins {
        anyhow::bail!("Only the jenkins stack has manifests to render");
    }
    let config = Config::load()?;
    let jenkins = config.jenkins()?;
    let manifests = JenkinsManifests::render(&jenkins)?;
    for warning in manifests.validate(&jenkins)? {
        eprintln!("warning: {}", warning);
    }
    print!("{}", manifests.to_yaml()?);
    Ok(())
}

pub async fn run_outputs(kind: StackKind, output: OutputFormat) -> Result<()> {
    let config = Config::load()?;
    let key = state_key(kind, &config);
    let state = config.state_store().load(&key)?;

    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&state.outputs)?),
        OutputFormat::Table => {
            if state.outputs.is_empty() {
                println!("No outputs recorded for stack '{}'", key);
                return Ok(());
            }
            for (name, value) in &state.outputs {
                println!("{:<20} {}", name, value);
            }
        }
    }
    Ok(())
}

fn print_plan(plan: &Plan) {
    println!("Plan for stack '{}'", plan.stack);
    println!("{}", "=".repeat(80));
    println!("{:<10} {:<40} {}", "ACTION", "RESOURCE", "KIND");
    println!("{}", "-".repeat(80));
    for step in &plan.steps {
        println!("{:<10} {:<40} {}", step.action, step.resource, step.kind);
    }
    println!();
    println!(
        "{} to create, {} to update, {} unchanged, {} to delete",
        plan.count(PlannedAction::Create),
        plan.count(PlannedAction::Update),
        plan.count(PlannedAction::Unchanged),
        plan.count(PlannedAction::Delete),
    );

    println!();
    println!("Waves:");
    for (i, wave) in plan.waves.iter().enumerate() {
        let ids: Vec<&str> = wave.iter().map(|id| id.as_str()).collect();
        println!("  {}: {}", i + 1, ids.join(", "));
    }

    if !plan.warnings.is_empty() {
        println!();
        for warning in &plan.warnings {
            println!("⚠ {}", warning);
        }
    }
}

fn print_report(report: &RunReport) {
    println!();
    println!("{:<10} {:<40} {}", "STATUS", "RESOURCE", "DETAIL");
    println!("{}", "-".repeat(80));
    for entry in &report.entries {
        let detail = match &entry.outcome {
            ResourceOutcome::Created { outputs } | ResourceOutcome::Updated { outputs } => outputs
                .get("arn")
                .or_else(|| outputs.get("name"))
                .cloned()
                .unwrap_or_default(),
            ResourceOutcome::Failed { error } => error.clone(),
            ResourceOutcome::Skipped { blocked_by } => format!("blocked by {}", blocked_by),
            ResourceOutcome::Unchanged | ResourceOutcome::Deleted => String::new(),
        };
        println!("{:<10} {:<40} {}", entry.outcome.label(), entry.resource, detail);
    }

    if !report.outputs.is_empty() {
        println!();
        println!("Outputs:");
        for (name, value) in &report.outputs {
            println!("  {:<18} {}", name, value);
        }
    }

    println!();
    if report.succeeded() {
        println!("✓ {} complete (run {})", report.run.operation, report.run.run_id);
    } else {
        println!("✗ {} finished with failures (run {})", report.run.operation, report.run.run_id);
    }
}
