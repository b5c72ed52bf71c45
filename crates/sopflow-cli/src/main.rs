use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use sopflow_orchestrator::{
    DispatchLoop, EngineConfig, Plan, PlanStore, TaskStatus, TerminationSignal,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sopflow", about = "Sopflow — hierarchical task orchestration for agent teams")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "sopflow.toml")]
    config: PathBuf,

    /// Human-readable logs instead of JSON
    #[arg(long)]
    pretty: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Instantiate the template and run the plan to termination
    Run {
        /// Plan id (defaults to the template id plus a random suffix)
        #[arg(long)]
        plan_id: Option<String>,
        /// Data directory for plans.json (overrides config)
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Do not read or write plans.json
        #[arg(long)]
        no_audit: bool,
    },
    /// Check the configuration and template structure
    Validate,
}

#[derive(Serialize)]
struct RunReport {
    termination: TerminationSignal,
    plan: Plan,
    agents: serde_json::Value,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.pretty);

    let config = EngineConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config '{}'", cli.config.display()))?;

    match cli.command {
        Commands::Run {
            plan_id,
            data_dir,
            no_audit,
        } => {
            let data_dir = data_dir.unwrap_or_else(|| config.engine.data_dir.clone());
            let plan_id = plan_id.unwrap_or_else(|| default_plan_id(&config));
            let store = Arc::new(PlanStore::new());

            if !no_audit {
                let loaded = store.load_from_dir(&data_dir).await?;
                info!(count = loaded, data_dir = %data_dir.display(), "Previous plans loaded");
            }

            store.create_plan(&plan_id, &config.template).await?;
            let mut dispatch = DispatchLoop::from_config(store.clone(), &config)?;
            let audit_dir = (!no_audit).then_some(data_dir.as_path());
            let termination = run_and_audit(&mut dispatch, &plan_id, audit_dir).await?;

            let report = RunReport {
                termination,
                plan: store.get_plan(&plan_id).await?,
                agents: dispatch.monitor().to_json().await,
            };
            if report.plan.count(TaskStatus::Error) > 0 {
                warn!(plan_id = %plan_id, "Plan finished with failed tasks");
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Validate => {
            let scratch = PlanStore::new();
            let plan = scratch
                .create_plan("validate", &config.template)
                .await
                .context("Template rejected")?;

            println!(
                "Template '{}' is valid: {} steps, {} tasks, {} agents",
                config.template.template_id.as_deref().unwrap_or("unnamed"),
                plan.steps.len(),
                plan.tasks.len(),
                config.agent_ids().len()
            );
            for step in &config.template.steps {
                println!("  {} {}", step.step_id, step.name);
                for task in &step.tasks {
                    println!(
                        "    {} -> {} ({} internal steps)",
                        task.task_id,
                        task.assignee,
                        task.internal_steps.len()
                    );
                }
            }
            println!("Failure policy: {}", config.engine.failure_policy);
        }
    }

    Ok(())
}

/// Drive `plan_id` to termination. When `audit_dir` is set, plans are saved
/// there whatever the outcome of the run, and the run error wins over a
/// save error.
async fn run_and_audit(
    dispatch: &mut DispatchLoop,
    plan_id: &str,
    audit_dir: Option<&Path>,
) -> anyhow::Result<TerminationSignal> {
    let outcome = dispatch.run(plan_id).await;

    if let Some(dir) = audit_dir {
        match dispatch.store().save_to_dir(dir).await {
            Ok(path) => info!(path = %path.display(), "Audit snapshot written"),
            Err(e) if outcome.is_err() => {
                error!(error = %e, data_dir = %dir.display(), "Audit snapshot failed")
            }
            Err(e) => return Err(e).context("Failed to write audit snapshot"),
        }
    }

    outcome.with_context(|| format!("Plan '{plan_id}' did not terminate"))
}

fn init_tracing(pretty: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if pretty {
        builder.pretty().init();
    } else {
        builder.json().init();
    }
}

fn default_plan_id(config: &EngineConfig) -> String {
    let prefix = config.template.template_id.as_deref().unwrap_or("plan");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &suffix[..8])
}
