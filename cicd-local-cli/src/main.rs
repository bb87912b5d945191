//! cicd-local CLI - runs delivery pipelines on the local machine.

use anyhow::{Context, Result};
use cicd_local::observability::verbosity_filter;
use cicd_local::prelude::*;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Local simulator for multi-stage delivery pipelines.
#[derive(Parser)]
#[command(name = "cicd-local")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Environment file merged under the process environment
    #[arg(long, global = true, default_value = DEFAULT_ENV_FILE)]
    env_file: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build, unit-test and, on merge, deliver
    ContinuousIntegration {
        /// What kind of change started the run
        #[arg(long, value_enum, default_value_t = TriggerArg::Commit)]
        trigger: TriggerArg,

        #[command(flatten)]
        common: CommonArgs,
    },

    /// Build and deliver
    Delivery {
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Deploy and validate
    Deployment {
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Deploy, validate and run integration tests through a tunnel
    AcceptanceTesting {
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Deploy the current code, the previous release, then the current code again
    BlueGreenStaging {
        #[command(flatten)]
        common: CommonArgs,
    },
}

impl Commands {
    fn into_parts(self) -> (PipelineKind, CommonArgs, Trigger) {
        match self {
            Self::ContinuousIntegration { trigger, common } => {
                (PipelineKind::ContinuousIntegration, common, trigger.into())
            }
            Self::Delivery { common } => (PipelineKind::Delivery, common, Trigger::Commit),
            Self::Deployment { common } => (PipelineKind::Deployment, common, Trigger::Commit),
            Self::AcceptanceTesting { common } => (PipelineKind::AcceptanceTesting, common, Trigger::Commit),
            Self::BlueGreenStaging { common } => (PipelineKind::BlueGreenStaging, common, Trigger::Commit),
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum TriggerArg {
    Commit,
    Merge,
}

impl From<TriggerArg> for Trigger {
    fn from(value: TriggerArg) -> Self {
        match value {
            TriggerArg::Commit => Self::Commit,
            TriggerArg::Merge => Self::Merge,
        }
    }
}

#[derive(Args, Clone)]
struct CommonArgs {
    /// Stage to skip (repeatable)
    #[arg(long = "skip", value_name = "STAGE", value_parser = parse_stage)]
    skip: Vec<StageName>,

    /// Module directory holding the stage functions
    #[arg(long)]
    module: Option<PathBuf>,

    /// Source directory passed to stages
    #[arg(long)]
    source: Option<PathBuf>,

    /// Directory for artifacts, logs and run summaries
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Container image registry override
    #[arg(long)]
    container_repository: Option<String>,

    /// Chart repository override
    #[arg(long)]
    helm_repository: Option<String>,

    /// Namespace of the deployed service
    #[arg(long)]
    namespace: Option<String>,

    /// Mark produced artifacts as a release candidate
    #[arg(long)]
    release_candidate: bool,

    /// Keep the privileged module after the run
    #[arg(long)]
    keep_privileged: bool,
}

impl CommonArgs {
    fn configure(&self, mut config: Config) -> Config {
        if let Some(dir) = &self.module {
            config = config.with_module_dir(dir);
        }
        if let Some(dir) = &self.source {
            config = config.with_source_dir(dir);
        }
        if let Some(dir) = &self.output_dir {
            config = config.with_output_dir(dir);
        }
        if self.keep_privileged {
            config = config.with_keep_privileged(true);
        }
        config.with_namespace(self.namespace.clone())
    }

    fn options(&self, trigger: Trigger) -> PipelineOptions {
        let mut options = PipelineOptions::new()
            .with_trigger(trigger)
            .with_release_candidate(self.release_candidate)
            .with_repositories(self.container_repository.clone(), self.helm_repository.clone())
            .with_namespace(self.namespace.clone());
        for stage in &self.skip {
            options = options.with_skip(*stage);
        }
        options
    }
}

fn parse_stage(value: &str) -> std::result::Result<StageName, String> {
    StageName::parse(value).ok_or_else(|| {
        format!(
            "unknown stage '{value}', expected one of: {}",
            StageName::ALL.map(StageName::function_name).join(", ")
        )
    })
}

/// Set up logging based on verbosity level.
///
/// Logging format can be controlled via `CICD_LOG_FORMAT` environment variable:
/// - "pretty" - Human-readable multi-line format (default for TTY)
/// - "compact" - Single-line format (default for non-TTY)
/// - "json" - JSON format for log aggregators
fn setup_logging(verbosity: u8) -> Result<()> {
    let format = std::env::var("CICD_LOG_FORMAT")
        .ok()
        .and_then(|s| s.parse::<LogFormat>().ok())
        .unwrap_or_else(|| {
            if std::io::stderr().is_terminal() {
                LogFormat::Pretty
            } else {
                LogFormat::Compact
            }
        });

    // RUST_LOG wins over -v
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| verbosity_filter(verbosity).to_string());

    init_tracing(&TracingConfig::default().with_format(format).with_filter(filter))?;
    Ok(())
}

fn print_run(run: &PipelineRun) {
    println!("{} ({})", run.kind, run.identity.short_id());
    for record in &run.records {
        let detail = match (&record.skip_reason, &record.log_path) {
            (Some(reason), _) => reason.clone(),
            (None, Some(log)) => format!("{} ms, log {}", record.duration_ms(), log.display()),
            (None, None) => format!("{} ms", record.duration_ms()),
        };
        println!("  {:<6} {:<18} {detail}", record.status.to_string(), record.stage.function_name());
    }
    if let Some(path) = &run.summary_path {
        println!("  summary {}", path.display());
    }
}

fn print_blue_green(report: &BlueGreenReport) {
    let phases: Vec<String> = report.phases.iter().map(ToString::to_string).collect();
    println!("blue-green-staging ({})", report.identity.short_id());
    println!("  phases   {}", phases.join(" -> "));
    if let Some(release) = &report.previous_release {
        let version = report.previous_version.as_deref().unwrap_or("unknown");
        println!("  previous {release} (version {version})");
    }
    if let Some(reason) = &report.restoration_failure {
        println!("  WORKING TREE NOT RESTORED: {reason}");
    }
}

async fn execute(kind: PipelineKind, runner: Arc<PipelineRunner>, options: PipelineOptions) -> Result<()> {
    if kind == PipelineKind::BlueGreenStaging {
        let vcs = Arc::new(GitCli::new(
            runner.config().git_bin.clone(),
            runner.config().source_dir.clone(),
        ));
        let report = BlueGreenController::new(Arc::clone(&runner), vcs, options).run().await;
        print_blue_green(&report);
        report.into_result()?;
        return Ok(());
    }

    let plan = runner.plan(kind, &options)?;
    let run = runner.execute(&plan).await;
    print_run(&run);
    run.into_result()?;
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let workdir = std::env::current_dir().context("cannot determine the working directory")?;
    let env = EnvSnapshot::from_process().with_env_file(&workdir.join(&cli.env_file))?;

    let (kind, common, trigger) = cli.command.into_parts();
    let config = common.configure(Config::from_env(&workdir, &env));
    require_tools(kind, &config, &env)?;
    info!(pipeline = %kind, workdir = %workdir.display(), "Starting");

    let secrets = AmbientSecretStore::new(env, config.kubectl_bin.clone(), config.kubectl_context.clone())
        .with_kubeconfig(config.kubeconfig_path.clone());
    let backend = DaggerBackend::new(config.dagger_bin.clone()).with_workdir(&config.workdir);
    let cleanup = Arc::new(CleanupRegistry::new());
    let runner = PipelineRunner::new(config, Arc::new(backend), Arc::new(secrets))?
        .with_cleanup(Arc::clone(&cleanup));

    tokio::select! {
        result = execute(kind, Arc::new(runner), common.options(trigger)) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, releasing run resources");
            for failure in cleanup.run_all() {
                error!(cleanup = %failure.name, error = %failure.message, "Cleanup failed");
            }
            Err(CicdError::Cancelled {
                reason: "interrupted by operator".to_string(),
            }
            .into())
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = setup_logging(cli.verbose) {
        eprintln!("error: {e:#}");
        std::process::exit(2);
    }

    if let Err(e) = run(cli).await {
        eprintln!("error: {e:#}");
        let code = e.downcast_ref::<CicdError>().map_or(1, CicdError::exit_code);
        std::process::exit(code);
    }
}
