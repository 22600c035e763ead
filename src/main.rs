use chainloom::config::RuntimeConfig;
use chainloom::definition::WorkflowDefinition;
use chainloom::engine::TenantRegistry;
use chainloom::executor::GraphRuntime;
use chainloom::logger::init_tracing;
use chainloom::resource::{BuilderRegistry, SharedResourcePool};
use chainloom::store::{FileEventStore, FileStore};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::{env, fs};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "chainloom",
    about = "Multi-tenant workflow runtime",
    version = "0.2.0"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the runtime
    Run(RunArgs),

    /// Check a workflow definition file without deploying it
    Validate { file: PathBuf },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Optional log level override (e.g. error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Write logs to `<root>/logs` as well as stdout. Default: true
    #[arg(long, default_value_t = true)]
    logs_enabled: bool,
}

/// Resolve the chainloom root directory from the environment or use default.
fn resolve_root_dir() -> PathBuf {
    if let Ok(path) = env::var("CHAINLOOM_ROOT") {
        PathBuf::from(path)
    } else {
        PathBuf::from("./chainloom")
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run(RunArgs {
        log_level: "info".to_string(),
        logs_enabled: true,
    })) {
        Commands::Run(args) => {
            let root = resolve_root_dir();
            run(root, args.log_level, args.logs_enabled).await
        }
        Commands::Validate { file } => {
            let bytes = fs::read(&file)?;
            let def = WorkflowDefinition::decode(&bytes)?;
            def.validate()?;
            println!("Workflow `{}` is valid.", def.workflow.id);
            Ok(())
        }
    }
}

async fn run(root: PathBuf, log_level: String, logs_enabled: bool) -> anyhow::Result<()> {
    fs::create_dir_all(&root)?;
    let log_dir = logs_enabled.then(|| root.join("logs"));
    let _logger = init_tracing(&log_level, log_dir)?;

    info!("Chainloom runtime starting up from {}", root.display());

    let config = RuntimeConfig::load(&root)?;

    let resources = Arc::new(SharedResourcePool::new(Arc::new(BuilderRegistry::new())));
    let resources_file = root.join("resources.json");
    if resources_file.exists() {
        let bytes = fs::read(&resources_file)?;
        resources.load(&bytes)?;
        info!("Loaded shared resources: {:?}", resources.ids());
    }

    let registry = TenantRegistry::new(
        config,
        Arc::new(FileStore::new(root.clone())),
        Arc::new(FileEventStore::new(root)),
        Arc::new(GraphRuntime::new(resources.clone())),
    );
    registry.load_existing().await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    registry.shutdown();
    resources.stop_all();
    Ok(())
}
