use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use devpush::cluster::KubeCluster;
use devpush::component::{ComponentAdapter, PushParameters};
use devpush::config::{EnvInfo, Settings};
use devpush::devfile::Devfile;
use devpush::sync::IndexedSyncer;
use devpush::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Tool settings file (TOML)
    #[arg(long, global = true, env = "DEVPUSH_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, global = true, env = "DEVPUSH_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create or update the component and sync the project into it
    Push(PushArgs),
    /// Delete the component from the cluster
    Delete(ProjectArgs),
    /// Run the devfile test command in the component
    Test(TestArgs),
    /// Run a command in the component's run container
    Exec(ExecArgs),
    /// Show the component's logs
    Log(LogArgs),
}

#[derive(Parser, Debug)]
struct ProjectArgs {
    /// Project root holding the devfile and the sources
    #[arg(long, default_value = ".")]
    context: PathBuf,

    /// Devfile path, relative to the project root
    #[arg(long, default_value = "devfile.yaml")]
    devfile: PathBuf,

    /// Component name, defaults to the recorded one or the devfile name
    #[arg(long, env = "DEVPUSH_COMPONENT")]
    name: Option<String>,

    /// Application the component belongs to
    #[arg(long, env = "DEVPUSH_APP")]
    app: Option<String>,

    /// Target namespace, defaults to the recorded one or the kubeconfig one
    #[arg(long, env = "DEVPUSH_NAMESPACE")]
    namespace: Option<String>,

    /// Stream command output while it runs
    #[arg(long)]
    show: bool,
}

#[derive(Parser, Debug)]
struct PushArgs {
    #[command(flatten)]
    project: ProjectArgs,

    #[arg(long)]
    build_command: Option<String>,

    #[arg(long)]
    run_command: Option<String>,

    #[arg(long)]
    debug_command: Option<String>,

    /// Run the debug command instead of the run command
    #[arg(long)]
    debug: bool,

    #[arg(long, env = "DEBUG_PORT")]
    debug_port: Option<i32>,

    /// Sync all files and execute commands even without changes
    #[arg(short = 'f', long)]
    force_build: bool,
}

#[derive(Parser, Debug)]
struct TestArgs {
    #[command(flatten)]
    project: ProjectArgs,

    #[arg(long)]
    test_command: Option<String>,
}

#[derive(Parser, Debug)]
struct ExecArgs {
    #[command(flatten)]
    project: ProjectArgs,

    #[arg(trailing_var_arg = true, required = true)]
    command: Vec<String>,
}

#[derive(Parser, Debug)]
struct LogArgs {
    #[command(flatten)]
    project: ProjectArgs,

    #[arg(long)]
    follow: bool,

    /// Show the logs of the debug command's container
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let settings = Settings::load(args.config.as_deref())?;
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping");
            on_signal.cancel();
        }
    });

    match args.command {
        Commands::Push(push) => run_push(push, settings, cancel).await,
        Commands::Delete(project) => {
            let (adapter, _) = open_project(&project, &settings, cancel).await?;
            adapter.delete(project.show).await
        }
        Commands::Test(test) => {
            let (adapter, _) = open_project(&test.project, &settings, cancel).await?;
            adapter
                .test(test.test_command.as_deref(), test.project.show)
                .await
        }
        Commands::Exec(exec) => {
            let (adapter, _) = open_project(&exec.project, &settings, cancel).await?;
            adapter.exec(exec.command).await
        }
        Commands::Log(log) => {
            let (adapter, _) = open_project(&log.project, &settings, cancel).await?;
            let mut stdout = std::io::stdout();
            adapter.log(log.follow, log.debug, &mut stdout).await
        }
    }
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Text => registry
            .with(fmt::layer().with_target(false).without_time())
            .init(),
    }
}

async fn run_push(
    args: PushArgs,
    settings: Settings,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let (adapter, mut env) = open_project(&args.project, &settings, cancel).await?;

    let params = PushParameters {
        build_command: args.build_command,
        run_command: args.run_command,
        debug_command: args.debug_command,
        debug: args.debug,
        debug_port: args.debug_port,
        force_build: args.force_build,
        show: args.project.show,
        project_dir: args.project.context.clone(),
    };
    let outcome = adapter.push(params, &env).await?;

    env.record_push(outcome.run_mode);
    if let Some(port) = args.debug_port {
        env.debug_port = Some(port);
    }
    env.save(&args.project.context)?;

    info!(
        "Pushed component {} (existed: {}, executed: {})",
        adapter.component_name(),
        outcome.component_existed,
        outcome.executed
    );
    Ok(())
}

/// Resolve the component identity and connect to the cluster
async fn open_project(
    args: &ProjectArgs,
    settings: &Settings,
    cancel: CancellationToken,
) -> Result<(ComponentAdapter, EnvInfo), Error> {
    let devfile = Devfile::load(&devfile_path(&args.context, &args.devfile))?;
    let client = kube::Client::try_default().await?;

    let recorded = EnvInfo::load(&args.context)?;
    let name = args
        .name
        .clone()
        .or_else(|| recorded.as_ref().map(|e| e.name.clone()))
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| devfile.component_type().to_string());
    let app = args
        .app
        .clone()
        .or_else(|| recorded.as_ref().map(|e| e.app.clone()))
        .unwrap_or_default();
    let namespace = args
        .namespace
        .clone()
        .or_else(|| recorded.as_ref().map(|e| e.namespace.clone()))
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| client.default_namespace().to_string());

    let mut env = recorded.unwrap_or_else(|| EnvInfo::new(&name, &app, &namespace));
    env.name = name.clone();
    env.app = app.clone();
    env.namespace = namespace.clone();

    let cluster = Arc::new(KubeCluster::new(
        client,
        namespace,
        settings.field_manager.clone(),
        settings.pod_timeout(),
        settings.rollout_timeout(),
    ));
    let adapter = ComponentAdapter::new(
        cluster,
        Arc::new(IndexedSyncer::default()),
        devfile,
        name,
        app,
        settings.clone(),
    )
    .with_cancellation(cancel);

    Ok((adapter, env))
}

fn devfile_path(context: &Path, devfile: &Path) -> PathBuf {
    if devfile.is_absolute() {
        devfile.to_path_buf()
    } else {
        context.join(devfile)
    }
}
