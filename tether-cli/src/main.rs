use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tether_core::{Command, DownloadTarget, OutputLine, TetherError, ToolchainConfig};
use tether_runner::{
    CancelToken, Downloader, Installer, LauncherConfig, LineStreamHandler, Listeners,
    ProcessLauncher, ProcessManager, StreamHandler, Updater,
};
use tracing::debug;

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Run and maintain external toolchain commands", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Toolchain configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SDK root, overrides the configuration file
    #[arg(long, global = true)]
    sdk_root: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program, capture its stdout and exit with its exit code
    Exec {
        /// Give up after this many seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Working directory
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Extra environment variable (KEY=VALUE)
        #[arg(short, long = "env", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,

        /// Print the captured result as JSON
        #[arg(long)]
        json: bool,

        /// Program followed by its arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Download a file over HTTP
    Download {
        url: String,
        destination: PathBuf,
    },

    /// Download, unpack and install the SDK into a directory
    Install {
        destination: PathBuf,
    },

    /// Update the installed SDK
    Update,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref(), cli.sdk_root)?;

    let result = match cli.command {
        Commands::Exec {
            timeout,
            cwd,
            env,
            json,
            command,
        } => {
            let timeout = timeout.map(Duration::from_secs).or(config.default_timeout());
            exec(&config, command, cwd, env, timeout, json).await
        }
        Commands::Download { url, destination } => download(&config, url, destination).await,
        Commands::Install { destination } => install(config, destination).await,
        Commands::Update => update(config).await,
    };

    match result {
        Ok(()) => Ok(()),
        Err(TetherError::NonZeroExit { code }) => {
            debug!(exit_code = code, "Propagating child exit code");
            if let Some(message) = unportable_exit_message(code) {
                eprintln!("{}", message);
            }
            process::exit(code);
        }
        Err(TetherError::Cancelled) => {
            eprintln!("Cancelled");
            process::exit(130);
        }
        Err(e) => Err(e.into()),
    }
}

/// Exit statuses outside 0..=255 are truncated by the OS, so say what the
/// child actually returned.
fn unportable_exit_message(code: i32) -> Option<String> {
    (!(0..=255).contains(&code)).then(|| format!("Process exited with code {}", code))
}

fn load_config(
    path: Option<&PathBuf>,
    sdk_root: Option<PathBuf>,
) -> anyhow::Result<ToolchainConfig> {
    let mut config = match path {
        Some(path) => ToolchainConfig::load(path)
            .map_err(|e| anyhow::anyhow!("Failed to load config {}: {}", path.display(), e))?,
        None => ToolchainConfig::default(),
    };
    if sdk_root.is_some() {
        config.sdk_root = sdk_root;
    }
    Ok(config)
}

fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    if key.is_empty() {
        return Err(format!("empty variable name in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Cancel `cancel` on Ctrl-C.
fn cancel_on_interrupt(cancel: CancelToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });
}

fn console_handler() -> Arc<dyn StreamHandler> {
    let listeners = Listeners::new().on_output(|line: &OutputLine| {
        println!("{}", line.text);
    });
    Arc::new(LineStreamHandler::new(listeners))
}

async fn exec(
    config: &ToolchainConfig,
    argv: Vec<String>,
    cwd: Option<PathBuf>,
    env: Vec<(String, String)>,
    timeout: Option<Duration>,
    json: bool,
) -> Result<(), TetherError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| TetherError::ExecutionError("no program given".to_string()))?;

    let mut command = Command::new(program).args(args.iter().cloned()).envs(env);
    if let Some(cwd) = cwd {
        command = command.current_dir(cwd);
    }

    let launcher = ProcessLauncher::new(LauncherConfig::from_toolchain(config));
    let listeners = Listeners::new().on_stderr(|line: &OutputLine| eprintln!("{}", line.text));
    let manager = ProcessManager::start(&launcher, &command, tether_runner::Identity, listeners)?;

    let cancel = CancelToken::new();
    cancel_on_interrupt(cancel.clone());

    let wait = async {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, manager.captured())
                .await
                .unwrap_or(Err(TetherError::Timeout(limit))),
            None => manager.captured().await,
        }
    };

    let outcome = tokio::select! {
        outcome = wait => outcome,
        _ = cancel.cancelled() => {
            manager.cancel();
            manager.captured().await
        }
    };

    let captured = match outcome {
        Err(TetherError::Timeout(limit)) => {
            manager.cancel();
            return Err(TetherError::Timeout(limit));
        }
        other => other?,
    };

    if json {
        let rendered = serde_json::to_string_pretty(&captured)
            .map_err(|e| TetherError::ExecutionError(e.to_string()))?;
        println!("{}", rendered);
    } else if let Some(stdout) = &captured.value {
        print!("{}", stdout);
    }
    Ok(())
}

async fn download(
    config: &ToolchainConfig,
    url: String,
    destination: PathBuf,
) -> Result<(), TetherError> {
    let downloader = Downloader::new(&config.user_agent)?;
    let cancel = CancelToken::new();
    cancel_on_interrupt(cancel.clone());

    let target = DownloadTarget::new(url, destination);
    let path = downloader
        .download(
            &target,
            |_, so_far, total| match total {
                Some(total) if total > 0 => eprint!(
                    "\rDownloaded {} / {} bytes ({}%)",
                    so_far,
                    total,
                    so_far * 100 / total
                ),
                _ => eprint!("\rDownloaded {} bytes", so_far),
            },
            &cancel,
        )
        .await?;
    eprintln!();
    println!("✓ Saved to {}", path.display());
    Ok(())
}

async fn install(config: ToolchainConfig, destination: PathBuf) -> Result<(), TetherError> {
    let installer = Installer::new(config)?;
    let cancel = CancelToken::new();
    cancel_on_interrupt(cancel.clone());

    let sdk_root = installer
        .install(&destination, Some(console_handler()), &cancel)
        .await?;
    println!("✓ Installed SDK at {}", sdk_root.display());
    Ok(())
}

async fn update(config: ToolchainConfig) -> Result<(), TetherError> {
    let updater = Updater::new(config)?;
    let cancel = CancelToken::new();
    cancel_on_interrupt(cancel.clone());

    updater.update(Some(console_handler()), &cancel).await?;
    println!("✓ Toolchain is up to date");
    Ok(())
}
