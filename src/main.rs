mod build;
mod config;
mod env_file;
mod error;
mod init;
mod process;
mod reconcile;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::{BuildFailurePolicy, Settings, DEFAULT_APP_ROOT};
use init::handle_init;
use process::SystemLauncher;
use reconcile::Reconciler;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing_subscriber::filter::LevelFilter;

#[derive(Parser)]
#[command(name = "nextboot")]
#[command(about = "Container entrypoint that loads runtime variables, builds a Next.js app if needed, and starts it")]
#[command(version)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "NEXTBOOT_APP_ROOT",
        default_value = DEFAULT_APP_ROOT,
        help = "Application directory containing the variable file and build output"
    )]
    app_root: PathBuf,
    #[arg(
        short = 'c',
        long,
        global = true,
        env = "NEXTBOOT_CONFIG",
        help = "Path to nextboot.toml (defaults to <app-root>/nextboot.toml if present)"
    )]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Enable verbose output")]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Load variables, build if needed, then exec the server (default)")]
    Run {
        #[arg(long, value_enum, help = "What to do when the build command fails")]
        on_build_failure: Option<BuildFailurePolicy>,
        #[arg(long, help = "Mask values in the variable listing")]
        mask: bool,
        #[arg(last = true, help = "Start command overriding the configured one")]
        command: Vec<String>,
    },
    #[command(about = "Build unconditionally and record the build manifest")]
    Build,
    #[command(about = "Report whether the existing build can be reused")]
    Status,
    #[command(about = "List the variables the server would see")]
    Env {
        #[arg(long, help = "Mask values in the variable listing")]
        mask: bool,
    },
    #[command(about = "Write a nextboot.toml template to the app root")]
    Init {
        #[arg(long, help = "Overwrite an existing file without asking")]
        force: bool,
    },
}

fn init_logs(verbose: bool) {
    let default = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Snapshot of this process's environment, skipping entries that are not
/// valid UTF-8.
fn inherited_env() -> BTreeMap<String, String> {
    std::env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .collect()
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logs(cli.verbose);

    let command = cli.command.unwrap_or(Commands::Run {
        on_build_failure: None,
        mask: false,
        command: Vec::new(),
    });

    let load_settings = || {
        Settings::load(&cli.app_root, cli.config.as_deref())
            .context("Failed to load nextboot settings")
    };
    let mut stdout = std::io::stdout();

    let code = match command {
        Commands::Run {
            on_build_failure,
            mask,
            command,
        } => {
            let mut settings = load_settings()?;
            if let Some(policy) = on_build_failure {
                settings.on_build_failure = policy;
            }
            settings.mask_values |= mask;
            let start = (!command.is_empty()).then_some(command.as_slice());
            Reconciler::new(&settings, SystemLauncher, inherited_env()).run(&mut stdout, start)?
        }
        Commands::Build => {
            let settings = load_settings()?;
            let mut reconciler = Reconciler::new(&settings, SystemLauncher, inherited_env());
            let env = reconciler.load(&mut stdout);
            let outcome = reconciler.build(&env)?;
            if outcome.success {
                println!("✓ Build finished in {}", settings.build_dir_path().display());
                0
            } else {
                eprintln!("Build failed ({})", outcome.describe());
                outcome.code.filter(|code| *code != 0).unwrap_or(1)
            }
        }
        Commands::Status => {
            let settings = load_settings()?;
            let reconciler = Reconciler::new(&settings, SystemLauncher, inherited_env());
            let env = reconciler.load(&mut std::io::sink());
            let status = reconciler.status(&env)?;
            println!("Build: {}", status);
            if status.needs_build() {
                1
            } else {
                0
            }
        }
        Commands::Env { mask } => {
            let mut settings = load_settings()?;
            settings.mask_values |= mask;
            let reconciler = Reconciler::new(&settings, SystemLauncher, inherited_env());
            reconciler.load(&mut stdout);
            0
        }
        Commands::Init { force } => {
            handle_init(&cli.app_root, force)?;
            0
        }
    };

    std::process::exit(code);
}
