//! Gavel CLI
//!
//! A command-line tool for judging untrusted submissions in isolated containers.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gavel::{
    BatchSubmission, CancelToken, Config, EXAMPLE_CONFIG, Engine, Submission, Verdict,
    parse_memory_size,
};
use serde::Deserialize;
use tracing::{Level, debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gavel")]
#[command(about = "A secure execution engine for online-judge submissions")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path (default: gavel.toml)
        #[arg(short, long, default_value = "gavel.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(short, long)]
        force: bool,
    },

    /// List available languages
    Languages,

    /// Show the effective engine configuration
    ShowConfig,

    /// Check that the container runtime and every language image are ready
    Check {
        /// Print the readiness report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Pull the image of every configured language
    Provision,

    /// Judge a single source file
    Run {
        /// Source file to run
        #[arg(value_name = "FILE")]
        source: PathBuf,

        /// Language ID or alias (e.g., python, cpp, c++)
        #[arg(short, long)]
        language: String,

        /// Input file fed to stdin
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Expected output file
        #[arg(short, long)]
        expected: Option<PathBuf>,

        /// Time limit in seconds
        #[arg(short, long)]
        time_limit: Option<f64>,

        /// Memory limit in KB, or with a k/m/g suffix (e.g., 128m)
        #[arg(short, long, value_parser = parse_memory_size)]
        memory_limit: Option<u64>,

        /// Run on the host if the container runtime is unreachable (unsafe)
        #[arg(long)]
        insecure_fallback: bool,

        /// Print the verdict as JSON
        #[arg(long)]
        json: bool,
    },

    /// Judge a JSON request (a submission, or a source with test cases)
    Judge {
        /// Request file
        #[arg(short, long, value_name = "FILE")]
        request: PathBuf,

        /// Run on the host if the container runtime is unreachable (unsafe)
        #[arg(long)]
        insecure_fallback: bool,
    },
}

/// Body of a `judge` request
#[derive(Deserialize)]
#[serde(untagged)]
enum Request {
    Batch(BatchSubmission),
    Single(Submission),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    // logs go to stderr, stdout carries program output and JSON
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = if let Some(ref path) = cli.config {
        info!(?path, "loading configuration");
        Config::from_file(path).context("failed to load configuration")?
    } else {
        debug!("using default configuration");
        Config::default()
    };

    match cli.command {
        Commands::Init { output, force } => init_config(&output, force).await,
        Commands::Languages => list_languages(&config),
        Commands::ShowConfig => {
            show_config(&config);
            Ok(())
        }
        Commands::Check { json } => check(&config, json).await,
        Commands::Provision => provision(&config).await,
        Commands::Run {
            source,
            language,
            input,
            expected,
            time_limit,
            memory_limit,
            insecure_fallback,
            json,
        } => {
            config.insecure_fallback |= insecure_fallback;

            let mut submission = Submission::new(language, read_text(&source, "source").await?);
            if let Some(path) = input {
                submission = submission.with_stdin(read_text(&path, "input").await?);
            }
            if let Some(path) = expected {
                submission = submission.with_expected_output(read_text(&path, "expected output").await?);
            }
            submission.limits.time_limit = time_limit;
            submission.limits.memory_limit = memory_limit;

            run_submission(&config, &submission, json).await
        }
        Commands::Judge {
            request,
            insecure_fallback,
        } => {
            config.insecure_fallback |= insecure_fallback;
            judge_request(&config, &request).await
        }
    }
}

async fn read_text(path: &Path, what: &str) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {what} file '{}'", path.display()))
}

/// Cancel the returned token on Ctrl-C so the environment is torn down
fn cancel_on_interrupt() -> CancelToken {
    let cancel = CancelToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling attempt");
            token.cancel();
        }
    });
    cancel
}

async fn run_submission(config: &Config, submission: &Submission, json: bool) -> Result<()> {
    let engine = Engine::connect(config)
        .await
        .context("failed to initialize engine")?;

    info!(language = %submission.language, "judging submission");
    let verdict = engine
        .submit(submission, &cancel_on_interrupt())
        .await
        .context("submission failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&verdict)?);
    } else {
        print_verdict(&verdict);
    }

    if verdict.kind().is_pass() {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

fn print_verdict(verdict: &Verdict) {
    let result = &verdict.result;

    if !result.stdout.is_empty() {
        print!("{}", result.stdout_lossy());
    }
    if !result.stderr.is_empty() {
        eprint!("{}", result.stderr_lossy());
    }
    if let Some(message) = &result.message {
        eprintln!("{message}");
    }

    if verdict.is_insecure() {
        warn!("verdict produced WITHOUT container isolation");
    }

    // execution info goes through tracing (stderr), keeping stdout clean for piping
    info!(
        verdict = %verdict.kind(),
        termination = %result.termination,
        phase = ?result.phase,
        wall_time = format_args!("{:.3}s", result.wall_time),
        memory = ?result.memory,
        exit_code = ?result.exit_code,
        truncated = result.truncated,
        "execution result"
    );
}

async fn judge_request(config: &Config, path: &Path) -> Result<()> {
    let body = read_text(path, "request").await?;
    let request: Request = serde_json::from_str(&body).context("invalid judge request")?;

    let engine = Engine::connect(config)
        .await
        .context("failed to initialize engine")?;
    let cancel = cancel_on_interrupt();

    let passed = match request {
        Request::Batch(batch) => {
            let report = engine
                .judge_all(&batch, &cancel)
                .await
                .context("batch failed")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            report.is_accepted()
        }
        Request::Single(submission) => {
            let verdict = engine
                .submit(&submission, &cancel)
                .await
                .context("submission failed")?;
            println!("{}", serde_json::to_string_pretty(&verdict)?);
            verdict.kind().is_pass()
        }
    };

    if passed {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

async fn check(config: &Config, json: bool) -> Result<()> {
    let engine = Engine::connect(config)
        .await
        .context("failed to initialize engine")?;
    let readiness = engine.check_system_requirements().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&readiness)?);
    } else {
        let runtime = if readiness.runtime_available {
            "available"
        } else {
            "unavailable"
        };
        println!("Container runtime: {runtime}");
        if readiness.insecure {
            println!("Mode: INSECURE (host execution)");
        }
        println!("\nLanguage images:\n");
        for (id, ready) in &readiness.images {
            let status = if *ready { "ready" } else { "missing" };
            println!("  {id:<15} {status}");
        }
    }

    if readiness.is_ready() {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

async fn provision(config: &Config) -> Result<()> {
    let engine = Engine::connect(config)
        .await
        .context("failed to initialize engine")?;
    if engine.is_insecure() {
        anyhow::bail!("container runtime is unreachable, nothing to provision");
    }

    let images = engine
        .provision_images()
        .await
        .context("failed to provision images")?;
    for image in images {
        println!("Provisioned {image}");
    }
    Ok(())
}

fn list_languages(config: &Config) -> Result<()> {
    let registry = config.registry().context("invalid language configuration")?;

    println!("Available languages:\n");
    for (id, profile) in registry.iter() {
        let kind = if profile.is_compiled() {
            "compiled"
        } else {
            "interpreted"
        };
        print!("  {:<15} {} ({})", id, profile.name, kind);
        if !profile.aliases.is_empty() {
            print!(" [aliases: {}]", profile.aliases.join(", "));
        }
        println!();
    }
    Ok(())
}

fn show_config(config: &Config) {
    let limits = &config.default_limits;
    println!("Default resource limits:");
    println!("  Wall time limit: {:?} s", limits.wall_time_limit);
    println!("  Compile time limit: {:?} s", limits.compile_time_limit);
    println!("  Memory limit: {:?} KB", limits.memory_limit);
    println!("  CPU share: {:?}", limits.cpu_share);
    println!("  Max processes: {:?}", limits.max_processes);
    println!("  Max open files: {:?}", limits.max_open_files);
    println!("  Max file size: {:?} KB", limits.max_file_size);
    println!("  Max output: {:?} KB", limits.max_output);
    println!();
    println!(
        "Docker host: {}",
        config.docker_host.as_deref().unwrap_or("(local default)")
    );
    println!("Sandbox user: {}", config.sandbox_user);
    match config.max_live_environments {
        Some(max) => println!("Live environments: at most {max} ({:?})", config.admission),
        None => println!("Live environments: unbounded"),
    }
    println!("Insecure fallback: {}", config.insecure_fallback);
    println!();
    println!("Languages configured: {}", config.languages.len());
}

async fn init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists at '{}'. Use --force to overwrite.",
            output.display()
        );
    }

    tokio::fs::write(output, EXAMPLE_CONFIG)
        .await
        .context("failed to write configuration file")?;

    println!("Created configuration file at '{}'", output.display());
    Ok(())
}
