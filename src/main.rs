use anyhow::{Context, Result, bail};
use casedraft::config::Config;
use casedraft::logging::{self, LogFile, LogOptions};
use casedraft::processing::{
    ChannelProgress, IntegratedReport, IntegrationStatus, Pipeline, PipelineContext,
    PipelineEvent, PipelineStatus, PromptContext,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(
    name = "casedraft",
    version,
    about = "Summarize long case documents with token-bounded chunking"
)]
struct Cli {
    /// Increase log verbosity (-v, -vv) when RUST_LOG is unset.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Write file logs to this path instead of the default.
    #[arg(long, global = true, conflicts_with = "no_log_file")]
    log_file: Option<PathBuf>,
    /// Log to stderr only.
    #[arg(long, global = true)]
    no_log_file: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Summarize documents into `<basename>_summary.md` files.
    Summarize {
        /// Input files or directories.
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        #[arg(long)]
        output_dir: PathBuf,
        #[command(flatten)]
        context: ContextArgs,
    },
    /// Combine every summary in a directory into `integrated_analysis.md`.
    Integrate {
        #[arg(long)]
        output_dir: PathBuf,
        /// Regenerate even if the report exists.
        #[arg(long)]
        force: bool,
        #[command(flatten)]
        context: ContextArgs,
    },
}

#[derive(clap::Args)]
struct ContextArgs {
    /// Subject name embedded in every prompt.
    #[arg(long)]
    subject: Option<String>,
    /// File containing case background for every prompt.
    #[arg(long)]
    case_background: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let file = match (cli.no_log_file, cli.log_file) {
        (true, _) => LogFile::Disabled,
        (false, Some(path)) => LogFile::Path(path),
        (false, None) => LogFile::Default,
    };
    logging::init_tracing(&LogOptions {
        verbosity: cli.verbose,
        file,
    });

    let config = Config::from_env().context("failed to load configuration")?;
    let context = PipelineContext::from_config(&config).context("failed to initialize providers")?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received; stopping after the current step");
                cancel.cancel();
            }
        }
    });

    match cli.command {
        Command::Summarize {
            inputs,
            output_dir,
            context: args,
        } => {
            let prompt = args.load().await?;
            summarize(context, inputs, output_dir, prompt, cancel).await
        }
        Command::Integrate {
            output_dir,
            force,
            context: args,
        } => {
            let prompt = args.load().await?;
            integrate(context, &output_dir, force, &prompt, &cancel).await
        }
    }
}

impl ContextArgs {
    async fn load(self) -> Result<PromptContext> {
        let case_background = match self.case_background {
            Some(path) => Some(
                tokio::fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("failed to read {}", path.display()))?,
            ),
            None => None,
        };
        Ok(PromptContext::new(self.subject, case_background))
    }
}

async fn summarize(
    context: PipelineContext,
    inputs: Vec<PathBuf>,
    output_dir: PathBuf,
    prompt: PromptContext,
    cancel: CancellationToken,
) -> Result<()> {
    tokio::fs::create_dir_all(&output_dir)
        .await
        .with_context(|| format!("failed to create {}", output_dir.display()))?;

    let pipeline = Arc::new(Pipeline::new(context));
    let (progress, mut events) = ChannelProgress::channel();
    let worker = tokio::spawn({
        let pipeline = Arc::clone(&pipeline);
        async move {
            pipeline
                .process_batch(&inputs, &output_dir, &prompt, &progress, &cancel)
                .await
        }
    });

    while let Some(event) = events.recv().await {
        match event {
            PipelineEvent::Progress { percent, message } => eprintln!("[{percent:>3}%] {message}"),
            PipelineEvent::Completed(result) => {
                eprintln!("{:?}: {}", result.status, result.output_path.display())
            }
            PipelineEvent::Failed { document_id, error } => {
                eprintln!("failed: {document_id}: {error}")
            }
        }
    }
    let results = worker.await.context("pipeline worker stopped unexpectedly")?;

    for result in &results {
        println!("{}", serde_json::to_string(result)?);
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&pipeline.metrics_snapshot())?
    );

    let failed = results
        .iter()
        .filter(|result| result.status == PipelineStatus::Failed)
        .count();
    if failed > 0 {
        bail!("{failed} of {} documents failed", results.len());
    }
    Ok(())
}

async fn integrate(
    context: PipelineContext,
    output_dir: &Path,
    force: bool,
    prompt: &PromptContext,
    cancel: &CancellationToken,
) -> Result<()> {
    let status = IntegratedReport::new(&context, prompt)
        .generate(output_dir, force, cancel)
        .await
        .context("integrated analysis failed")?;
    match status {
        IntegrationStatus::Written(path) => println!("written: {}", path.display()),
        IntegrationStatus::Skipped(path) => println!("skipped (exists): {}", path.display()),
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&context.metrics.snapshot())?
    );
    Ok(())
}
