use std::io::{BufRead, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use log::LevelFilter;
use runlet_chunks::{ChunkType, ConfirmationRequest};
use runlet_core::config::ConfigLoader;
use runlet_core::{
    ChunkStream, ConfirmationHandler, ConfirmationResponse, EngineError, ExecutionController,
    SessionRegistry,
};
use runlet_server::{RunletServer, ServerConfig};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[clap(
    name = "runlet",
    author,
    version = "0.1.0",
    about = "Runlet interactive code execution engine"
)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    #[clap(
        long,
        short,
        help = "Language configuration file (defaults to runlet.yaml, then built-ins)"
    )]
    config: Option<PathBuf>,

    #[clap(long, short, default_value = "warn")]
    log_level: String,

    #[clap(long, help = "Print every chunk as raw JSON instead of rendered text")]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute one code submission and stream its output
    Run {
        #[clap(long, short, help = "Language to execute, e.g. python, shell, javascript")]
        language: String,

        #[clap(long, short = 'e', help = "Code to execute")]
        code: Option<String>,

        #[clap(long, short, help = "File containing the code to execute")]
        file: Option<PathBuf>,

        #[clap(long, help = "Ask for approval before executing")]
        confirm: bool,
    },
    /// Read lines from stdin and execute each as one submission, keeping
    /// interpreter state alive between them (:reset starts over)
    Repl {
        #[clap(long, short, help = "Language to execute")]
        language: String,
    },
    /// Serve the chunk stream over HTTP (SSE)
    Serve {
        #[clap(long, default_value = "127.0.0.1:3000")]
        bind_addr: String,
    },
}

fn init_logging(level: &str) {
    let level = level.parse::<LevelFilter>().unwrap_or(LevelFilter::Warn);
    env_logger::Builder::new().filter_level(level).init();
}

/// Asks the operator on the terminal before an execution proceeds.
struct PromptConfirmationHandler;

#[async_trait]
impl ConfirmationHandler for PromptConfirmationHandler {
    async fn request_confirmation(
        &self,
        request: &ConfirmationRequest,
    ) -> Result<ConfirmationResponse, EngineError> {
        let language = request.language.clone();
        let code = request.code.clone();
        tokio::task::spawn_blocking(move || {
            eprintln!("About to run the following {} code:\n{}", language, code);
            eprint!("Proceed? [y/N] ");
            std::io::stderr().flush().ok();

            let mut answer = String::new();
            std::io::stdin()
                .lock()
                .read_line(&mut answer)
                .map_err(|err| EngineError::IoError(err.to_string()))?;

            if answer.trim().eq_ignore_ascii_case("y") {
                Ok(ConfirmationResponse::Approve)
            } else {
                Ok(ConfirmationResponse::Deny)
            }
        })
        .await
        .map_err(|err| EngineError::IoError(err.to_string()))?
    }
}

/// Render one execution's chunks to the terminal.
///
/// Returns whether the execution surfaced an error chunk.
async fn print_chunks(mut chunks: ChunkStream, verbose: bool) -> Result<bool> {
    let mut stdout = std::io::stdout();
    let mut saw_error = false;

    while let Some(chunk) = chunks.next().await {
        if verbose {
            println!("{}", chunk.to_json().context("serializing chunk")?);
            continue;
        }
        match chunk.chunk_type {
            ChunkType::Console => {
                if let Some(text) = chunk.content.as_text() {
                    stdout.write_all(text.as_bytes())?;
                    stdout.flush()?;
                }
            }
            ChunkType::Error => {
                if let Some(text) = chunk.content.as_text() {
                    eprintln!("{}", text);
                }
                saw_error = true;
            }
            // Line notices and confirmations are control traffic; the
            // confirmation itself is handled by the prompt handler.
            ChunkType::ActiveLine | ChunkType::Confirmation => {}
        }
    }

    Ok(saw_error)
}

async fn load_registry(config: Option<&PathBuf>) -> Result<Arc<SessionRegistry>> {
    let languages = match config {
        Some(path) => runlet_core::config::load_config(path)
            .await
            .with_context(|| format!("loading {}", path.display()))?,
        None => ConfigLoader::load_default()
            .await
            .context("loading default language configuration")?,
    };
    Ok(Arc::new(SessionRegistry::new(languages)))
}

async fn run_once(
    registry: Arc<SessionRegistry>,
    language: &str,
    code: &str,
    confirm: bool,
    verbose: bool,
) -> Result<bool> {
    let mut controller = ExecutionController::new(registry);
    if confirm {
        controller = controller.with_confirmation(Arc::new(PromptConfirmationHandler));
    }

    let chunks = controller
        .run(language, code, CancellationToken::new())
        .await
        .context("starting execution")?;
    print_chunks(chunks, verbose).await
}

async fn repl(registry: Arc<SessionRegistry>, language: &str, verbose: bool) -> Result<()> {
    let controller = ExecutionController::new(Arc::clone(&registry));
    eprintln!(
        "runlet repl ({}): one submission per line, :reset to restart, Ctrl-D to exit",
        language
    );

    let stdin = std::io::stdin();
    let mut line = String::new();
    loop {
        line.clear();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let submission = line.trim_end_matches('\n');
        if submission.trim().is_empty() {
            continue;
        }
        if submission.trim() == ":reset" {
            registry.reset(language).await;
            eprintln!("session reset");
            continue;
        }

        let chunks = controller
            .run(language, submission, CancellationToken::new())
            .await
            .context("starting execution")?;
        print_chunks(chunks, verbose).await?;
    }
    Ok(())
}

async fn serve(registry: Arc<SessionRegistry>, bind_addr: &str) -> Result<()> {
    let controller = Arc::new(ExecutionController::new(registry));
    let config = ServerConfig::new()
        .with_bind_addr_str(bind_addr)
        .context("parsing bind address")?;

    RunletServer::with_config(controller, config)
        .serve_with_shutdown(runlet_server::shutdown_signal())
        .await
        .context("running server")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let registry = load_registry(cli.config.as_ref()).await?;

    match cli.command {
        Commands::Run {
            language,
            code,
            file,
            confirm,
        } => {
            let code = match (code, file) {
                (Some(code), None) => code,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                (None, None) => {
                    let mut buffer = String::new();
                    std::io::stdin()
                        .lock()
                        .read_to_string(&mut buffer)
                        .context("reading code from stdin")?;
                    buffer
                }
                (Some(_), Some(_)) => {
                    anyhow::bail!("pass either --code or --file, not both");
                }
            };

            let failed = run_once(registry, &language, &code, confirm, cli.verbose).await?;
            if failed {
                std::process::exit(1);
            }
        }
        Commands::Repl { language } => {
            repl(registry, &language, cli.verbose).await?;
        }
        Commands::Serve { bind_addr } => {
            serve(registry, &bind_addr).await?;
        }
    }

    Ok(())
}
