use anyhow::Result;
use clap::Parser;
use nbctl::commands;
use nbctl::config::{Config, Overrides};
use nbctl::degrade::{self, FallbackMode};
use nbctl::runtime::RealRuntime;
use std::io;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// nbctl - command-line client for a notebook research API
///
/// Replayable requests are retried with exponential backoff; uploads and
/// streams are sent once. Press Ctrl-C to cancel a request in flight.
///
/// If NBCTL_TOKEN is set, it is sent as a bearer token.
///
/// Examples:
///   nbctl request GET /api/notebooks
///   nbctl stream /api/chat/execute --data '{"message": "hi"}'
///   nbctl diagnose
#[derive(Parser, Debug)]
#[command(author, version = env!("NBCTL_VERSION"), about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// API base URL (defaults to http://localhost:5055)
    #[arg(long = "api-url", value_name = "URL", global = true)]
    pub api_url: Option<String>,

    /// Retries for replayable requests (overrides config and NBCTL_MAX_RETRIES)
    #[arg(long = "max-retries", value_name = "N", global = true)]
    pub max_retries: Option<u32>,

    /// More logging; repeat for debug output
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Send a request and print the response body
    Request(RequestArgs),

    /// Open an event stream and print content as it arrives
    Stream(StreamArgs),

    /// Upload a file as multipart form data
    Upload(UploadArgs),

    /// Check DNS, TCP and HTTP connectivity to the API server
    Diagnose(DiagnoseArgs),

    /// Show the effective configuration
    Config,
}

#[derive(clap::Args, Debug)]
pub struct RequestArgs {
    /// HTTP method, e.g. GET or POST
    #[arg(value_name = "METHOD")]
    pub method: String,

    /// Path below the API URL, e.g. /api/notebooks
    #[arg(value_name = "PATH")]
    pub path: String,

    /// JSON request body
    #[arg(long, short = 'd', value_name = "JSON")]
    pub data: Option<String>,

    /// Print the status line and response headers
    #[arg(long, short = 'i')]
    pub include: bool,
}

#[derive(clap::Args, Debug)]
pub struct StreamArgs {
    #[arg(value_name = "PATH")]
    pub path: String,

    /// JSON request body
    #[arg(long, short = 'd', value_name = "JSON", default_value = "{}")]
    pub data: String,
}

#[derive(clap::Args, Debug)]
pub struct UploadArgs {
    #[arg(value_name = "PATH")]
    pub path: String,

    /// File to upload
    #[arg(value_name = "FILE")]
    pub file: PathBuf,

    /// Form field name for the file
    #[arg(long = "file-field", value_name = "NAME", default_value = "file")]
    pub file_field: String,

    /// Extra form field, repeatable
    #[arg(
        long = "field",
        short = 'F',
        value_name = "NAME=VALUE",
        value_parser = commands::parse_field
    )]
    pub fields: Vec<(String, String)>,
}

#[derive(clap::Args, Debug)]
pub struct DiagnoseArgs {
    /// URL to probe (defaults to the API URL)
    #[arg(value_name = "URL")]
    pub target: Option<String>,
}

fn log_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_level(cli.verbose)),
    )
    .init();

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let result = run(cli, &cancel).await;
    if let Err(e) = &result {
        let mode = degrade::evaluate_error(e);
        if mode != FallbackMode::None {
            eprintln!("{}", degrade::message(mode));
        }
    }
    result
}

async fn run(cli: Cli, cancel: &CancellationToken) -> Result<()> {
    let runtime = RealRuntime;
    let overrides = Overrides {
        api_url: cli.api_url,
        max_retries: cli.max_retries,
    };
    let config = Config::load(&runtime, &overrides)?;
    let mut out = io::stdout().lock();

    match cli.command {
        Commands::Request(args) => {
            let client = config.http_client()?;
            commands::request(
                &client,
                &args.method,
                &args.path,
                args.data.as_deref(),
                args.include,
                cancel,
                &mut out,
            )
            .await?
        }
        Commands::Stream(args) => {
            let client = config.http_client()?;
            commands::stream(&client, &args.path, &args.data, cancel, &mut out).await?
        }
        Commands::Upload(args) => {
            let client = config.http_client()?;
            commands::upload(
                &runtime,
                &client,
                &args.path,
                &args.file,
                &args.file_field,
                &args.fields,
                cancel,
                &mut out,
            )
            .await?
        }
        Commands::Diagnose(args) => {
            commands::diagnose(&config, args.target.as_deref(), cancel, &mut out).await?
        }
        Commands::Config => commands::show_config(&config, &mut out)?,
    }
    Ok(())
}
