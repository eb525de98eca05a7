//! Download manager CLI application
//!
//! Command-line front end for the transfer engine: fetch files or groups
//! of files, resume interrupted transfers and inspect persisted ones.

use std::process;

use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use download_manager::cli::{
    handle_fetch, handle_group, handle_list, handle_resume, Cli, Commands,
};
use download_manager::config::AppConfig;
use download_manager::constants::logging;
use download_manager::errors::Result;

#[tokio::main]
async fn main() {
    let result = run().await;

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

/// Main application logic
async fn run() -> Result<()> {
    // Load environment variables from .env file if it exists
    dotenv::dotenv().ok();

    let cli = Cli::parse_args();

    if cli.global.config.is_none() {
        AppConfig::initialize_first_run().await?;
    }
    let config = AppConfig::load(cli.global.config.clone()).await?;
    init_logging(&cli, &config);

    info!("Download manager v{} starting", env!("CARGO_PKG_VERSION"));
    let quiet = cli.global.quiet;

    match cli.command {
        Commands::Fetch(args) => {
            info!("Executing fetch command");
            handle_fetch(args, config, quiet).await
        }
        Commands::Group(args) => {
            info!("Executing group command");
            handle_group(args, config, quiet).await
        }
        Commands::Resume => {
            info!("Executing resume command");
            handle_resume(config, quiet).await
        }
        Commands::List => handle_list(config).await,
    }
}

/// Initialize logging based on CLI verbosity settings
///
/// Without -v/-q flags the level from the config file applies.
fn init_logging(cli: &Cli, config: &AppConfig) {
    let flags_given = cli.global.quiet || cli.global.very_verbose || cli.global.verbose > 0;
    let log_level = if flags_given {
        cli.log_level().to_string().to_lowercase()
    } else {
        config.logging.level.to_lowercase()
    };

    let mut filter = EnvFilter::from_default_env();
    if let Ok(directive) = format!("{}={}", logging::CRATE_TARGET, log_level).parse() {
        filter = filter.add_directive(directive);
    }

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(cli.global.very_verbose || cli.global.verbose >= 2)
        .with_writer(std::io::stderr)
        .init();

    if cli.global.very_verbose || cli.global.verbose >= 2 {
        info!("Very verbose logging enabled");
    } else if cli.global.verbose == 1 {
        info!("Verbose logging enabled");
    }
}
