use std::{path::PathBuf, process::ExitCode};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pg_lob::{PgConnector, StoreConfig, UploadConfig, Uploader};
use pg_lob_bridge::{serve, telemetry, write_result};
use tokio::io::{self, BufReader};
use tracing::info;

#[derive(Debug, Parser)]
#[command(
    name = "pg-lob-bridge",
    version,
    about = "Uploads local files into PostgreSQL large objects"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Upload one file and print the result as a JSON line.
    SaveLargeObject {
        #[arg(long)]
        file_path: PathBuf,
    },
    /// Answer JSON-line `saveLargeObject` calls read from stdin.
    Serve,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let _telemetry = telemetry::init("pg-lob-bridge")?;

    let store = StoreConfig::from_env().context("invalid PostgreSQL configuration")?;
    let upload = UploadConfig::from_env().context("invalid upload configuration")?;
    let connector = PgConnector::new(&store).context("invalid PostgreSQL connection settings")?;
    let uploader = Uploader::new(connector, upload);

    match cli.command {
        Command::SaveLargeObject { file_path } => {
            let result = uploader.spawn(file_path).wait().await;
            write_result(&mut io::stdout(), &result).await?;
            Ok(if result.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Serve => {
            let handled = serve(&uploader, BufReader::new(io::stdin()), io::stdout()).await?;
            info!(handled, "bridge input closed");
            Ok(ExitCode::SUCCESS)
        }
    }
}
