use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use gpu_report_ingest::config::ImportConfig;
use gpu_report_ingest::database_ops::db::Db;
use gpu_report_ingest::orchestrator::run_import;
use gpu_report_ingest::tracing::{init_tracing, DEFAULT_FILTER};
use gpu_report_ingest::util::env as env_util;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "gpu_report_ingest",
    version,
    about = "Bulk import GPU capability reports into PostgreSQL"
)]
struct Cli {
    /// Directory holding extensions.json, extensions_by_platform.json, summary.json
    /// and device_reports.json (env: IMPORT_DATA_DIR)
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Device reports per streamed batch (env: IMPORT_DEVICE_BATCH_SIZE)
    #[arg(long)]
    device_batch_size: Option<usize>,
    /// Rows per bulk INSERT statement (env: IMPORT_INSERT_BATCH_SIZE)
    #[arg(long)]
    insert_batch_size: Option<usize>,
    /// Batches in flight at once (env: IMPORT_CONCURRENCY)
    #[arg(long)]
    concurrency: Option<usize>,
    /// Pool size (env: DB_MAX_CONNS)
    #[arg(long)]
    max_connections: Option<u32>,
}

impl Cli {
    fn apply(self, mut config: ImportConfig) -> ImportConfig {
        if let Some(dir) = self.data_dir {
            config.data_dir = dir;
        }
        if let Some(n) = self.device_batch_size {
            config.device_batch_size = n;
        }
        if let Some(n) = self.insert_batch_size {
            config.insert_batch_size = n;
        }
        if let Some(n) = self.concurrency {
            config.concurrency = n;
        }
        if let Some(n) = self.max_connections {
            config.max_connections = n;
        }
        config
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    env_util::init_env();
    if let Err(e) = init_tracing(DEFAULT_FILTER) {
        eprintln!("{e:#}");
    }

    // Checked before any file or database I/O.
    let database_url = match env_util::db_url() {
        Ok(url) => url,
        Err(e) => {
            error!(error = %format!("{e:#}"), "DATABASE_URL is required");
            return ExitCode::from(1);
        }
    };

    let config = cli.apply(ImportConfig::from_env());
    match run(&database_url, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "import failed");
            ExitCode::from(1)
        }
    }
}

async fn run(database_url: &str, config: &ImportConfig) -> Result<()> {
    config.validate()?;
    let db = Db::connect(database_url, config.max_connections).await?;
    let summary = run_import(&db, config).await?;
    summary.log();
    db.pool.close().await;
    info!("done");
    Ok(())
}
