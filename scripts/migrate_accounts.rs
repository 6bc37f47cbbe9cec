use std::path::{Path, PathBuf};

use account_migrate_lib::engine::manifest::MANIFEST_FILE_NAME;
use account_migrate_lib::engine::{AccountId, EngineLauncher, LocalEngineLauncher};
use account_migrate_lib::fixups::disable_delete_from_server;
use account_migrate_lib::{logging, migrate_accounts, MigrationOptions, MigrationReport};
use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde::Serialize;

#[derive(Parser)]
#[command(
    name = "migrate_accounts",
    about = "Migrate legacy account folders into the unified accounts store"
)]
struct Cli {
    /// Accounts directory (defaults to the per-user DeltaChat config dir)
    #[arg(long, value_name = "PATH")]
    accounts_dir: Option<PathBuf>,

    /// Abort on the first account that fails to migrate
    #[arg(long)]
    strict: bool,

    /// Print the migration report as JSON
    #[arg(long)]
    json: bool,

    /// Do not run post-migration account fixups
    #[arg(long)]
    skip_fixups: bool,

    /// Also write rotated JSON logs into this directory
    #[arg(long, value_name = "PATH")]
    log_dir: Option<PathBuf>,
}

#[derive(Serialize)]
struct RunOutput<'a> {
    migration: &'a MigrationReport,
    fixups: Vec<AccountId>,
}

fn default_accounts_dir() -> Result<PathBuf> {
    let base = dirs::config_dir()
        .ok_or_else(|| anyhow!("no per-user config directory; pass --accounts-dir"))?;
    Ok(base.join("DeltaChat").join("accounts"))
}

async fn run_fixups(accounts_dir: &Path) -> Result<Vec<AccountId>> {
    let engine = LocalEngineLauncher
        .start(accounts_dir)
        .await
        .context("open accounts store for fixups")?;
    let changed = disable_delete_from_server(engine.as_ref()).await;
    engine.close().await.context("close accounts store")?;
    Ok(changed)
}

fn print_summary(dir: &Path, report: &MigrationReport, fixups: &[AccountId]) {
    if !report.performed {
        println!("{}: nothing to migrate", dir.display());
    } else {
        println!(
            "{}: migrated {} account(s), skipped {}, failed {}",
            dir.display(),
            report.migrated.len(),
            report.skipped.len(),
            report.failed.len()
        );
        for account in &report.migrated {
            println!(
                "  {} -> account {}",
                account.source.display(),
                account.account_id
            );
        }
        for failed in &report.failed {
            println!("  FAILED {} ({})", failed.source.display(), failed.reason);
        }
        for failure in &report.cleanup.failures {
            println!("  left behind {}", failure.path.display());
        }
    }
    if !fixups.is_empty() {
        println!("cleared delete_server_after on {} account(s)", fixups.len());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let _log_guard = match &cli.log_dir {
        Some(dir) => Some(logging::init_file_logging(dir).context("initialize file logging")?),
        None => {
            logging::init_logging().context("initialize logging")?;
            None
        }
    };

    let accounts_dir = match cli.accounts_dir {
        Some(dir) => dir,
        None => default_accounts_dir()?,
    };
    let options = MigrationOptions::default().with_strict(cli.strict);

    let report = migrate_accounts(&LocalEngineLauncher, &accounts_dir, options)
        .await
        .with_context(|| format!("migrate accounts in {}", accounts_dir.display()))?;

    let fixups = if !cli.skip_fixups && accounts_dir.join(MANIFEST_FILE_NAME).exists() {
        run_fixups(&accounts_dir).await?
    } else {
        Vec::new()
    };

    if cli.json {
        let output = RunOutput {
            migration: &report,
            fixups,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_summary(&accounts_dir, &report, &fixups);
    }
    Ok(())
}
