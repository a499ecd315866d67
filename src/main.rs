//! Binary entry point for the `hoist` CLI.

use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use clap::Parser;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use hoist::config::{ConfigError, HoistConfig};
use hoist::inventory::{self, InventoryError};
use hoist::kv::{DirKvStore, KvError};
use hoist::logging;
use hoist::model::{Credential, HostConnection, NodeSpec};
use hoist::reconcile::{
    ReconcileError, ReconcileLoop, StatusReconciler, Sweep, SweepReport, TemplateAgentCommands,
};
use hoist::session::{self, ProcessCommandRunner, SshConnector, SshSettings};
use hoist::store::{MemoryRecordStore, StoreError};
use hoist::template::{TemplateError, Templates};

mod cli;

use cli::{Cli, ReconcileCommand, RenderInventoryCommand, TestConnectionCommand};

type CliReconciler = StatusReconciler<
    SshConnector<ProcessCommandRunner>,
    DirKvStore,
    MemoryRecordStore,
    TemplateAgentCommands,
>;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("template error: {0}")]
    Template(#[from] TemplateError),
    #[error("state error: {0}")]
    Store(#[from] StoreError),
    #[error("lock store error: {0}")]
    Kv(#[from] KvError),
    #[error("inventory error: {0}")]
    Inventory(#[from] InventoryError),
    #[error("failed to read {path}: {message}")]
    Read { path: Utf8PathBuf, message: String },
    #[error("invalid node list in {path}: {message}")]
    Parse { path: Utf8PathBuf, message: String },
    #[error("reconcile failed: {0}")]
    Reconcile(#[from] ReconcileError),
    #[error("reconcile task failed: {0}")]
    Task(String),
    #[error("host {host} is not reachable over ssh")]
    Unreachable { host: String },
}

#[tokio::main]
async fn main() {
    logging::init();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    match cli {
        Cli::TestConnection(args) => run_test_connection(&args),
        Cli::RenderInventory(args) => run_render_inventory(&args),
        Cli::Reconcile(args) => run_reconcile(&args).await,
    }
}

fn load_config() -> Result<HoistConfig, CliError> {
    let config = HoistConfig::load_without_cli_args()?;
    config.validate()?;
    Ok(config)
}

fn run_test_connection(args: &TestConnectionCommand) -> Result<(), CliError> {
    let config = load_config()?;
    let connector = SshConnector::new(SshSettings::from_config(&config), ProcessCommandRunner);
    let target = connection_from_args(args);
    if !session::test_connection(&connector, &target) {
        return Err(CliError::Unreachable {
            host: target.host,
        });
    }
    writeln!(io::stdout(), "{} is reachable", target.host).ok();
    Ok(())
}

fn connection_from_args(args: &TestConnectionCommand) -> HostConnection {
    let credential = match (&args.auth.password, &args.auth.identity_file) {
        (_, Some(identity_file)) => Credential::PrivateKey {
            username: args.user.clone(),
            identity_file: identity_file.clone(),
        },
        (password, None) => Credential::Password {
            username: args.user.clone(),
            password: password.clone().unwrap_or_default(),
        },
    };
    HostConnection {
        host: args.host.clone(),
        port: args.port,
        credential,
    }
}

fn run_render_inventory(args: &RenderInventoryCommand) -> Result<(), CliError> {
    let config = load_config()?;
    let templates = Templates::from_config(&config)?;
    let path = Utf8PathBuf::from(&args.nodes);
    let nodes = parse_nodes(&path, &read_file(&path)?)?;
    let rendered = inventory::render(&nodes)?.to_text(&templates.inventory);
    write!(io::stdout(), "{rendered}").ok();
    Ok(())
}

fn read_file(path: &Utf8Path) -> Result<String, CliError> {
    let read_error = |message: String| CliError::Read {
        path: path.to_path_buf(),
        message,
    };
    let name = path
        .file_name()
        .ok_or_else(|| read_error(String::from("path is missing a filename")))?;
    let parent = match path.parent() {
        Some(dir) if !dir.as_str().is_empty() => dir,
        _ => Utf8Path::new("."),
    };
    let dir = Dir::open_ambient_dir(parent, ambient_authority())
        .map_err(|err| read_error(err.to_string()))?;
    dir.read_to_string(name)
        .map_err(|err| read_error(err.to_string()))
}

fn parse_nodes(path: &Utf8Path, text: &str) -> Result<Vec<NodeSpec>, CliError> {
    serde_json::from_str(text).map_err(|err| CliError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

async fn run_reconcile(args: &ReconcileCommand) -> Result<(), CliError> {
    let config = Arc::new(load_config()?);
    let state_file = Utf8PathBuf::from(&config.state_file);
    let store = MemoryRecordStore::load(&state_file)?;
    let kv = DirKvStore::open(config.kv_dir.clone())?;
    let connector = SshConnector::new(SshSettings::from_config(&config), ProcessCommandRunner);
    let agent = TemplateAgentCommands::from_config(&config);
    let reconciler = StatusReconciler::new(Arc::clone(&config), connector, kv, store, agent);
    let sweeper = Arc::new(PersistingSweep {
        reconciler,
        state_file,
    });

    if args.once {
        let report = tokio::task::spawn_blocking(move || sweeper.sweep())
            .await
            .map_err(|err| CliError::Task(err.to_string()))??;
        writeln!(
            io::stdout(),
            "finalized {} pruned {} running {} errors {}",
            report.finalized,
            report.pruned,
            report.running,
            report.errors
        )
        .ok();
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            return;
        }
        info!("shutdown requested");
        signal_token.cancel();
    });
    ReconcileLoop::new(sweeper, config.sweep_interval())
        .run(&shutdown)
        .await;
    Ok(())
}

/// Saves the record store after every sweep so the next process resumes
/// from the reconciled state.
struct PersistingSweep {
    reconciler: CliReconciler,
    state_file: Utf8PathBuf,
}

impl Sweep for PersistingSweep {
    fn sweep(&self) -> Result<SweepReport, ReconcileError> {
        let report = self.reconciler.sweep()?;
        if report.acquired {
            self.reconciler.store().save(&self.state_file)?;
        }
        Ok(report)
    }
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
