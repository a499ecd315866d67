//! Command-line interface definitions for the `hoist` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser};

/// Top-level CLI for the `hoist` binary.
#[derive(Debug, Parser)]
#[command(
    name = "hoist",
    about = "Provision Kubernetes clusters over SSH and reconcile their operations",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Check that a host accepts an SSH login.
    #[command(name = "test-connection", about = "Check that a host accepts an SSH login")]
    TestConnection(TestConnectionCommand),
    /// Render the playbook inventory for a node list.
    #[command(
        name = "render-inventory",
        about = "Render the playbook inventory for a JSON node list"
    )]
    RenderInventory(RenderInventoryCommand),
    /// Finalize operation records whose remote work has finished.
    #[command(
        name = "reconcile",
        about = "Finalize operation records whose remote work has finished"
    )]
    Reconcile(ReconcileCommand),
}

/// Arguments for `hoist test-connection`.
#[derive(Debug, Parser)]
pub(crate) struct TestConnectionCommand {
    /// Hostname or IP address.
    #[arg(long)]
    pub(crate) host: String,
    /// SSH port.
    #[arg(long, default_value_t = 22)]
    pub(crate) port: u16,
    /// Remote login.
    #[arg(long)]
    pub(crate) user: String,
    /// How to authenticate.
    #[command(flatten)]
    pub(crate) auth: AuthArgs,
}

/// Exactly one authentication method.
#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
pub(crate) struct AuthArgs {
    /// Password, read from the environment when possible.
    #[arg(long, env = "HOIST_SSH_PASSWORD", hide_env_values = true)]
    pub(crate) password: Option<String>,
    /// Private key passed to `ssh -i`.
    #[arg(long, value_name = "PATH")]
    pub(crate) identity_file: Option<String>,
}

/// Arguments for `hoist render-inventory`.
#[derive(Debug, Parser)]
pub(crate) struct RenderInventoryCommand {
    /// JSON file holding an array of node specifications.
    #[arg(value_name = "NODES_JSON")]
    pub(crate) nodes: String,
}

/// Arguments for `hoist reconcile`.
#[derive(Debug, Parser)]
pub(crate) struct ReconcileCommand {
    /// Run a single sweep and exit instead of looping.
    #[arg(long)]
    pub(crate) once: bool,
}
