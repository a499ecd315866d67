//! Cluster agent installation commands.

use std::collections::BTreeMap;

use shell_escape::unix::escape;
use thiserror::Error;

use crate::config::HoistConfig;
use crate::model::Cluster;
use crate::template;

/// Errors raised while building an agent install command.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum AgentError {
    /// Raised when a cluster attribute cannot be placed in a shell command.
    #[error("cluster {field} `{value}` contains characters unsafe for a shell command")]
    UnsafeValue {
        /// Attribute name.
        field: &'static str,
        /// Offending value.
        value: String,
    },
}

/// Source of the command that installs the cluster agent once the cluster
/// is bootstrapped.
pub trait AgentCommands: Send + Sync {
    /// Command to run on the control host, or `None` when no agent is
    /// configured.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError`] when the command cannot be built for
    /// `cluster`.
    fn install_command(&self, cluster: &Cluster) -> Result<Option<String>, AgentError>;
}

/// Builds the agent command from `agent_install_template`.
///
/// Supports `{{cluster-id}}`, `{{cluster-code}}`, and `{{cluster-name}}`.
/// The name is shell-quoted; the code must already be a plain identifier.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TemplateAgentCommands {
    template: Option<String>,
}

impl TemplateAgentCommands {
    /// Uses `template` verbatim.
    #[must_use]
    pub const fn new(template: Option<String>) -> Self {
        Self { template }
    }

    /// Uses the configured template.
    #[must_use]
    pub fn from_config(config: &HoistConfig) -> Self {
        Self::new(config.agent_install_template.clone())
    }
}

impl AgentCommands for TemplateAgentCommands {
    fn install_command(&self, cluster: &Cluster) -> Result<Option<String>, AgentError> {
        let Some(text) = self.template.as_deref() else {
            return Ok(None);
        };
        let id = cluster.id.to_string();
        let name = escape(cluster.name.as_str().into());
        let values = BTreeMap::from([
            ("cluster-id", id.as_str()),
            ("cluster-code", plain_identifier("code", &cluster.code)?),
            ("cluster-name", name.as_ref()),
        ]);
        Ok(Some(template::substitute(text, &values)))
    }
}

fn plain_identifier<'a>(field: &'static str, value: &'a str) -> Result<&'a str, AgentError> {
    let safe = value
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'));
    if safe && !value.is_empty() {
        Ok(value)
    } else {
        Err(AgentError::UnsafeValue {
            field,
            value: value.to_owned(),
        })
    }
}
