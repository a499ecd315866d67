//! Ansible inventory rendering.
//!
//! The inventory groups node names into role buckets. Only freshly
//! provisioned (inner) nodes are listed; the outer control host runs the
//! playbooks but is never managed by them.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::model::{Credential, MembershipType, NodeSpec, RoleKind};
use crate::template;

/// Errors raised while rendering an inventory.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum InventoryError {
    /// Raised when a node uses a credential the inventory cannot express.
    #[error("node {node} uses unsupported auth type {account_type}")]
    UnsupportedAuthType {
        /// Offending node name.
        node: String,
        /// Account type tag of the credential.
        account_type: String,
    },
}

/// Rendered inventory buckets, each a newline-terminated list of lines.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Inventory {
    /// Host lines with connection variables.
    pub all: String,
    /// Etcd members.
    pub etcd: String,
    /// Control-plane nodes.
    pub kube_master: String,
    /// Workload nodes.
    pub kube_worker: String,
    /// Masters being added.
    pub new_master: String,
    /// Workers being added.
    pub new_worker: String,
    /// Etcd members being added.
    pub new_etcd: String,
    /// Masters being removed.
    pub del_master: String,
    /// Workers being removed.
    pub del_worker: String,
    /// Etcd members being removed.
    pub del_etcd: String,
    /// Nodes being removed entirely.
    pub del_node: String,
}

/// Builds the base inventory for `nodes`.
///
/// Outer nodes are skipped. Role buckets are filled from the role
/// predicates, so a combined role lands in every matching bucket.
///
/// # Errors
///
/// Returns [`InventoryError::UnsupportedAuthType`] when an inner node uses
/// key based authentication.
pub fn render<'a, I>(nodes: I) -> Result<Inventory, InventoryError>
where
    I: IntoIterator<Item = &'a NodeSpec>,
{
    let mut inventory = Inventory::default();
    for node in nodes {
        if node.membership != MembershipType::Inner {
            continue;
        }
        inventory.add_host(node)?;
        for kind in node.role.kinds() {
            push_line(inventory.base_bucket(kind), &node.name);
        }
    }
    Ok(inventory)
}

impl Inventory {
    /// Appends the connection line for `node` to the all-hosts bucket
    /// without listing it in any role bucket.
    ///
    /// # Errors
    ///
    /// Returns [`InventoryError::UnsupportedAuthType`] for key based
    /// credentials.
    pub fn add_host(&mut self, node: &NodeSpec) -> Result<(), InventoryError> {
        let Credential::Password { username, password } = &node.credential else {
            return Err(InventoryError::UnsupportedAuthType {
                node: node.name.clone(),
                account_type: node.credential.account_type().to_owned(),
            });
        };
        push_line(
            &mut self.all,
            &format!(
                "{} ansible_host={} ansible_port={} ansible_user={username} ansible_ssh_pass={password}",
                node.name, node.host, node.port
            ),
        );
        Ok(())
    }

    /// Lists `node` in the `new-*` buckets for each role it holds.
    pub fn add_new_node(&mut self, node: &NodeSpec) {
        for kind in node.role.kinds() {
            push_line(self.new_bucket(kind), &node.name);
        }
    }

    /// Lists `node_name` in the `del-*` bucket for `kind`.
    pub fn mark_role_removed(&mut self, node_name: &str, kind: RoleKind) {
        push_line(self.del_bucket(kind), node_name);
    }

    /// Lists `node` in `del-node` and in the `del-*` bucket of each role.
    pub fn mark_node_removed(&mut self, node: &NodeSpec) {
        push_line(&mut self.del_node, &node.name);
        for kind in node.role.kinds() {
            self.mark_role_removed(&node.name, kind);
        }
    }

    /// Substitutes the buckets into `template`.
    #[must_use]
    pub fn to_text(&self, template_text: &str) -> String {
        let values = BTreeMap::from([
            ("all", self.all.as_str()),
            ("etcd", self.etcd.as_str()),
            ("kube-master", self.kube_master.as_str()),
            ("kube-worker", self.kube_worker.as_str()),
            ("new-master", self.new_master.as_str()),
            ("new-worker", self.new_worker.as_str()),
            ("new-etcd", self.new_etcd.as_str()),
            ("del-master", self.del_master.as_str()),
            ("del-worker", self.del_worker.as_str()),
            ("del-etcd", self.del_etcd.as_str()),
            ("del-node", self.del_node.as_str()),
        ]);
        template::substitute(template_text, &values)
    }

    const fn base_bucket(&mut self, kind: RoleKind) -> &mut String {
        match kind {
            RoleKind::Master => &mut self.kube_master,
            RoleKind::Etcd => &mut self.etcd,
            RoleKind::Worker => &mut self.kube_worker,
        }
    }

    const fn new_bucket(&mut self, kind: RoleKind) -> &mut String {
        match kind {
            RoleKind::Master => &mut self.new_master,
            RoleKind::Etcd => &mut self.new_etcd,
            RoleKind::Worker => &mut self.new_worker,
        }
    }

    const fn del_bucket(&mut self, kind: RoleKind) -> &mut String {
        match kind {
            RoleKind::Master => &mut self.del_master,
            RoleKind::Etcd => &mut self.del_etcd,
            RoleKind::Worker => &mut self.del_worker,
        }
    }
}

fn push_line(bucket: &mut String, line: &str) {
    bucket.push_str(line);
    bucket.push('\n');
}
