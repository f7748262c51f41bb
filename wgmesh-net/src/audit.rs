//! Audit logging for group, client and interface changes.
//!
//! Events go to the `audit` tracing target so they can be filtered or routed
//! separately (`RUST_LOG=audit=info`).

use tracing::info;

/// Network audit logger with domain-specific methods.
#[derive(Debug, Clone)]
pub struct NetAuditLogger {
    enabled: bool,
}

impl Default for NetAuditLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl NetAuditLogger {
    pub fn new() -> Self {
        Self { enabled: true }
    }

    /// Create a noop audit logger (for testing)
    pub fn new_noop() -> Self {
        Self { enabled: false }
    }

    fn log(&self, message: String, object_ids: &[String]) {
        if self.enabled {
            info!(target: "audit", objects = ?object_ids, "{}", message);
        }
    }

    // === Group events ===

    pub fn group_created(&self, group_id: i64, name: &str, cidr: &str) {
        self.log(
            format!("Group '{}' created with range {}", name, cidr),
            &[format!("group/{}", group_id)],
        );
    }

    pub fn group_updated(&self, group_id: i64, name: &str) {
        self.log(
            format!("Group '{}' updated", name),
            &[format!("group/{}", group_id)],
        );
    }

    pub fn group_deleted(&self, group_id: i64, name: &str) {
        self.log(
            format!("Group '{}' deleted", name),
            &[format!("group/{}", group_id)],
        );
    }

    // === Client events ===

    pub fn client_created(&self, group_id: i64, client_id: i64, name: &str, address: &str) {
        self.log(
            format!("Client '{}' created with address {}", name, address),
            &[format!("group/{}", group_id), format!("client/{}", client_id)],
        );
    }

    pub fn client_updated(&self, group_id: i64, client_id: i64, name: &str) {
        self.log(
            format!("Client '{}' updated", name),
            &[format!("group/{}", group_id), format!("client/{}", client_id)],
        );
    }

    pub fn client_deleted(&self, group_id: i64, client_id: i64, name: &str) {
        self.log(
            format!("Client '{}' deleted", name),
            &[format!("group/{}", group_id), format!("client/{}", client_id)],
        );
    }

    // === Interface events ===

    pub fn interface_up(&self, group_id: i64, interface: &str) {
        self.log(
            format!("Interface {} brought up", interface),
            &[format!("group/{}", group_id)],
        );
    }

    pub fn interface_down(&self, group_id: i64, interface: &str) {
        self.log(
            format!("Interface {} brought down", interface),
            &[format!("group/{}", group_id)],
        );
    }

    pub fn interface_failed(&self, group_id: i64, interface: &str, error: &str) {
        self.log(
            format!("Interface {} operation failed: {}", interface, error),
            &[format!("group/{}", group_id)],
        );
    }
}
