//! Interface lifecycle supervision.
//!
//! The supervisor is the only component that invokes bring-up/bring-down and
//! the only writer of the in-memory interface table. Operations on one group
//! serialize on a per-group lock; different groups run independently.
//!
//! On-disk layout below the config root:
//!
//! ```text
//! <root>/<iface>/<iface>.conf               server configuration
//! <root>/<iface>/peers/client-<id>.conf     one per enabled client
//! ```
//!
//! Directories are created `0700` and files `0600`, since both carry
//! private keys.

use std::collections::{HashMap, HashSet};
use std::fs::Permissions;
use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::audit::NetAuditLogger;
use crate::error::{Error, Result};
use crate::ifname;
use crate::locks::GroupLocks;
use crate::model::Group;
use crate::render;
use crate::store::Store;
use crate::wg::{PeerStats, ToolError, ToolResult, WgTool};

/// Runtime view of one group's interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceState {
    pub interface: String,
    pub running: bool,
    /// Last counters seen per peer public key.
    pub counters: HashMap<String, PeerStats>,
}

/// Outcome of [`InterfaceSupervisor::reconcile_on_startup`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub restored: Vec<i64>,
    pub stopped: Vec<i64>,
    pub failed: Vec<(i64, String)>,
}

/// Live status of a group's interface.
#[derive(Debug, Clone, Serialize)]
pub struct GroupStatus {
    pub group_id: i64,
    pub interface: String,
    pub running: bool,
    pub peers: Vec<PeerStats>,
}

pub struct InterfaceSupervisor {
    store: Arc<Store>,
    wg: Arc<dyn WgTool>,
    config_root: PathBuf,
    command_timeout: Duration,
    locks: GroupLocks,
    states: RwLock<HashMap<i64, InterfaceState>>,
    audit: Arc<NetAuditLogger>,
}

impl InterfaceSupervisor {
    pub fn new(
        store: Arc<Store>,
        wg: Arc<dyn WgTool>,
        config_root: PathBuf,
        command_timeout: Duration,
        audit: Arc<NetAuditLogger>,
    ) -> Self {
        Self {
            store,
            wg,
            config_root,
            command_timeout,
            locks: GroupLocks::new(),
            states: RwLock::new(HashMap::new()),
            audit,
        }
    }

    pub fn config_root(&self) -> &Path {
        &self.config_root
    }

    pub fn interface_dir(&self, interface: &str) -> PathBuf {
        self.config_root.join(interface)
    }

    pub fn server_config_path(&self, interface: &str) -> PathBuf {
        self.interface_dir(interface)
            .join(format!("{}.conf", interface))
    }

    pub fn client_config_path(&self, interface: &str, client_id: i64) -> PathBuf {
        self.interface_dir(interface)
            .join("peers")
            .join(format!("client-{}.conf", client_id))
    }

    /// Snapshot of a group's runtime state.
    pub async fn state(&self, group_id: i64) -> Option<InterfaceState> {
        self.states.read().await.get(&group_id).cloned()
    }

    /// Ids of groups whose interface is up, ascending.
    pub async fn running_groups(&self) -> Vec<i64> {
        let states = self.states.read().await;
        let mut ids: Vec<i64> = states
            .iter()
            .filter(|(_, s)| s.running)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Bring a group's interface up. A no-op when it already is.
    pub async fn ensure_up(&self, group_id: i64) -> Result<()> {
        let _guard = self.locks.lock(group_id).await;
        let group = self.load_group(group_id).await?;
        self.up_locked(&group).await
    }

    /// Bring a group's interface down. A no-op when it already is.
    pub async fn tear_down(&self, group_id: i64) -> Result<()> {
        let _guard = self.locks.lock(group_id).await;
        let group = self.load_group(group_id).await?;
        self.down_locked(&group).await
    }

    /// Tear down and bring up again under one lock, picking up changed
    /// configuration. If the bring-up fails the interface stays down.
    pub async fn restart(&self, group_id: i64) -> Result<()> {
        let _guard = self.locks.lock(group_id).await;
        let group = self.load_group(group_id).await?;
        self.down_locked(&group).await?;
        let group = self.load_group(group_id).await?;
        self.up_locked(&group).await
    }

    /// Apply changed group or client records to the interface: restart it if
    /// it runs and the group is active, stop it if the group was deactivated.
    pub async fn apply_changes(&self, group_id: i64) -> Result<()> {
        let _guard = self.locks.lock(group_id).await;
        let group = self.load_group(group_id).await?;
        if !group.is_running {
            return Ok(());
        }

        if group.is_active {
            self.down_locked(&group).await?;
            let group = self.load_group(group_id).await?;
            self.up_locked(&group).await
        } else {
            self.down_locked(&group).await
        }
    }

    /// Stop the interface of a group about to be deleted and remove its
    /// configuration directory.
    pub async fn decommission(&self, group_id: i64) -> Result<()> {
        {
            let _guard = self.locks.lock(group_id).await;
            let group = self.load_group(group_id).await?;
            self.down_locked(&group).await?;

            let interface = group.interface_name();
            ifname::validate(&interface)?;
            remove_dir(&self.interface_dir(&interface)).await?;
            self.states.write().await.remove(&group_id);
        }
        self.locks.forget(group_id);
        Ok(())
    }

    /// Bring back every group persisted as active and running, and stop
    /// groups persisted as running whose configuration was deactivated.
    /// Per-group failures are collected, not returned.
    pub async fn reconcile_on_startup(&self) -> Result<ReconcileReport> {
        info!("Reconciling interfaces with persisted state...");

        let groups = self.store.list_running_groups().await?;
        let mut report = ReconcileReport::default();

        for group in groups {
            if !group.is_active {
                match self.tear_down(group.id).await {
                    Ok(()) => report.stopped.push(group.id),
                    Err(e) => {
                        warn!(group_id = group.id, error = %e, "Failed to stop inactive group");
                        report.failed.push((group.id, e.to_string()));
                    }
                }
                continue;
            }

            match self.ensure_up(group.id).await {
                Ok(()) => {
                    info!(group_id = group.id, name = %group.name, "Restored interface");
                    report.restored.push(group.id);
                }
                Err(e) => {
                    warn!(group_id = group.id, error = %e, "Failed to restore interface");
                    report.failed.push((group.id, e.to_string()));
                }
            }
        }

        info!(
            restored = report.restored.len(),
            stopped = report.stopped.len(),
            failed = report.failed.len(),
            "Interface reconciliation complete"
        );
        Ok(report)
    }

    /// Query live per-peer counters of a running group and keep them as the
    /// group's last-known snapshot.
    ///
    /// Whether the group runs is read from the store, since another process
    /// may have brought the interface up or down. An interface that is up
    /// but missing from the local table, or recorded under an old name, is
    /// adopted.
    pub async fn peer_counters(&self, group_id: i64) -> Result<Vec<PeerStats>> {
        let _guard = self.locks.lock(group_id).await;
        let group = self.load_group(group_id).await?;
        if !group.is_running {
            return Err(not_running(group_id));
        }
        let interface = self.live_interface(&group).await?;

        let peers = self
            .timed(&format!("show {}", interface), self.wg.show(&interface))
            .await
            .map_err(|e| Error::Sampling {
                group_id,
                reason: e.to_string(),
            })?;

        if let Some(state) = self.states.write().await.get_mut(&group_id) {
            state.counters = peers
                .iter()
                .map(|p| (p.public_key.clone(), p.clone()))
                .collect();
        }
        Ok(peers)
    }

    /// Live status of a group. Peers are only listed while it runs.
    pub async fn status(&self, group_id: i64) -> Result<GroupStatus> {
        let group = self.load_group(group_id).await?;
        let interface = self.recorded_interface(&group).await;
        ifname::validate(&interface)?;

        let running = self
            .timed(&format!("is-up {}", interface), self.wg.is_up(&interface))
            .await
            .map_err(interface_err(&interface))?;
        let peers = if running {
            self.timed(&format!("show {}", interface), self.wg.show(&interface))
                .await
                .map_err(interface_err(&interface))?
        } else {
            Vec::new()
        };

        Ok(GroupStatus {
            group_id,
            interface,
            running,
            peers,
        })
    }

    async fn load_group(&self, group_id: i64) -> Result<Group> {
        self.store
            .get_group(group_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("group {}", group_id)))
    }

    /// The interface name a group is known to run under. Differs from the
    /// derived name after a rename until the next bring-down.
    async fn recorded_interface(&self, group: &Group) -> String {
        match self.states.read().await.get(&group.id) {
            Some(state) => state.interface.clone(),
            None => group.interface_name(),
        }
    }

    /// The interface to query for a group persisted as running.
    async fn live_interface(&self, group: &Group) -> Result<String> {
        let interface = group.interface_name();
        ifname::validate(&interface)?;

        let known = self
            .states
            .read()
            .await
            .get(&group.id)
            .is_some_and(|s| s.running && s.interface == interface);
        if known {
            return Ok(interface);
        }

        let live = self
            .timed(&format!("is-up {}", interface), self.wg.is_up(&interface))
            .await
            .map_err(|e| Error::Sampling {
                group_id: group.id,
                reason: e.to_string(),
            })?;
        if !live {
            return Err(not_running(group.id));
        }

        info!(group_id = group.id, interface = %interface, "Adopting interface started elsewhere");
        self.states.write().await.insert(
            group.id,
            InterfaceState {
                interface: interface.clone(),
                running: true,
                counters: HashMap::new(),
            },
        );
        Ok(interface)
    }

    async fn up_locked(&self, group: &Group) -> Result<()> {
        let interface = group.interface_name();
        ifname::validate(&interface)?;

        // A rename while running leaves the old interface behind
        let recorded = self.recorded_interface(group).await;
        if recorded != interface {
            self.down_locked(group).await?;
        }

        let live = self
            .timed(&format!("is-up {}", interface), self.wg.is_up(&interface))
            .await
            .map_err(interface_err(&interface))?;

        if live {
            let known = self
                .states
                .read()
                .await
                .get(&group.id)
                .is_some_and(|s| s.running);
            if known {
                debug!(group_id = group.id, interface = %interface, "Interface already up");
            } else {
                info!(group_id = group.id, interface = %interface, "Adopting existing interface");
                self.write_configs(group, &interface).await?;
            }
            return self.mark_running(group, &interface).await;
        }

        let config_path = self.write_configs(group, &interface).await?;

        let command = format!("up {}", interface);
        if let Err(source) = self
            .timed(&command, self.wg.up(&interface, &config_path))
            .await
        {
            warn!(
                group_id = group.id,
                interface = %interface,
                error = %source,
                "Bring-up failed"
            );
            self.cleanup_partial(&interface, &config_path).await;
            self.audit
                .interface_failed(group.id, &interface, &source.to_string());
            return Err(Error::Interface { interface, source });
        }

        self.mark_running(group, &interface).await?;
        self.audit.interface_up(group.id, &interface);
        info!(group_id = group.id, interface = %interface, "Interface up");
        Ok(())
    }

    async fn down_locked(&self, group: &Group) -> Result<()> {
        let interface = self.recorded_interface(group).await;
        ifname::validate(&interface)?;

        let live = self
            .timed(&format!("is-up {}", interface), self.wg.is_up(&interface))
            .await
            .map_err(interface_err(&interface))?;

        if live {
            let config_path = self.server_config_path(&interface);
            self.timed(
                &format!("down {}", interface),
                self.wg.down(&interface, &config_path),
            )
            .await
            .map_err(|source| {
                self.audit
                    .interface_failed(group.id, &interface, &source.to_string());
                Error::Interface {
                    interface: interface.clone(),
                    source,
                }
            })?;
            self.audit.interface_down(group.id, &interface);
            info!(group_id = group.id, interface = %interface, "Interface down");
        } else {
            debug!(group_id = group.id, interface = %interface, "Interface already down");
        }

        self.store.set_group_running(group.id, false).await?;

        let current = group.interface_name();
        if interface != current {
            remove_dir(&self.interface_dir(&interface)).await?;
        }
        self.states.write().await.insert(
            group.id,
            InterfaceState {
                interface: current,
                running: false,
                counters: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn mark_running(&self, group: &Group, interface: &str) -> Result<()> {
        self.store.set_group_running(group.id, true).await?;

        let mut states = self.states.write().await;
        let state = states.entry(group.id).or_insert_with(|| InterfaceState {
            interface: interface.to_string(),
            running: false,
            counters: HashMap::new(),
        });
        state.interface = interface.to_string();
        state.running = true;
        Ok(())
    }

    /// Best-effort removal of an interface a failed bring-up left behind.
    async fn cleanup_partial(&self, interface: &str, config_path: &Path) {
        match self
            .timed(&format!("is-up {}", interface), self.wg.is_up(interface))
            .await
        {
            Ok(true) => {
                warn!(interface = %interface, "Bring-up left a partial interface, tearing it down");
                if let Err(e) = self
                    .timed(
                        &format!("down {}", interface),
                        self.wg.down(interface, config_path),
                    )
                    .await
                {
                    warn!(interface = %interface, error = %e, "Failed to remove partial interface");
                }
            }
            Ok(false) => {}
            Err(e) => {
                warn!(interface = %interface, error = %e, "Could not check for partial interface");
            }
        }
    }

    /// Render and write the server file and every enabled client's file.
    /// Unchanged files are not rewritten; files of clients that are no
    /// longer enabled are removed. Returns the server file path.
    async fn write_configs(&self, group: &Group, interface: &str) -> Result<PathBuf> {
        let clients = self.store.list_clients(group.id).await?;
        let rendered = render::render_all(group, &clients, Utc::now());

        let dir = self.interface_dir(interface);
        let peers_dir = dir.join("peers");
        create_private_dir(&dir).await?;
        create_private_dir(&peers_dir).await?;

        let server_path = self.server_config_path(interface);
        write_private(&server_path, &rendered.server).await?;

        let mut keep = HashSet::new();
        for (client_id, text) in &rendered.clients {
            let path = self.client_config_path(interface, *client_id);
            write_private(&path, text).await?;
            keep.insert(path);
        }

        let mut entries = fs::read_dir(&peers_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if is_config_file(&path) && !keep.contains(&path) {
                debug!(path = %path.display(), "Removing stale client config");
                fs::remove_file(&path).await?;
            }
        }

        debug!(
            group_id = group.id,
            interface = %interface,
            clients = rendered.clients.len(),
            "Wrote interface configuration"
        );
        Ok(server_path)
    }

    /// Run a tool call with the command timeout. The call's future is
    /// dropped on expiry, which kills a spawned child.
    async fn timed<T, F>(&self, command: &str, fut: F) -> ToolResult<T>
    where
        F: Future<Output = ToolResult<T>>,
    {
        match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ToolError::Timeout {
                command: command.to_string(),
                after: self.command_timeout,
            }),
        }
    }
}

fn not_running(group_id: i64) -> Error {
    Error::Sampling {
        group_id,
        reason: "interface is not running".to_string(),
    }
}

fn interface_err(interface: &str) -> impl FnOnce(ToolError) -> Error + '_ {
    move |source| Error::Interface {
        interface: interface.to_string(),
        source,
    }
}

/// `*.conf`, or a `*.conf.tmp` left behind by an interrupted write.
fn is_config_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(".conf") || name.ends_with(".conf.tmp"))
}

async fn create_private_dir(path: &Path) -> Result<()> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(path)
        .await?;
    fs::set_permissions(path, Permissions::from_mode(0o700)).await?;
    Ok(())
}

/// Write `contents` readable by the owner only, through a temporary file
/// and a rename so readers never see a partial file.
async fn write_private(path: &Path, contents: &str) -> Result<()> {
    if let Ok(existing) = fs::read_to_string(path).await
        && existing == contents
    {
        fs::set_permissions(path, Permissions::from_mode(0o600)).await?;
        return Ok(());
    }

    let tmp = path.with_extension("conf.tmp");
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&tmp)
        .await?;
    file.write_all(contents.as_bytes()).await?;
    file.sync_all().await?;
    drop(file);

    fs::set_permissions(&tmp, Permissions::from_mode(0o600)).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn remove_dir(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{FakeWg, WgCall, sample_client, sample_group};
    use tempfile::TempDir;

    struct Fixture {
        store: Arc<Store>,
        wg: Arc<FakeWg>,
        supervisor: InterfaceSupervisor,
        _dir: TempDir,
    }

    async fn setup() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::in_memory().await.unwrap());
        let wg = Arc::new(FakeWg::new());
        let supervisor = InterfaceSupervisor::new(
            Arc::clone(&store),
            wg.clone(),
            dir.path().join("wireguard"),
            Duration::from_millis(200),
            Arc::new(NetAuditLogger::new_noop()),
        );
        Fixture {
            store,
            wg,
            supervisor,
            _dir: dir,
        }
    }

    async fn add_client(store: &Store, group: &Group, name: &str) -> i64 {
        let cidr = group.ipv4_cidr;
        store
            .create_client_with(&sample_client(group.id, name), |r| {
                Ok((crate::allocator::allocate_ipv4(&cidr, &r.ipv4)?, None))
            })
            .await
            .unwrap()
            .id
    }

    fn mode(path: &Path) -> u32 {
        std::fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    #[tokio::test]
    async fn test_ensure_up_writes_private_files() {
        let f = setup().await;
        let group = f.store.create_group(&sample_group("office")).await.unwrap();
        let client_id = add_client(&f.store, &group, "laptop").await;

        f.supervisor.ensure_up(group.id).await.unwrap();

        let iface = group.interface_name();
        let server = f.supervisor.server_config_path(&iface);
        let client = f.supervisor.client_config_path(&iface, client_id);
        assert_eq!(mode(&server), 0o600);
        assert_eq!(mode(&client), 0o600);
        assert_eq!(mode(&f.supervisor.interface_dir(&iface)), 0o700);
        assert!(
            std::fs::read_to_string(&server)
                .unwrap()
                .contains("PublicKey = laptop-public")
        );

        assert!(f.store.get_group(group.id).await.unwrap().unwrap().is_running);
        assert_eq!(f.supervisor.running_groups().await, vec![group.id]);
        assert_eq!(f.wg.calls().last(), Some(&WgCall::Up(iface, server)));
    }

    #[tokio::test]
    async fn test_stale_client_files_removed() {
        let f = setup().await;
        let group = f.store.create_group(&sample_group("office")).await.unwrap();
        let keep = add_client(&f.store, &group, "keep").await;
        let gone = add_client(&f.store, &group, "gone").await;

        f.supervisor.ensure_up(group.id).await.unwrap();
        let iface = group.interface_name();
        assert!(f.supervisor.client_config_path(&iface, gone).exists());

        let mut client = f.store.get_client(gone).await.unwrap().unwrap();
        client.is_active = false;
        f.store.update_client(&client).await.unwrap();
        f.supervisor.restart(group.id).await.unwrap();

        assert!(f.supervisor.client_config_path(&iface, keep).exists());
        assert!(!f.supervisor.client_config_path(&iface, gone).exists());
    }

    #[tokio::test]
    async fn test_peer_counters_require_running() {
        let f = setup().await;
        let group = f.store.create_group(&sample_group("office")).await.unwrap();

        assert!(matches!(
            f.supervisor.peer_counters(group.id).await,
            Err(Error::Sampling { .. })
        ));

        f.supervisor.ensure_up(group.id).await.unwrap();
        assert!(f.supervisor.peer_counters(group.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_peer_counters_adopt_interface_started_elsewhere() {
        let f = setup().await;
        let group = f.store.create_group(&sample_group("office")).await.unwrap();
        let iface = group.interface_name();

        // Brought up by another process sharing the store
        f.wg.set_up(&iface);
        f.store.set_group_running(group.id, true).await.unwrap();
        assert!(f.supervisor.state(group.id).await.is_none());

        f.supervisor.peer_counters(group.id).await.unwrap();

        let state = f.supervisor.state(group.id).await.unwrap();
        assert!(state.running);
        assert_eq!(state.interface, iface);
        assert_eq!(f.wg.up_calls(&iface), 0);
    }

    #[tokio::test]
    async fn test_peer_counters_follow_store_after_external_stop() {
        let f = setup().await;
        let group = f.store.create_group(&sample_group("office")).await.unwrap();
        f.supervisor.ensure_up(group.id).await.unwrap();

        // Stopped by another process
        f.wg.remove_interface(&group.interface_name());
        f.store.set_group_running(group.id, false).await.unwrap();

        assert!(matches!(
            f.supervisor.peer_counters(group.id).await,
            Err(Error::Sampling { .. })
        ));
    }

    #[tokio::test]
    async fn test_leftover_temp_files_removed() {
        let f = setup().await;
        let group = f.store.create_group(&sample_group("office")).await.unwrap();
        let client_id = add_client(&f.store, &group, "laptop").await;
        let iface = group.interface_name();

        let peers = f.supervisor.interface_dir(&iface).join("peers");
        std::fs::create_dir_all(&peers).unwrap();
        let leftover = peers.join("client-99.conf.tmp");
        std::fs::write(&leftover, "PrivateKey = secret\n").unwrap();
        let unrelated = peers.join("notes.txt");
        std::fs::write(&unrelated, "keep").unwrap();

        f.supervisor.ensure_up(group.id).await.unwrap();

        assert!(!leftover.exists());
        assert!(unrelated.exists());
        assert!(f.supervisor.client_config_path(&iface, client_id).exists());
    }

    #[tokio::test]
    async fn test_rename_while_running_moves_interface() {
        let f = setup().await;
        let group = f.store.create_group(&sample_group("office")).await.unwrap();
        f.supervisor.ensure_up(group.id).await.unwrap();
        let old = group.interface_name();

        let mut renamed = f.store.get_group(group.id).await.unwrap().unwrap();
        renamed.name = "branch".to_string();
        f.store.update_group(&renamed).await.unwrap();
        f.supervisor.apply_changes(group.id).await.unwrap();

        let new = renamed.interface_name();
        assert!(!f.wg.is_interface_up(&old));
        assert!(f.wg.is_interface_up(&new));
        assert!(!f.supervisor.interface_dir(&old).exists());
        assert_eq!(f.supervisor.state(group.id).await.unwrap().interface, new);
    }

    #[tokio::test]
    async fn test_decommission_removes_directory() {
        let f = setup().await;
        let group = f.store.create_group(&sample_group("office")).await.unwrap();
        f.supervisor.ensure_up(group.id).await.unwrap();
        let iface = group.interface_name();

        f.supervisor.decommission(group.id).await.unwrap();

        assert!(!f.wg.is_interface_up(&iface));
        assert!(!f.supervisor.interface_dir(&iface).exists());
        assert!(f.supervisor.state(group.id).await.is_none());
    }
}
