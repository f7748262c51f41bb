//! Interface lifecycle, allocation and sampling against the fake tool.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use wgmesh_net::Error;
use wgmesh_net::audit::NetAuditLogger;
use wgmesh_net::config::Defaults;
use wgmesh_net::downsample::{TrafficPoint, downsample};
use wgmesh_net::ifname;
use wgmesh_net::model::{Group, GroupUpdate, NewClient, NewGroup, SampleOwner};
use wgmesh_net::sampler::StatsSampler;
use wgmesh_net::service::NetService;
use wgmesh_net::store::Store;
use wgmesh_net::supervisor::InterfaceSupervisor;
use wgmesh_net::test_util::{FakeWg, WgCall};
use wgmesh_net::wg::{PeerStats, ToolError};

struct Env {
    store: Arc<Store>,
    wg: Arc<FakeWg>,
    supervisor: Arc<InterfaceSupervisor>,
    service: Arc<NetService>,
    root: Arc<TempDir>,
}

impl Env {
    async fn new() -> Self {
        Self::with_timeout(Duration::from_secs(5)).await
    }

    async fn with_timeout(timeout: Duration) -> Self {
        let store = Arc::new(Store::in_memory().await.unwrap());
        let root = Arc::new(TempDir::new().unwrap());
        Self::build(store, Arc::new(FakeWg::new()), root, timeout)
    }

    /// A fresh process over existing state: new supervisor, same store and
    /// config root. `wg` decides whether the host kept its interfaces.
    fn restarted(&self, wg: Arc<FakeWg>) -> Self {
        Self::build(
            Arc::clone(&self.store),
            wg,
            Arc::clone(&self.root),
            Duration::from_secs(5),
        )
    }

    fn build(store: Arc<Store>, wg: Arc<FakeWg>, root: Arc<TempDir>, timeout: Duration) -> Self {
        let audit = Arc::new(NetAuditLogger::new_noop());
        let supervisor = Arc::new(InterfaceSupervisor::new(
            Arc::clone(&store),
            wg.clone(),
            root.path().to_path_buf(),
            timeout,
            Arc::clone(&audit),
        ));
        let service = Arc::new(NetService::new(
            Arc::clone(&store),
            Arc::clone(&supervisor),
            wg.clone(),
            Defaults::default(),
            audit,
        ));
        Self {
            store,
            wg,
            supervisor,
            service,
            root,
        }
    }

    async fn group(&self, name: &str, port: u16) -> Group {
        self.service
            .create_group(NewGroup {
                name: name.to_string(),
                ipv4_cidr: "10.8.0.0/24".to_string(),
                listen_port: Some(port),
                ..Default::default()
            })
            .await
            .unwrap()
    }

    async fn persisted_running(&self, group_id: i64) -> bool {
        self.store
            .get_group(group_id)
            .await
            .unwrap()
            .unwrap()
            .is_running
    }
}

fn peer(public_key: &str, rx: u64, tx: u64) -> PeerStats {
    PeerStats {
        public_key: public_key.to_string(),
        endpoint: Some("203.0.113.7:41234".to_string()),
        latest_handshake: None,
        rx_bytes: rx,
        tx_bytes: tx,
    }
}

#[tokio::test]
async fn test_ensure_up_is_idempotent() {
    let env = Env::new().await;
    let group = env.group("office", 51820).await;
    let iface = group.interface_name();

    env.supervisor.ensure_up(group.id).await.unwrap();
    env.supervisor.ensure_up(group.id).await.unwrap();

    assert_eq!(env.wg.up_calls(&iface), 1);
    assert!(env.persisted_running(group.id).await);
    let state = env.supervisor.state(group.id).await.unwrap();
    assert!(state.running);
    assert_eq!(state.interface, iface);
}

#[tokio::test]
async fn test_tear_down_then_up_again() {
    let env = Env::new().await;
    let group = env.group("office", 51820).await;
    let iface = group.interface_name();

    env.supervisor.ensure_up(group.id).await.unwrap();
    env.supervisor.tear_down(group.id).await.unwrap();
    assert!(!env.wg.is_interface_up(&iface));
    assert!(!env.persisted_running(group.id).await);

    // Tearing down twice is fine too
    env.supervisor.tear_down(group.id).await.unwrap();
    assert_eq!(env.wg.down_calls(&iface), 1);

    env.supervisor.ensure_up(group.id).await.unwrap();
    assert_eq!(env.wg.up_calls(&iface), 2);
    assert!(env.supervisor.server_config_path(&iface).exists());
}

#[tokio::test]
async fn test_reconcile_adopts_surviving_interfaces() {
    let env = Env::new().await;
    let kept = env.group("kept", 51820).await;
    let retired = env.group("retired", 51821).await;
    env.supervisor.ensure_up(kept.id).await.unwrap();
    env.supervisor.ensure_up(retired.id).await.unwrap();

    // Deactivated while the process was gone
    let mut changed = env.store.get_group(retired.id).await.unwrap().unwrap();
    changed.is_active = false;
    env.store.update_group(&changed).await.unwrap();

    // Same host, interfaces still exist
    let next = env.restarted(Arc::clone(&env.wg));
    let report = next.supervisor.reconcile_on_startup().await.unwrap();

    assert_eq!(report.restored, vec![kept.id]);
    assert_eq!(report.stopped, vec![retired.id]);
    assert!(report.failed.is_empty());
    assert_eq!(env.wg.up_calls(&kept.interface_name()), 1);
    assert!(!env.wg.is_interface_up(&retired.interface_name()));
    assert_eq!(next.supervisor.running_groups().await, vec![kept.id]);
}

#[tokio::test]
async fn test_reconcile_after_reboot_brings_interfaces_up() {
    let env = Env::new().await;
    let group = env.group("office", 51820).await;
    env.supervisor.ensure_up(group.id).await.unwrap();

    // Host rebooted: no interfaces
    let next = env.restarted(Arc::new(FakeWg::new()));
    let report = next.supervisor.reconcile_on_startup().await.unwrap();

    assert_eq!(report.restored, vec![group.id]);
    assert_eq!(next.wg.up_calls(&group.interface_name()), 1);
    assert!(next.wg.is_interface_up(&group.interface_name()));
}

#[tokio::test]
async fn test_reconcile_collects_failures() {
    let env = Env::new().await;
    let good = env.group("good", 51820).await;
    let bad = env.group("bad", 51821).await;
    env.supervisor.ensure_up(good.id).await.unwrap();
    env.supervisor.ensure_up(bad.id).await.unwrap();

    let wg = Arc::new(FakeWg::new());
    wg.fail_next_up(&bad.interface_name(), "RTNETLINK answers: Address in use");
    let next = env.restarted(wg);
    let report = next.supervisor.reconcile_on_startup().await.unwrap();

    assert_eq!(report.restored, vec![good.id]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, bad.id);
    assert!(report.failed[0].1.contains("Address in use"));
}

#[tokio::test]
async fn test_failed_up_leaves_state_unchanged() {
    let env = Env::new().await;
    let group = env.group("office", 51820).await;
    let iface = group.interface_name();
    env.wg.fail_next_up(&iface, "Unable to modify interface: Protocol not supported");

    let err = env.supervisor.ensure_up(group.id).await.unwrap_err();

    assert!(matches!(err, Error::Interface { .. }));
    assert_eq!(
        err.diagnostic(),
        Some("Unable to modify interface: Protocol not supported")
    );
    assert!(!env.persisted_running(group.id).await);
    assert!(env.supervisor.running_groups().await.is_empty());

    // Safe to retry
    env.supervisor.ensure_up(group.id).await.unwrap();
    assert!(env.wg.is_interface_up(&iface));
}

#[tokio::test]
async fn test_partial_up_is_torn_down() {
    let env = Env::new().await;
    let group = env.group("office", 51820).await;
    let iface = group.interface_name();
    env.wg.fail_next_up_partially(&iface, "Invalid peer configuration");

    let err = env.supervisor.ensure_up(group.id).await.unwrap_err();

    assert_eq!(err.diagnostic(), Some("Invalid peer configuration"));
    assert!(!env.wg.is_interface_up(&iface));
    assert_eq!(env.wg.down_calls(&iface), 1);
    assert!(!env.persisted_running(group.id).await);
}

#[tokio::test]
async fn test_hanging_up_times_out() {
    let env = Env::with_timeout(Duration::from_millis(100)).await;
    let group = env.group("office", 51820).await;
    env.wg.hang_next_up(&group.interface_name());

    let err = env.supervisor.ensure_up(group.id).await.unwrap_err();

    match err {
        Error::Interface { source, .. } => {
            assert!(matches!(source, ToolError::Timeout { .. }), "{:?}", source);
        }
        other => panic!("expected interface error, got {:?}", other),
    }
    assert!(!env.persisted_running(group.id).await);
}

#[tokio::test]
async fn test_concurrent_allocation_is_unique() {
    let env = Env::new().await;
    let group = env.group("office", 51820).await;

    let mut handles = Vec::new();
    for i in 0..20 {
        let service = Arc::clone(&env.service);
        handles.push(tokio::spawn(async move {
            service
                .add_client(group.id, NewClient::new(format!("client-{}", i)))
                .await
        }));
    }

    let mut addresses = HashSet::new();
    for handle in handles {
        let client = handle.await.unwrap().unwrap();
        assert!(addresses.insert(client.ipv4_address));
    }
    assert_eq!(addresses.len(), 20);
    assert!(!addresses.contains(&group.ipv4_address));
}

#[tokio::test]
async fn test_concurrent_toggles_serialize() {
    let env = Env::new().await;
    let group = env.group("office", 51820).await;

    // The fake rejects up-while-up and down-while-down, so any interleaving
    // of two toggles on the same interface shows up as an error.
    let mut handles = Vec::new();
    for i in 0..16 {
        let supervisor = Arc::clone(&env.supervisor);
        handles.push(tokio::spawn(async move {
            if i % 2 == 0 {
                supervisor.ensure_up(group.id).await
            } else {
                supervisor.tear_down(group.id).await
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let running = env.supervisor.running_groups().await.contains(&group.id);
    assert_eq!(running, env.wg.is_interface_up(&group.interface_name()));
    assert_eq!(running, env.persisted_running(group.id).await);
}

#[tokio::test]
async fn test_sampler_handles_counter_reset() {
    let env = Env::new().await;
    let group = env.group("office", 51820).await;
    let client = env
        .service
        .add_client(group.id, NewClient::new("laptop"))
        .await
        .unwrap();
    env.service.start_group(group.id).await.unwrap();
    let iface = group.interface_name();
    let sampler = StatsSampler::new(
        Arc::clone(&env.store),
        Arc::clone(&env.supervisor),
        Duration::from_secs(60),
        4,
    );

    env.wg.set_peers(&iface, vec![peer(&client.public_key, 100, 50)]);
    let first = sampler.sample_once().await;
    assert_eq!(first.sampled, vec![(group.id, 1)]);

    // Interface recreated: rx restarted from zero
    env.wg.set_peers(&iface, vec![peer(&client.public_key, 80, 60)]);
    sampler.sample_once().await;

    let stored = env.service.get_client(client.id).await.unwrap();
    assert_eq!((stored.total_received, stored.total_sent), (180, 60));

    let series = env
        .service
        .traffic(SampleOwner::Client(client.id), None, 0)
        .await
        .unwrap();
    let received: Vec<u64> = series.iter().map(|p| p.received_bytes).collect();
    assert_eq!(received, vec![100, 180]);

    let group_series = env
        .service
        .traffic(SampleOwner::Group(group.id), None, 0)
        .await
        .unwrap();
    assert_eq!(group_series.len(), 2);
    assert_eq!(group_series[1].sent_bytes, 60);

    let state = env.supervisor.state(group.id).await.unwrap();
    assert_eq!(state.counters[&client.public_key].rx_bytes, 80);
}

#[tokio::test]
async fn test_sampler_isolates_failing_group() {
    let env = Env::new().await;
    let healthy = env.group("healthy", 51820).await;
    let broken = env
        .service
        .create_group(NewGroup {
            name: "broken".to_string(),
            ipv4_cidr: "10.9.0.0/24".to_string(),
            listen_port: Some(51821),
            ..Default::default()
        })
        .await
        .unwrap();
    let client = env
        .service
        .add_client(healthy.id, NewClient::new("laptop"))
        .await
        .unwrap();
    env.service.start_group(healthy.id).await.unwrap();
    env.service.start_group(broken.id).await.unwrap();

    env.wg
        .set_peers(&healthy.interface_name(), vec![peer(&client.public_key, 10, 20)]);
    env.wg
        .fail_show(&broken.interface_name(), "Unable to access interface");

    let sampler = StatsSampler::new(
        Arc::clone(&env.store),
        Arc::clone(&env.supervisor),
        Duration::from_secs(60),
        2,
    );
    let report = sampler.sample_once().await;

    assert_eq!(report.sampled, vec![(healthy.id, 1)]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, broken.id);

    let broken_series = env
        .service
        .traffic(SampleOwner::Group(broken.id), None, 0)
        .await
        .unwrap();
    assert!(broken_series.is_empty());
    assert_eq!(
        env.store
            .list_samples(SampleOwner::Client(client.id), None)
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn test_sampler_loop_stops() {
    let env = Env::new().await;
    let group = env.group("office", 51820).await;
    env.service.start_group(group.id).await.unwrap();

    let sampler = Arc::new(StatsSampler::new(
        Arc::clone(&env.store),
        Arc::clone(&env.supervisor),
        Duration::from_millis(20),
        4,
    ));
    let handle = sampler.spawn();
    tokio::time::sleep(Duration::from_millis(150)).await;
    handle.stop().await;

    let samples = env
        .store
        .list_samples(SampleOwner::Group(group.id), None)
        .await
        .unwrap();
    assert!(!samples.is_empty());

    // Nothing more once stopped
    let count = samples.len();
    tokio::time::sleep(Duration::from_millis(60)).await;
    let later = env
        .store
        .list_samples(SampleOwner::Group(group.id), None)
        .await
        .unwrap();
    assert_eq!(later.len(), count);
}

#[tokio::test]
async fn test_hostile_names_never_reach_the_tool() {
    let env = Env::new().await;
    let hostile = [
        "office; rm -rf /",
        "$(reboot)",
        "../../etc/passwd",
        "A|B && Evil",
        ";;;",
    ];

    let mut port = 51820;
    for name in hostile {
        let group = env.group(name, port).await;
        port += 1;
        env.supervisor.ensure_up(group.id).await.unwrap();
    }

    for call in env.wg.calls() {
        let iface = match call {
            WgCall::Up(iface, _) | WgCall::Down(iface) | WgCall::IsUp(iface) | WgCall::Show(iface) => {
                iface
            }
            WgCall::GenKey | WgCall::GenPsk => continue,
        };
        assert!(ifname::validate(&iface).is_ok(), "{:?} reached the tool", iface);
        assert!(
            !iface.contains(|c: char| matches!(c, ';' | '|' | '/' | ' ' | '$') || c.is_uppercase())
        );
    }

    for bad in ["wg1;ls", "wg 1", "wg1/x", "WG1", "wg1|x", ""] {
        assert!(matches!(ifname::validate(bad), Err(Error::InvalidIdentifier(_))));
    }
}

#[tokio::test]
async fn test_rename_while_running_moves_interface() {
    let env = Env::new().await;
    let group = env.group("office", 51820).await;
    env.service.start_group(group.id).await.unwrap();
    let old = group.interface_name();

    let renamed = env
        .service
        .update_group(
            group.id,
            GroupUpdate {
                name: Some("hq".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let new = renamed.interface_name();

    assert_ne!(old, new);
    assert!(!env.wg.is_interface_up(&old));
    assert!(env.wg.is_interface_up(&new));
    assert!(!env.supervisor.interface_dir(&old).exists());
    assert!(env.supervisor.server_config_path(&new).exists());
}

#[tokio::test]
async fn test_sampler_follows_groups_toggled_by_another_process() {
    let serve = Env::new().await;
    serve.supervisor.reconcile_on_startup().await.unwrap();
    let sampler = StatsSampler::new(
        Arc::clone(&serve.store),
        Arc::clone(&serve.supervisor),
        Duration::from_secs(60),
        4,
    );

    // A one-shot CLI invocation on the same host and database
    let cli = serve.restarted(Arc::clone(&serve.wg));
    let group = cli.group("office", 51820).await;
    let client = cli
        .service
        .add_client(group.id, NewClient::new("laptop"))
        .await
        .unwrap();
    cli.service.start_group(group.id).await.unwrap();
    serve
        .wg
        .set_peers(&group.interface_name(), vec![peer(&client.public_key, 100, 50)]);

    let report = sampler.sample_once().await;
    assert_eq!(report.sampled, vec![(group.id, 1)]);
    assert!(report.failed.is_empty());
    assert!(serve.supervisor.state(group.id).await.unwrap().running);
    assert_eq!(
        serve.service.get_client(client.id).await.unwrap().total_received,
        100
    );

    cli.service.stop_group(group.id).await.unwrap();
    let report = sampler.sample_once().await;
    assert!(report.sampled.is_empty());
    assert!(report.failed.is_empty());
}

#[tokio::test]
async fn test_client_config_endpoint_forms() {
    let env = Env::new().await;
    let group = env.group("office", 51820).await;
    let client = env
        .service
        .add_client(group.id, NewClient::new("laptop"))
        .await
        .unwrap();

    let cases = [
        ("vpn.example.com", "vpn.example.com:51820"),
        ("vpn.example.com:443", "vpn.example.com:443"),
        ("2001:db8::10", "[2001:db8::10]:51820"),
        ("[2001:db8::10]:443", "[2001:db8::10]:443"),
    ];
    for (configured, rendered) in cases {
        env.service
            .update_group(
                group.id,
                GroupUpdate {
                    endpoint: Some(configured.to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let (_, text) = env.service.client_config(client.id).await.unwrap();
        let line = text
            .lines()
            .find(|l| l.starts_with("Endpoint = "))
            .unwrap();
        assert_eq!(line, format!("Endpoint = {}", rendered));
    }

    let rejected = env
        .service
        .update_group(
            group.id,
            GroupUpdate {
                endpoint: Some("vpn.example.com:443:51820".to_string()),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(rejected, Err(Error::Validation(_))));
}

#[test]
fn test_downsample_properties() {
    let series: Vec<TrafficPoint> = (0..1000u64)
        .map(|i| TrafficPoint {
            timestamp: None,
            received_bytes: i * 10,
            sent_bytes: 7,
        })
        .collect();

    for max_points in [1, 3, 7, 100, 999, 1000, 5000] {
        let reduced = downsample(&series, max_points);
        assert!(reduced.len() <= max_points);
        assert!(!reduced.is_empty());
        // Means of a constant stay constant, means of a monotone series stay monotone
        assert!(reduced.iter().all(|p| p.sent_bytes == 7));
        assert!(
            reduced
                .windows(2)
                .all(|w| w[0].received_bytes <= w[1].received_bytes)
        );
    }

    assert_eq!(downsample(&series, 0), series);
    assert!(downsample(&[], 10).is_empty());
}
