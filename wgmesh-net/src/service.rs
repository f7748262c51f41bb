//! Group and client management on top of the store and the supervisor.
//!
//! Every change is validated, persisted, audited and then applied to the
//! group's interface if it is running. A failure to reapply is logged; the
//! saved record stands and the next restart or reapply picks it up.

use std::collections::HashSet;
use std::net::Ipv6Addr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ipnet::Ipv6Net;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::allocator;
use crate::audit::NetAuditLogger;
use crate::config::Defaults;
use crate::downsample::{self, RatePoint, TrafficPoint};
use crate::error::{Error, Result};
use crate::locks::GroupLocks;
use crate::model::{
    Client, ClientUpdate, Group, GroupUpdate, NewClient, NewGroup, SampleOwner,
};
use crate::render;
use crate::store::Store;
use crate::supervisor::{GroupStatus, InterfaceSupervisor};
use crate::validation::{self, ValidationError};
use crate::wg::WgTool;

pub struct NetService {
    store: Arc<Store>,
    supervisor: Arc<InterfaceSupervisor>,
    wg: Arc<dyn WgTool>,
    defaults: Defaults,
    /// Serializes address allocation and renumbering within a group.
    allocation: GroupLocks,
    /// Serializes the name/port uniqueness check with the write that follows.
    naming: Mutex<()>,
    audit: Arc<NetAuditLogger>,
}

impl NetService {
    pub fn new(
        store: Arc<Store>,
        supervisor: Arc<InterfaceSupervisor>,
        wg: Arc<dyn WgTool>,
        defaults: Defaults,
        audit: Arc<NetAuditLogger>,
    ) -> Self {
        Self {
            store,
            supervisor,
            wg,
            defaults,
            allocation: GroupLocks::new(),
            naming: Mutex::new(()),
            audit,
        }
    }

    pub fn supervisor(&self) -> &Arc<InterfaceSupervisor> {
        &self.supervisor
    }

    // === Group operations ===

    pub async fn create_group(&self, request: NewGroup) -> Result<Group> {
        let name = validation::name("group name", &request.name)?;
        validation::single_line("description", &request.description)?;
        let ipv4_cidr = validation::ipv4_range(&request.ipv4_cidr)?;
        let ipv6_cidr = request
            .ipv6_cidr
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(validation::ipv6_range)
            .transpose()?;
        let listen_port = validation::listen_port(
            request.listen_port.unwrap_or(self.defaults.listen_port),
        )?;
        let dns = validation::dns_servers(
            request
                .dns
                .as_deref()
                .unwrap_or(self.defaults.dns.as_slice()),
        )?;
        let endpoint = validation::endpoint(
            request
                .endpoint
                .as_deref()
                .unwrap_or(self.defaults.endpoint.as_str()),
        )?;

        let keys = self.wg.generate_keypair().await?;
        let now = Utc::now();
        let group = Group {
            id: 0,
            name,
            description: request.description.trim().to_string(),
            ipv4_cidr,
            ipv4_address: allocator::first_ipv4_host(&ipv4_cidr),
            ipv6_cidr,
            ipv6_address: ipv6_cidr.as_ref().map(allocator::first_ipv6_host),
            private_key: keys.private_key,
            public_key: keys.public_key,
            listen_port,
            dns,
            endpoint,
            persistent_keepalive: request
                .persistent_keepalive
                .unwrap_or(self.defaults.persistent_keepalive),
            mtu: request.mtu.unwrap_or(self.defaults.mtu),
            allow_client_to_client: request.allow_client_to_client,
            is_active: true,
            is_running: false,
            owner_id: request.owner_id,
            created_at: now,
            updated_at: now,
        };

        let created = {
            let _naming = self.naming.lock().await;
            self.check_unique(None, &group.name, group.listen_port)
                .await?;
            self.store.create_group(&group).await?
        };

        info!(
            group_id = created.id,
            name = %created.name,
            interface = %created.interface_name(),
            "Created group"
        );
        self.audit
            .group_created(created.id, &created.name, &created.ipv4_cidr.to_string());
        Ok(created)
    }

    pub async fn list_groups(&self) -> Result<Vec<Group>> {
        self.store.list_groups().await
    }

    pub async fn get_group(&self, id: i64) -> Result<Group> {
        self.store
            .get_group(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("group {}", id)))
    }

    /// Look a group up by numeric id or by name.
    pub async fn resolve_group(&self, ident: &str) -> Result<Group> {
        if let Ok(id) = ident.parse::<i64>() {
            return self.get_group(id).await;
        }
        self.store
            .get_group_by_name(ident)
            .await?
            .ok_or_else(|| Error::NotFound(format!("group {}", ident)))
    }

    /// Apply a partial update. Setting or changing the IPv6 range moves the
    /// server to the first host of the new range and renumbers clients that
    /// fall outside it; clearing it removes every client's IPv6 address.
    pub async fn update_group(&self, id: i64, update: GroupUpdate) -> Result<Group> {
        let group = {
            let _allocation = self.allocation.lock(id).await;
            let mut group = self.get_group(id).await?;

            if let Some(name) = &update.name {
                group.name = validation::name("group name", name)?;
            }
            if let Some(description) = &update.description {
                validation::single_line("description", description)?;
                group.description = description.trim().to_string();
            }
            if let Some(port) = update.listen_port {
                group.listen_port = validation::listen_port(port)?;
            }
            if let Some(dns) = &update.dns {
                group.dns = validation::dns_servers(dns)?;
            }
            if let Some(endpoint) = &update.endpoint {
                group.endpoint = validation::endpoint(endpoint)?;
            }
            if let Some(keepalive) = update.persistent_keepalive {
                group.persistent_keepalive = keepalive;
            }
            if let Some(mtu) = update.mtu {
                group.mtu = mtu;
            }
            if let Some(allowed) = update.allow_client_to_client {
                group.allow_client_to_client = allowed;
            }
            if let Some(active) = update.is_active {
                group.is_active = active;
            }

            let mut renumbered = Vec::new();
            if let Some(ipv6) = &update.ipv6_cidr {
                let range = ipv6
                    .as_deref()
                    .filter(|s| !s.trim().is_empty())
                    .map(validation::ipv6_range)
                    .transpose()?;
                if range != group.ipv6_cidr {
                    group.ipv6_cidr = range;
                    group.ipv6_address = range.as_ref().map(allocator::first_ipv6_host);
                }
                let clients = self.store.list_clients(id).await?;
                renumbered = renumber_ipv6(range.as_ref(), group.ipv6_address, &clients)?;
            }

            group.updated_at = Utc::now();
            {
                let _naming = self.naming.lock().await;
                self.check_unique(Some(id), &group.name, group.listen_port)
                    .await?;
                if renumbered.is_empty() {
                    self.store.update_group(&group).await?;
                } else {
                    info!(
                        group_id = id,
                        clients = renumbered.len(),
                        "Renumbering client IPv6 addresses"
                    );
                    self.store
                        .update_group_with_ipv6(&group, &renumbered)
                        .await?;
                }
            }
            group
        };

        self.audit.group_updated(group.id, &group.name);
        self.reapply(id).await;
        self.get_group(id).await
    }

    /// Stop the group's interface, remove its configuration directory and
    /// delete it together with its clients and samples.
    pub async fn delete_group(&self, id: i64) -> Result<()> {
        let group = self.get_group(id).await?;
        self.supervisor.decommission(id).await?;

        {
            let _allocation = self.allocation.lock(id).await;
            self.store.delete_group(id).await?;
        }
        self.allocation.forget(id);

        info!(group_id = id, name = %group.name, "Deleted group");
        self.audit.group_deleted(id, &group.name);
        Ok(())
    }

    pub async fn start_group(&self, id: i64) -> Result<()> {
        let group = self.get_group(id).await?;
        if !group.is_active {
            return Err(ValidationError::GroupInactive(group.name).into());
        }
        self.supervisor.ensure_up(id).await
    }

    pub async fn stop_group(&self, id: i64) -> Result<()> {
        self.supervisor.tear_down(id).await
    }

    pub async fn restart_group(&self, id: i64) -> Result<()> {
        let group = self.get_group(id).await?;
        if !group.is_active {
            return Err(ValidationError::GroupInactive(group.name).into());
        }
        self.supervisor.restart(id).await
    }

    pub async fn group_status(&self, id: i64) -> Result<GroupStatus> {
        self.supervisor.status(id).await
    }

    /// Server configuration as `(download file name, text)`.
    pub async fn server_config(&self, id: i64) -> Result<(String, String)> {
        let group = self.get_group(id).await?;
        let clients = self.store.list_clients(id).await?;
        let enabled = render::enabled_clients(&clients, Utc::now());
        Ok((
            group.config_filename(),
            render::render_server(&group, &enabled),
        ))
    }

    // === Client operations ===

    pub async fn add_client(&self, group_id: i64, request: NewClient) -> Result<Client> {
        self.get_group(group_id).await?;

        let name = validation::name("client name", &request.name)?;
        validation::single_line("description", &request.description)?;
        let allowed_ips = validation::allowed_ips(
            request
                .allowed_ips
                .as_deref()
                .unwrap_or(self.defaults.client_allowed_ips.as_str()),
        )?;
        let routed_prefixes = validation::routed_prefixes(&request.routed_prefixes)?;
        let dns_override = dns_override(request.dns_override.as_deref())?;

        let keys = self.wg.generate_keypair().await?;
        let preshared_key = if request.use_preshared_key {
            Some(self.wg.generate_preshared_key().await?)
        } else {
            None
        };

        let now = Utc::now();
        let client = Client {
            id: 0,
            group_id,
            name,
            description: request.description.trim().to_string(),
            private_key: keys.private_key,
            public_key: keys.public_key,
            preshared_key,
            ipv4_address: std::net::Ipv4Addr::UNSPECIFIED,
            ipv6_address: None,
            allowed_ips,
            can_address_peers: request.can_address_peers,
            routed_prefixes,
            dns_override,
            expires_at: request.expires_at,
            is_active: true,
            last_handshake: None,
            total_received: 0,
            total_sent: 0,
            last_rx: 0,
            last_tx: 0,
            created_at: now,
            updated_at: now,
        };

        let created = {
            let _allocation = self.allocation.lock(group_id).await;
            // Re-read under the lock; the IPv6 range may just have changed
            let group = self.get_group(group_id).await?;
            self.store
                .create_client_with(&client, |reserved| {
                    let ipv4 = allocator::allocate_ipv4(&group.ipv4_cidr, &reserved.ipv4)?;
                    let ipv6 = group
                        .ipv6_cidr
                        .as_ref()
                        .map(|cidr| allocator::allocate_ipv6(cidr, &reserved.ipv6))
                        .transpose()?;
                    Ok((ipv4, ipv6))
                })
                .await?
        };

        info!(
            group_id,
            client_id = created.id,
            name = %created.name,
            address = %created.ipv4_address,
            "Created client"
        );
        self.audit.client_created(
            group_id,
            created.id,
            &created.name,
            &created.ipv4_address.to_string(),
        );
        self.reapply(group_id).await;
        Ok(created)
    }

    pub async fn list_clients(&self, group_id: i64) -> Result<Vec<Client>> {
        self.get_group(group_id).await?;
        self.store.list_clients(group_id).await
    }

    pub async fn get_client(&self, id: i64) -> Result<Client> {
        self.store
            .get_client(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("client {}", id)))
    }

    pub async fn update_client(&self, id: i64, update: ClientUpdate) -> Result<Client> {
        let mut client = self.get_client(id).await?;

        if let Some(name) = &update.name {
            client.name = validation::name("client name", name)?;
        }
        if let Some(description) = &update.description {
            validation::single_line("description", description)?;
            client.description = description.trim().to_string();
        }
        if let Some(allowed_ips) = &update.allowed_ips {
            client.allowed_ips = validation::allowed_ips(allowed_ips)?;
        }
        if let Some(allowed) = update.can_address_peers {
            client.can_address_peers = allowed;
        }
        if let Some(prefixes) = &update.routed_prefixes {
            client.routed_prefixes = validation::routed_prefixes(prefixes)?;
        }
        if let Some(dns) = &update.dns_override {
            client.dns_override = dns_override(dns.as_deref())?;
        }
        if let Some(expires_at) = update.expires_at {
            client.expires_at = expires_at;
        }
        if let Some(active) = update.is_active {
            client.is_active = active;
        }
        client.updated_at = Utc::now();

        if !self.store.update_client(&client).await? {
            return Err(Error::NotFound(format!("client {}", id)));
        }

        self.audit
            .client_updated(client.group_id, client.id, &client.name);
        self.reapply(client.group_id).await;
        Ok(client)
    }

    pub async fn set_client_active(&self, id: i64, active: bool) -> Result<Client> {
        self.update_client(
            id,
            ClientUpdate {
                is_active: Some(active),
                ..Default::default()
            },
        )
        .await
    }

    /// Replace a client's keypair. The preshared key is replaced too when
    /// `regenerate_psk` is set, otherwise kept as is.
    pub async fn regenerate_client_keys(&self, id: i64, regenerate_psk: bool) -> Result<Client> {
        let client = self.get_client(id).await?;

        let keys = self.wg.generate_keypair().await?;
        let preshared_key = if regenerate_psk {
            Some(self.wg.generate_preshared_key().await?)
        } else {
            client.preshared_key.clone()
        };

        self.store
            .update_client_keys(
                id,
                &keys.private_key,
                &keys.public_key,
                preshared_key.as_deref(),
            )
            .await?;

        info!(client_id = id, regenerate_psk, "Regenerated client keys");
        self.audit
            .client_updated(client.group_id, client.id, &client.name);
        self.reapply(client.group_id).await;
        self.get_client(id).await
    }

    pub async fn delete_client(&self, id: i64) -> Result<()> {
        let client = self.get_client(id).await?;
        {
            let _allocation = self.allocation.lock(client.group_id).await;
            self.store.delete_client(id).await?;
        }

        info!(client_id = id, name = %client.name, "Deleted client");
        self.audit
            .client_deleted(client.group_id, client.id, &client.name);
        self.reapply(client.group_id).await;
        Ok(())
    }

    /// Client configuration as `(download file name, text)`.
    pub async fn client_config(&self, id: i64) -> Result<(String, String)> {
        let client = self.get_client(id).await?;
        let group = self.get_group(client.group_id).await?;
        Ok((
            client.config_filename(),
            render::render_client(&group, &client),
        ))
    }

    // === Traffic ===

    /// Cumulative traffic of a group or client, reduced to at most
    /// `max_points` points (0 for all).
    pub async fn traffic(
        &self,
        owner: SampleOwner,
        since: Option<DateTime<Utc>>,
        max_points: usize,
    ) -> Result<Vec<TrafficPoint>> {
        match owner {
            SampleOwner::Group(id) => {
                self.get_group(id).await?;
            }
            SampleOwner::Client(id) => {
                self.get_client(id).await?;
            }
        }

        let samples = self.store.list_samples(owner, since).await?;
        let series: Vec<TrafficPoint> = samples.iter().map(TrafficPoint::from).collect();
        Ok(downsample::downsample(&series, max_points))
    }

    /// Per-second rates over the downsampled series.
    pub async fn traffic_rates(
        &self,
        owner: SampleOwner,
        since: Option<DateTime<Utc>>,
        max_points: usize,
    ) -> Result<Vec<RatePoint>> {
        let series = self.traffic(owner, since, max_points).await?;
        Ok(downsample::rates(&series))
    }

    async fn check_unique(&self, except: Option<i64>, name: &str, listen_port: u16) -> Result<()> {
        let groups = self.store.list_groups().await?;
        for other in groups.iter().filter(|g| Some(g.id) != except) {
            if other.name == name {
                return Err(ValidationError::GroupNameExists(name.to_string()).into());
            }
            if other.listen_port == listen_port {
                return Err(
                    ValidationError::ListenPortInUse(listen_port, other.name.clone()).into(),
                );
            }
        }
        Ok(())
    }

    /// Push saved changes to the running interface.
    async fn reapply(&self, group_id: i64) {
        if let Err(e) = self.supervisor.apply_changes(group_id).await {
            warn!(
                group_id,
                error = %e,
                diagnostic = e.diagnostic().unwrap_or(""),
                "Change saved but could not be applied to the interface"
            );
        }
    }
}

/// An empty override list falls back to the group's DNS.
fn dns_override(dns: Option<&[String]>) -> Result<Option<Vec<String>>> {
    let Some(dns) = dns else {
        return Ok(None);
    };
    let servers = validation::dns_servers(dns)?;
    Ok((!servers.is_empty()).then_some(servers))
}

/// New IPv6 assignments after a group's IPv6 range changed to `range`.
///
/// Clients already inside the range keep their address; the others get the
/// lowest free host. Without a range every client loses its address. Only
/// clients whose address actually changes are returned.
pub fn renumber_ipv6(
    range: Option<&Ipv6Net>,
    server: Option<Ipv6Addr>,
    clients: &[Client],
) -> Result<Vec<(i64, Option<Ipv6Addr>)>> {
    let mut ordered: Vec<&Client> = clients.iter().collect();
    ordered.sort_by_key(|c| c.id);

    let Some(range) = range else {
        return Ok(ordered
            .iter()
            .filter(|c| c.ipv6_address.is_some())
            .map(|c| (c.id, None))
            .collect());
    };

    let mut reserved: HashSet<Ipv6Addr> = server.into_iter().collect();
    let mut moving = Vec::new();
    for client in &ordered {
        match client.ipv6_address {
            Some(addr) if range.contains(&addr) && reserved.insert(addr) => {}
            _ => moving.push(client.id),
        }
    }

    let mut assignments = Vec::with_capacity(moving.len());
    for client_id in moving {
        let addr = allocator::allocate_ipv6(range, &reserved)?;
        reserved.insert(addr);
        assignments.push((client_id, Some(addr)));
    }
    Ok(assignments)
}
