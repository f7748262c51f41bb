use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow};

use crate::error::Result;
use crate::model::{Client, Group, SampleOwner, TrafficSample};

/// Addresses already taken inside a group: the server address plus every
/// client address, active or not.
#[derive(Debug, Default, Clone)]
pub struct Reserved {
    pub ipv4: HashSet<Ipv4Addr>,
    pub ipv6: HashSet<Ipv6Addr>,
}

/// Counter bookkeeping for one client produced by a sampling tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterUpdate {
    pub client_id: i64,
    pub last_rx: u64,
    pub last_tx: u64,
    pub total_received: u64,
    pub total_sent: u64,
    pub last_handshake: Option<DateTime<Utc>>,
}

/// SQLite-backed store for groups, clients and traffic samples
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        let db_path = data_dir.join("wgmesh.db");
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Private in-memory database for tests. A single connection that is
    /// never recycled, since every new connection would see an empty database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS groups (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL DEFAULT '',
                ipv4_cidr TEXT NOT NULL,
                ipv4_address TEXT NOT NULL,
                ipv6_cidr TEXT,
                ipv6_address TEXT,
                private_key TEXT NOT NULL,
                public_key TEXT NOT NULL,
                listen_port INTEGER NOT NULL,
                dns TEXT NOT NULL DEFAULT '[]',
                endpoint TEXT NOT NULL DEFAULT '',
                persistent_keepalive INTEGER NOT NULL DEFAULT 0,
                mtu INTEGER NOT NULL DEFAULT 0,
                allow_client_to_client INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                is_running INTEGER NOT NULL DEFAULT 0,
                owner_id INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS clients (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                group_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                private_key TEXT NOT NULL,
                public_key TEXT NOT NULL,
                preshared_key TEXT,
                ipv4_address TEXT NOT NULL,
                ipv6_address TEXT,
                allowed_ips TEXT NOT NULL,
                can_address_peers INTEGER NOT NULL DEFAULT 1,
                routed_prefixes TEXT NOT NULL DEFAULT '[]',
                dns_override TEXT,
                expires_at TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                last_handshake TEXT,
                total_received INTEGER NOT NULL DEFAULT 0,
                total_sent INTEGER NOT NULL DEFAULT 0,
                last_rx INTEGER NOT NULL DEFAULT 0,
                last_tx INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (group_id, ipv4_address),
                UNIQUE (group_id, ipv6_address),
                FOREIGN KEY (group_id) REFERENCES groups(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // A sample belongs to a group or a client, never both
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS traffic_samples (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                group_id INTEGER,
                client_id INTEGER,
                received_bytes INTEGER NOT NULL,
                sent_bytes INTEGER NOT NULL,
                recorded_at TEXT NOT NULL,
                CHECK ((group_id IS NULL) <> (client_id IS NULL)),
                FOREIGN KEY (group_id) REFERENCES groups(id) ON DELETE CASCADE,
                FOREIGN KEY (client_id) REFERENCES clients(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_samples_group ON traffic_samples(group_id, recorded_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_samples_client ON traffic_samples(client_id, recorded_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // === Group operations ===

    /// Insert a group. The `id` of the argument is ignored.
    pub async fn create_group(&self, group: &Group) -> Result<Group> {
        let dns_json = serde_json::to_string(&group.dns).map_err(decode_err("dns"))?;

        let result = sqlx::query(
            r#"
            INSERT INTO groups (name, description, ipv4_cidr, ipv4_address, ipv6_cidr,
                                ipv6_address, private_key, public_key, listen_port, dns,
                                endpoint, persistent_keepalive, mtu, allow_client_to_client,
                                is_active, is_running, owner_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&group.name)
        .bind(&group.description)
        .bind(group.ipv4_cidr.to_string())
        .bind(group.ipv4_address.to_string())
        .bind(group.ipv6_cidr.map(|c| c.to_string()))
        .bind(group.ipv6_address.map(|a| a.to_string()))
        .bind(&group.private_key)
        .bind(&group.public_key)
        .bind(group.listen_port as i64)
        .bind(&dns_json)
        .bind(&group.endpoint)
        .bind(group.persistent_keepalive as i64)
        .bind(group.mtu as i64)
        .bind(group.allow_client_to_client)
        .bind(group.is_active)
        .bind(group.is_running)
        .bind(group.owner_id)
        .bind(timestamp(&group.created_at))
        .bind(timestamp(&group.updated_at))
        .execute(&self.pool)
        .await?;

        let mut created = group.clone();
        created.id = result.last_insert_rowid();
        Ok(created)
    }

    pub async fn get_group(&self, id: i64) -> Result<Option<Group>> {
        let row = sqlx::query("SELECT * FROM groups WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(row_to_group(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn get_group_by_name(&self, name: &str) -> Result<Option<Group>> {
        let row = sqlx::query("SELECT * FROM groups WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(row_to_group(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn list_groups(&self) -> Result<Vec<Group>> {
        let rows = sqlx::query("SELECT * FROM groups ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        let groups = rows
            .iter()
            .map(row_to_group)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(groups)
    }

    /// Groups whose interface is supposed to be up.
    pub async fn list_running_groups(&self) -> Result<Vec<Group>> {
        let rows = sqlx::query("SELECT * FROM groups WHERE is_running = 1 ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        let groups = rows
            .iter()
            .map(row_to_group)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(groups)
    }

    /// Persist every mutable field of a group. Address ranges and keys
    /// are written too so IPv6 can be set or cleared.
    pub async fn update_group(&self, group: &Group) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        write_group(&mut *conn, group).await
    }

    /// Persist a group whose IPv6 range changed together with its clients'
    /// new IPv6 addresses (or none). Either both land or neither does.
    pub async fn update_group_with_ipv6(
        &self,
        group: &Group,
        assignments: &[(i64, Option<Ipv6Addr>)],
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let updated = write_group(&mut *tx, group).await?;
        write_client_ipv6(&mut *tx, group.id, assignments).await?;
        tx.commit().await?;
        Ok(updated)
    }

    pub async fn set_group_running(&self, id: i64, running: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE groups SET is_running = ?, updated_at = ? WHERE id = ?")
            .bind(running)
            .bind(timestamp(&Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_group(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM groups WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // === Client operations ===

    /// Insert a client whose addresses are chosen by `allocate` from the
    /// group's reserved set. Reading the set and inserting happen in one
    /// transaction; the UNIQUE constraints reject any address that slipped in.
    pub async fn create_client_with<F>(&self, client: &Client, allocate: F) -> Result<Client>
    where
        F: FnOnce(&Reserved) -> Result<(Ipv4Addr, Option<Ipv6Addr>)>,
    {
        let mut tx = self.pool.begin().await?;

        let group_row = sqlx::query("SELECT ipv4_address, ipv6_address FROM groups WHERE id = ?")
            .bind(client.group_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(group_row) = group_row else {
            return Err(crate::error::Error::NotFound(format!(
                "group {}",
                client.group_id
            )));
        };

        let mut reserved = Reserved::default();
        reserved.ipv4.insert(parse_col(&group_row, "ipv4_address")?);
        if let Some(addr) = parse_opt_col(&group_row, "ipv6_address")? {
            reserved.ipv6.insert(addr);
        }

        let rows = sqlx::query("SELECT ipv4_address, ipv6_address FROM clients WHERE group_id = ?")
            .bind(client.group_id)
            .fetch_all(&mut *tx)
            .await?;
        for row in &rows {
            reserved.ipv4.insert(parse_col(row, "ipv4_address")?);
            if let Some(addr) = parse_opt_col(row, "ipv6_address")? {
                reserved.ipv6.insert(addr);
            }
        }

        let (ipv4, ipv6) = allocate(&reserved)?;
        let mut created = client.clone();
        created.ipv4_address = ipv4;
        created.ipv6_address = ipv6;

        let routed_json = serde_json::to_string(&created.routed_prefixes)
            .map_err(decode_err("routed_prefixes"))?;
        let dns_json = created
            .dns_override
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(decode_err("dns_override"))?;

        let result = sqlx::query(
            r#"
            INSERT INTO clients (group_id, name, description, private_key, public_key,
                                 preshared_key, ipv4_address, ipv6_address, allowed_ips,
                                 can_address_peers, routed_prefixes, dns_override, expires_at,
                                 is_active, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(created.group_id)
        .bind(&created.name)
        .bind(&created.description)
        .bind(&created.private_key)
        .bind(&created.public_key)
        .bind(&created.preshared_key)
        .bind(ipv4.to_string())
        .bind(ipv6.map(|a| a.to_string()))
        .bind(&created.allowed_ips)
        .bind(created.can_address_peers)
        .bind(&routed_json)
        .bind(&dns_json)
        .bind(created.expires_at.as_ref().map(timestamp))
        .bind(created.is_active)
        .bind(timestamp(&created.created_at))
        .bind(timestamp(&created.updated_at))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        created.id = result.last_insert_rowid();
        Ok(created)
    }

    pub async fn get_client(&self, id: i64) -> Result<Option<Client>> {
        let row = sqlx::query("SELECT * FROM clients WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(row_to_client(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn list_clients(&self, group_id: i64) -> Result<Vec<Client>> {
        let rows = sqlx::query("SELECT * FROM clients WHERE group_id = ? ORDER BY id")
            .bind(group_id)
            .fetch_all(&self.pool)
            .await?;

        let clients = rows
            .iter()
            .map(row_to_client)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(clients)
    }

    /// Persist the user-editable fields of a client.
    pub async fn update_client(&self, client: &Client) -> Result<bool> {
        let routed_json = serde_json::to_string(&client.routed_prefixes)
            .map_err(decode_err("routed_prefixes"))?;
        let dns_json = client
            .dns_override
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(decode_err("dns_override"))?;

        let result = sqlx::query(
            r#"
            UPDATE clients SET name = ?, description = ?, allowed_ips = ?, can_address_peers = ?,
                               routed_prefixes = ?, dns_override = ?, expires_at = ?,
                               is_active = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&client.name)
        .bind(&client.description)
        .bind(&client.allowed_ips)
        .bind(client.can_address_peers)
        .bind(&routed_json)
        .bind(&dns_json)
        .bind(client.expires_at.as_ref().map(timestamp))
        .bind(client.is_active)
        .bind(timestamp(&client.updated_at))
        .bind(client.id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Replace a client's key material.
    pub async fn update_client_keys(
        &self,
        id: i64,
        private_key: &str,
        public_key: &str,
        preshared_key: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE clients SET private_key = ?, public_key = ?, preshared_key = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(private_key)
        .bind(public_key)
        .bind(preshared_key)
        .bind(timestamp(&Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_client(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM clients WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // === Traffic samples ===

    /// Apply one sampling tick for a group atomically: advance each client's
    /// counters, append one sample per updated client and one group aggregate
    /// summed over all of the group's clients.
    pub async fn record_tick(
        &self,
        group_id: i64,
        updates: &[CounterUpdate],
        recorded_at: DateTime<Utc>,
    ) -> Result<()> {
        let at = timestamp(&recorded_at);
        let mut tx = self.pool.begin().await?;

        for update in updates {
            sqlx::query(
                r#"
                UPDATE clients SET last_rx = ?, last_tx = ?, total_received = ?, total_sent = ?,
                                   last_handshake = COALESCE(?, last_handshake)
                WHERE id = ? AND group_id = ?
                "#,
            )
            .bind(update.last_rx as i64)
            .bind(update.last_tx as i64)
            .bind(update.total_received as i64)
            .bind(update.total_sent as i64)
            .bind(update.last_handshake.as_ref().map(timestamp))
            .bind(update.client_id)
            .bind(group_id)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO traffic_samples (client_id, received_bytes, sent_bytes, recorded_at) VALUES (?, ?, ?, ?)",
            )
            .bind(update.client_id)
            .bind(update.total_received as i64)
            .bind(update.total_sent as i64)
            .bind(&at)
            .execute(&mut *tx)
            .await?;
        }

        let totals = sqlx::query(
            r#"
            SELECT COALESCE(SUM(total_received), 0) AS rx, COALESCE(SUM(total_sent), 0) AS tx
            FROM clients WHERE group_id = ?
            "#,
        )
        .bind(group_id)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO traffic_samples (group_id, received_bytes, sent_bytes, recorded_at) VALUES (?, ?, ?, ?)",
        )
        .bind(group_id)
        .bind(totals.get::<i64, _>("rx"))
        .bind(totals.get::<i64, _>("tx"))
        .bind(&at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Samples of one owner in time order, optionally from `since` on.
    pub async fn list_samples(
        &self,
        owner: SampleOwner,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<TrafficSample>> {
        let (column, id) = match owner {
            SampleOwner::Group(id) => ("group_id", id),
            SampleOwner::Client(id) => ("client_id", id),
        };
        let since = since.map(|s| timestamp(&s)).unwrap_or_default();

        let rows = sqlx::query(&format!(
            r#"
            SELECT id, received_bytes, sent_bytes, recorded_at FROM traffic_samples
            WHERE {} = ? AND recorded_at >= ?
            ORDER BY recorded_at, id
            "#,
            column
        ))
        .bind(id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut samples = Vec::with_capacity(rows.len());
        for row in &rows {
            samples.push(TrafficSample {
                id: row.try_get("id")?,
                owner,
                received_bytes: row.try_get::<i64, _>("received_bytes")? as u64,
                sent_bytes: row.try_get::<i64, _>("sent_bytes")? as u64,
                recorded_at: parse_col(row, "recorded_at")?,
            });
        }
        Ok(samples)
    }
}

/// Fixed-width RFC 3339 so that text ordering matches time ordering.
fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_err<E>(column: &'static str) -> impl FnOnce(E) -> sqlx::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    move |e| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    }
}

fn parse_col<T>(row: &SqliteRow, column: &'static str) -> std::result::Result<T, sqlx::Error>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let value: String = row.try_get(column)?;
    value.parse().map_err(decode_err(column))
}

fn parse_opt_col<T>(
    row: &SqliteRow,
    column: &'static str,
) -> std::result::Result<Option<T>, sqlx::Error>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let value: Option<String> = row.try_get(column)?;
    value
        .map(|v| v.parse().map_err(decode_err(column)))
        .transpose()
}

fn json_col<T>(row: &SqliteRow, column: &'static str) -> std::result::Result<T, sqlx::Error>
where
    T: serde::de::DeserializeOwned,
{
    let value: String = row.try_get(column)?;
    serde_json::from_str(&value).map_err(decode_err(column))
}

fn row_to_group(row: &SqliteRow) -> std::result::Result<Group, sqlx::Error> {
    Ok(Group {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        ipv4_cidr: parse_col(row, "ipv4_cidr")?,
        ipv4_address: parse_col(row, "ipv4_address")?,
        ipv6_cidr: parse_opt_col(row, "ipv6_cidr")?,
        ipv6_address: parse_opt_col(row, "ipv6_address")?,
        private_key: row.try_get("private_key")?,
        public_key: row.try_get("public_key")?,
        listen_port: row.try_get::<i64, _>("listen_port")? as u16,
        dns: json_col(row, "dns")?,
        endpoint: row.try_get("endpoint")?,
        persistent_keepalive: row.try_get::<i64, _>("persistent_keepalive")? as u16,
        mtu: row.try_get::<i64, _>("mtu")? as u16,
        allow_client_to_client: row.try_get("allow_client_to_client")?,
        is_active: row.try_get("is_active")?,
        is_running: row.try_get("is_running")?,
        owner_id: row.try_get("owner_id")?,
        created_at: parse_col(row, "created_at")?,
        updated_at: parse_col(row, "updated_at")?,
    })
}

fn row_to_client(row: &SqliteRow) -> std::result::Result<Client, sqlx::Error> {
    let dns_override: Option<String> = row.try_get("dns_override")?;
    let dns_override = dns_override
        .map(|v| serde_json::from_str(&v).map_err(decode_err("dns_override")))
        .transpose()?;

    Ok(Client {
        id: row.try_get("id")?,
        group_id: row.try_get("group_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        private_key: row.try_get("private_key")?,
        public_key: row.try_get("public_key")?,
        preshared_key: row.try_get("preshared_key")?,
        ipv4_address: parse_col(row, "ipv4_address")?,
        ipv6_address: parse_opt_col(row, "ipv6_address")?,
        allowed_ips: row.try_get("allowed_ips")?,
        can_address_peers: row.try_get("can_address_peers")?,
        routed_prefixes: json_col(row, "routed_prefixes")?,
        dns_override,
        expires_at: parse_opt_col(row, "expires_at")?,
        is_active: row.try_get("is_active")?,
        last_handshake: parse_opt_col(row, "last_handshake")?,
        total_received: row.try_get::<i64, _>("total_received")? as u64,
        total_sent: row.try_get::<i64, _>("total_sent")? as u64,
        last_rx: row.try_get::<i64, _>("last_rx")? as u64,
        last_tx: row.try_get::<i64, _>("last_tx")? as u64,
        created_at: parse_col(row, "created_at")?,
        updated_at: parse_col(row, "updated_at")?,
    })
}

async fn write_group(conn: &mut SqliteConnection, group: &Group) -> Result<bool> {
    let dns_json = serde_json::to_string(&group.dns).map_err(decode_err("dns"))?;

    let result = sqlx::query(
        r#"
        UPDATE groups SET name = ?, description = ?, ipv6_cidr = ?, ipv6_address = ?,
                          listen_port = ?, dns = ?, endpoint = ?, persistent_keepalive = ?,
                          mtu = ?, allow_client_to_client = ?, is_active = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&group.name)
    .bind(&group.description)
    .bind(group.ipv6_cidr.map(|c| c.to_string()))
    .bind(group.ipv6_address.map(|a| a.to_string()))
    .bind(group.listen_port as i64)
    .bind(&dns_json)
    .bind(&group.endpoint)
    .bind(group.persistent_keepalive as i64)
    .bind(group.mtu as i64)
    .bind(group.allow_client_to_client)
    .bind(group.is_active)
    .bind(timestamp(&group.updated_at))
    .bind(group.id)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// All listed clients are cleared first so addresses can move between
/// clients without tripping the UNIQUE constraint.
async fn write_client_ipv6(
    conn: &mut SqliteConnection,
    group_id: i64,
    assignments: &[(i64, Option<Ipv6Addr>)],
) -> Result<()> {
    let now = timestamp(&Utc::now());
    for (client_id, _) in assignments {
        sqlx::query("UPDATE clients SET ipv6_address = NULL WHERE id = ? AND group_id = ?")
            .bind(client_id)
            .bind(group_id)
            .execute(&mut *conn)
            .await?;
    }

    for (client_id, address) in assignments {
        sqlx::query(
            "UPDATE clients SET ipv6_address = ?, updated_at = ? WHERE id = ? AND group_id = ?",
        )
        .bind(address.map(|a| a.to_string()))
        .bind(&now)
        .bind(client_id)
        .bind(group_id)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}
