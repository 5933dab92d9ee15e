//! Host pool reconciliation: hosts, locations and current metrics.
//!
//! Every write here is a single store-level statement (`ON CONFLICT`), so
//! concurrent callers touching the same address cannot create duplicates.

pub mod location;

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use tracing::warn;

use self::location::AddressPattern;
use crate::source::{HostMetrics, Utilization};
use crate::storage::{now_rfc3339, Pool};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostRecord {
    pub id: i64,
    pub address: String,
    pub display_name: String,
    pub location_id: Option<i64>,
    pub remark: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl HostRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            address: row.get(1)?,
            display_name: row.get(2)?,
            location_id: row.get(3)?,
            remark: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }
}

/// Result of [`Inventory::ensure_host`].
#[derive(Debug, Clone)]
pub struct EnsuredHost {
    pub host: HostRecord,
    /// True when this call inserted the row.
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationRecord {
    pub id: i64,
    pub name: String,
    pub pattern: String,
    pub priority: i64,
}

/// The "current" metrics row of a host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub host_id: i64,
    pub address: String,
    pub cpu: Utilization,
    pub memory: Utilization,
    pub disk: Utilization,
    pub captured_at: String,
}

const HOST_COLUMNS: &str =
    "id, address, display_name, location_id, remark, created_at, updated_at";

/// SQLite-backed host pool.
#[derive(Clone)]
pub struct Inventory {
    pool: Pool,
}

impl Inventory {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Return the host for `address`, inserting it if absent.
    ///
    /// New hosts take `display_name_hint` as their name, or the address when
    /// the hint is empty. Existing hosts get a non-empty hint and `remark`
    /// refreshed; the address is never changed.
    pub fn ensure_host(
        &self,
        address: &str,
        display_name_hint: Option<&str>,
        remark: Option<&str>,
    ) -> Result<EnsuredHost> {
        let address = address.trim();
        if address.is_empty() {
            anyhow::bail!("host address must not be empty");
        }
        let hint = display_name_hint.map(str::trim).filter(|h| !h.is_empty());
        let now = now_rfc3339();
        let conn = self.pool.get()?;

        let inserted = conn
            .execute(
                "INSERT INTO hosts (address, display_name, remark, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(address) DO NOTHING",
                params![address, hint.unwrap_or(address), remark, now],
            )
            .with_context(|| format!("failed to insert host {}", address))?;

        let created = inserted == 1;
        if !created && (hint.is_some() || remark.is_some()) {
            conn.execute(
                "UPDATE hosts SET
                    display_name = COALESCE(?2, display_name),
                    remark = COALESCE(?3, remark),
                    updated_at = ?4
                 WHERE address = ?1",
                params![address, hint, remark, now],
            )
            .with_context(|| format!("failed to refresh host {}", address))?;
        }

        let host = conn
            .query_row(
                &format!("SELECT {} FROM hosts WHERE address = ?1", HOST_COLUMNS),
                params![address],
                HostRecord::from_row,
            )
            .with_context(|| format!("failed to load host {}", address))?;

        Ok(EnsuredHost { host, created })
    }

    pub fn get_host(&self, address: &str) -> Result<Option<HostRecord>> {
        let conn = self.pool.get()?;
        let host = conn
            .query_row(
                &format!("SELECT {} FROM hosts WHERE address = ?1", HOST_COLUMNS),
                params![address.trim()],
                HostRecord::from_row,
            )
            .optional()?;
        Ok(host)
    }

    /// First location (by priority, then id) whose pattern matches
    /// `address`. Rows with unparseable patterns are skipped with a warning.
    pub fn match_location(&self, address: &str) -> Result<Option<LocationRecord>> {
        for loc in self.list_locations()? {
            match loc.pattern.parse::<AddressPattern>() {
                Ok(p) if p.matches(address) => return Ok(Some(loc)),
                Ok(_) => {}
                Err(e) => {
                    warn!(location = %loc.name, pattern = %loc.pattern, error = %e, "skipping invalid location pattern");
                }
            }
        }
        Ok(None)
    }

    /// Attach a location to a host that has none yet. Returns whether the
    /// association was written.
    pub fn assign_location(&self, host_id: i64, location_id: i64) -> Result<bool> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE hosts SET location_id = ?2, updated_at = ?3
             WHERE id = ?1 AND location_id IS NULL",
            params![host_id, location_id, now_rfc3339()],
        )?;
        Ok(changed == 1)
    }

    /// Overwrite the current snapshot for a host (last write wins).
    pub fn upsert_metrics(&self, host_id: i64, address: &str, metrics: &HostMetrics) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO host_metrics (
                host_id, address,
                cpu_max, cpu_avg, cpu_min,
                mem_max, mem_avg, mem_min,
                disk_max, disk_avg, disk_min,
                captured_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(host_id) DO UPDATE SET
                address = excluded.address,
                cpu_max = excluded.cpu_max, cpu_avg = excluded.cpu_avg, cpu_min = excluded.cpu_min,
                mem_max = excluded.mem_max, mem_avg = excluded.mem_avg, mem_min = excluded.mem_min,
                disk_max = excluded.disk_max, disk_avg = excluded.disk_avg, disk_min = excluded.disk_min,
                captured_at = excluded.captured_at",
            params![
                host_id,
                address,
                metrics.cpu.max,
                metrics.cpu.avg,
                metrics.cpu.min,
                metrics.memory.max,
                metrics.memory.avg,
                metrics.memory.min,
                metrics.disk.max,
                metrics.disk.avg,
                metrics.disk.min,
                now_rfc3339(),
            ],
        )
        .with_context(|| format!("failed to upsert metrics for {}", address))?;
        Ok(())
    }

    pub fn current_metrics(&self, address: &str) -> Result<Option<MetricsSnapshot>> {
        let conn = self.pool.get()?;
        let snap = conn
            .query_row(
                "SELECT m.host_id, m.address,
                        m.cpu_max, m.cpu_avg, m.cpu_min,
                        m.mem_max, m.mem_avg, m.mem_min,
                        m.disk_max, m.disk_avg, m.disk_min,
                        m.captured_at
                 FROM host_metrics m JOIN hosts h ON h.id = m.host_id
                 WHERE h.address = ?1",
                params![address.trim()],
                |row| {
                    Ok(MetricsSnapshot {
                        host_id: row.get(0)?,
                        address: row.get(1)?,
                        cpu: Utilization {
                            max: row.get(2)?,
                            avg: row.get(3)?,
                            min: row.get(4)?,
                        },
                        memory: Utilization {
                            max: row.get(5)?,
                            avg: row.get(6)?,
                            min: row.get(7)?,
                        },
                        disk: Utilization {
                            max: row.get(8)?,
                            avg: row.get(9)?,
                            min: row.get(10)?,
                        },
                        captured_at: row.get(11)?,
                    })
                },
            )
            .optional()?;
        Ok(snap)
    }

    /// Create or update a location rule by name.
    pub fn add_location(&self, name: &str, pattern: &str, priority: i64) -> Result<LocationRecord> {
        let name = name.trim();
        if name.is_empty() {
            anyhow::bail!("location name must not be empty");
        }
        let parsed: AddressPattern = pattern
            .parse()
            .with_context(|| format!("invalid pattern for location {}", name))?;
        let pattern = parsed.to_string();

        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO locations (name, pattern, priority) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET pattern = excluded.pattern, priority = excluded.priority",
            params![name, pattern, priority],
        )?;
        let loc = conn.query_row(
            "SELECT id, name, pattern, priority FROM locations WHERE name = ?1",
            params![name],
            |row| {
                Ok(LocationRecord {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    pattern: row.get(2)?,
                    priority: row.get(3)?,
                })
            },
        )?;
        Ok(loc)
    }

    pub fn list_locations(&self) -> Result<Vec<LocationRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, pattern, priority FROM locations ORDER BY priority ASC, id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(LocationRecord {
                id: row.get(0)?,
                name: row.get(1)?,
                pattern: row.get(2)?,
                priority: row.get(3)?,
            })
        })?;

        let mut list = Vec::new();
        for r in rows {
            list.push(r?);
        }
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::testing::temp_pool;

    fn sample_metrics(address: &str, cpu_max: f64) -> HostMetrics {
        HostMetrics {
            address: address.to_string(),
            host_name: None,
            cpu: Utilization { max: cpu_max, avg: cpu_max / 2.0, min: 1.0 },
            memory: Utilization { max: 50.0, avg: 40.0, min: 30.0 },
            disk: Utilization { max: 70.0, avg: 70.0, min: 70.0 },
            points: 10,
        }
    }

    #[test]
    fn test_ensure_host_is_idempotent() {
        let (_dir, pool) = temp_pool();
        let inv = Inventory::new(pool);

        let first = inv.ensure_host("10.0.0.1", Some("web-01"), None).unwrap();
        let second = inv.ensure_host("10.0.0.1", None, None).unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.host.id, second.host.id);
        assert_eq!(second.host.display_name, "web-01");

        let count: i64 = inv
            .pool
            .get()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM hosts", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_ensure_host_defaults_name_to_address() {
        let (_dir, pool) = temp_pool();
        let inv = Inventory::new(pool);

        let h = inv.ensure_host(" 10.0.0.9 ", Some("  "), None).unwrap();
        assert_eq!(h.host.address, "10.0.0.9");
        assert_eq!(h.host.display_name, "10.0.0.9");
    }

    #[test]
    fn test_ensure_host_refreshes_remark_only() {
        let (_dir, pool) = temp_pool();
        let inv = Inventory::new(pool);

        let a = inv.ensure_host("10.0.0.1", Some("web-01"), None).unwrap();
        let b = inv.ensure_host("10.0.0.1", None, Some("synced from es")).unwrap();
        assert_eq!(a.host.id, b.host.id);
        assert_eq!(b.host.display_name, "web-01");
        assert_eq!(b.host.remark.as_deref(), Some("synced from es"));
    }

    #[test]
    fn test_upsert_metrics_overwrites() {
        let (_dir, pool) = temp_pool();
        let inv = Inventory::new(pool);
        let host = inv.ensure_host("10.0.0.1", None, None).unwrap().host;

        inv.upsert_metrics(host.id, &host.address, &sample_metrics("10.0.0.1", 80.0)).unwrap();
        inv.upsert_metrics(host.id, &host.address, &sample_metrics("10.0.0.1", 20.0)).unwrap();

        let snap = inv.current_metrics("10.0.0.1").unwrap().unwrap();
        assert_eq!(snap.cpu.max, 20.0);
        assert_eq!(snap.cpu.avg, 10.0);

        let rows: i64 = inv
            .pool
            .get()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM host_metrics", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_match_location_priority_order() {
        let (_dir, pool) = temp_pool();
        let inv = Inventory::new(pool);
        inv.add_location("dc-wide", "10.0.0.0/8", 10).unwrap();
        inv.add_location("rack-1", "10.1.1.*", 1).unwrap();

        let loc = inv.match_location("10.1.1.7").unwrap().unwrap();
        assert_eq!(loc.name, "rack-1");
        let loc = inv.match_location("10.9.0.1").unwrap().unwrap();
        assert_eq!(loc.name, "dc-wide");
        assert!(inv.match_location("192.168.0.1").unwrap().is_none());
    }

    #[test]
    fn test_assign_location_only_first_time() {
        let (_dir, pool) = temp_pool();
        let inv = Inventory::new(pool);
        let a = inv.add_location("a", "10.*", 0).unwrap();
        let b = inv.add_location("b", "10.0.*", 1).unwrap();
        let host = inv.ensure_host("10.0.0.1", None, None).unwrap().host;

        assert!(inv.assign_location(host.id, a.id).unwrap());
        assert!(!inv.assign_location(host.id, b.id).unwrap());
        assert_eq!(inv.get_host("10.0.0.1").unwrap().unwrap().location_id, Some(a.id));
    }

    #[test]
    fn test_add_location_rejects_bad_pattern() {
        let (_dir, pool) = temp_pool();
        let inv = Inventory::new(pool);
        assert!(inv.add_location("x", "10.0.0.0/40", 0).is_err());
    }
}
