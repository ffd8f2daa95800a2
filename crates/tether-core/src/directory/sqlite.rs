//! SQLite-backed directory of installed providers.

use super::{
    CapabilityFilter, ChangeEvent, ChangeFilter, ChangeKind, ChangeReceiver, ChangeRegistry,
    ProviderInfo, ReceiverTable, ServiceDirectory, Subscription,
};
use crate::config::DirectoryConfig;
use crate::descriptor::{ComponentName, Descriptor};
use crate::{Result, TetherError};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

type ProviderRow = (String, String, String, String, bool, String);

const PROVIDER_COLUMNS: &str = "id, package, class_name, filter_json, enabled, installed_at";

/// Directory of providers and their capability filters.
///
/// Uses WAL mode so several processes can share one database file, and
/// `Arc<Mutex<Connection>>` within a process. Change events are broadcast
/// only to receivers registered on this instance.
pub struct SqliteDirectory {
    conn: Arc<Mutex<Connection>>,
    receivers: ReceiverTable,
}

impl SqliteDirectory {
    /// Open the directory at the default platform location.
    pub fn open() -> Result<Self> {
        let db_path = crate::platform::directory_db_path()?;
        Self::open_at(&db_path)
    }

    /// Open the directory at a specific path, creating parent directories.
    pub fn open_at(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| TetherError::io_with_path(e, parent))?;
            }
        }

        let conn = Connection::open(db_path)?;
        Self::configure_connection(&conn)?;
        Self::ensure_schema(&conn)?;
        debug!("Opened service directory at {}", db_path.display());
        Ok(Self::from_connection(conn))
    }

    /// Private in-memory directory.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::ensure_schema(&conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            receivers: ReceiverTable::new(),
        }
    }

    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(&format!(
            "PRAGMA journal_mode=WAL;\n\
             PRAGMA busy_timeout={};\n\
             PRAGMA synchronous=NORMAL;\n\
             PRAGMA temp_store=MEMORY;",
            DirectoryConfig::BUSY_TIMEOUT_MS,
        ))?;
        Ok(())
    }

    fn ensure_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS providers (
                id TEXT PRIMARY KEY,
                package TEXT NOT NULL,
                class_name TEXT NOT NULL,
                filter_json TEXT NOT NULL DEFAULT '{}',
                enabled INTEGER NOT NULL DEFAULT 1,
                installed_at TEXT NOT NULL,
                UNIQUE(package, class_name)
            );

            CREATE INDEX IF NOT EXISTS idx_providers_package ON providers(package);",
        )?;
        Ok(())
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| TetherError::Database {
            message: "Failed to acquire directory connection lock".to_string(),
            source: None,
        })
    }

    // ========================================
    // Provider CRUD
    // ========================================

    /// Install or replace a provider.
    ///
    /// Broadcasts `PackageAdded` for a package's first provider,
    /// `PackageReplaced` when the provider already existed and
    /// `PackageChanged` otherwise.
    pub fn install(&self, component: &ComponentName, filter: &CapabilityFilter) -> Result<ProviderInfo> {
        let filter_json = serde_json::to_string(filter)?;
        let now = Utc::now().to_rfc3339();

        let (info, kind) = {
            let conn = self.lock_conn()?;

            let existing: Option<String> = conn
                .query_row(
                    "SELECT id FROM providers WHERE package = ?1 AND class_name = ?2",
                    params![component.package, component.class],
                    |row| row.get(0),
                )
                .optional()?;
            let package_known: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM providers WHERE package = ?1)",
                params![component.package],
                |row| row.get(0),
            )?;

            let (id, kind) = match existing {
                Some(id) => {
                    conn.execute(
                        "UPDATE providers SET filter_json = ?1, enabled = 1, installed_at = ?2 WHERE id = ?3",
                        params![filter_json, now, id],
                    )?;
                    (id, ChangeKind::PackageReplaced)
                }
                None => {
                    let id = uuid::Uuid::new_v4().to_string();
                    conn.execute(
                        "INSERT INTO providers (id, package, class_name, filter_json, enabled, installed_at)
                         VALUES (?1, ?2, ?3, ?4, 1, ?5)",
                        params![id, component.package, component.class, filter_json, now],
                    )?;
                    let kind = if package_known {
                        ChangeKind::PackageChanged
                    } else {
                        ChangeKind::PackageAdded
                    };
                    (id, kind)
                }
            };

            let info = ProviderInfo {
                id,
                component: component.clone(),
                filter: filter.clone(),
                enabled: true,
                installed_at: now,
            };
            (info, kind)
        };

        info!("Installed provider {} ({})", component, kind);
        self.notify(&ChangeEvent::new(kind, component.package.clone()));
        Ok(info)
    }

    /// Remove one provider. Returns `false` if it was not installed.
    pub fn remove_provider(&self, component: &ComponentName) -> Result<bool> {
        let package_left = {
            let conn = self.lock_conn()?;
            let rows = conn.execute(
                "DELETE FROM providers WHERE package = ?1 AND class_name = ?2",
                params![component.package, component.class],
            )?;
            if rows == 0 {
                return Ok(false);
            }
            conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM providers WHERE package = ?1)",
                params![component.package],
                |row| row.get::<_, bool>(0),
            )?
        };

        let kind = if package_left {
            ChangeKind::PackageChanged
        } else {
            ChangeKind::PackageRemoved
        };
        info!("Removed provider {}", component);
        self.notify(&ChangeEvent::new(kind, component.package.clone()));
        Ok(true)
    }

    /// Remove every provider of a package. Returns how many were removed.
    pub fn remove_package(&self, package: &str) -> Result<usize> {
        let rows = {
            let conn = self.lock_conn()?;
            conn.execute("DELETE FROM providers WHERE package = ?1", params![package])?
        };

        if rows > 0 {
            info!("Removed package {} ({} providers)", package, rows);
            self.notify(&ChangeEvent::new(ChangeKind::PackageRemoved, package));
        }
        Ok(rows)
    }

    /// Enable or disable a provider without removing it.
    pub fn set_enabled(&self, component: &ComponentName, enabled: bool) -> Result<bool> {
        let rows = {
            let conn = self.lock_conn()?;
            conn.execute(
                "UPDATE providers SET enabled = ?1 WHERE package = ?2 AND class_name = ?3",
                params![enabled, component.package, component.class],
            )?
        };

        if rows > 0 {
            debug!("Set {} enabled={}", component, enabled);
            self.notify(&ChangeEvent::new(ChangeKind::PackageChanged, component.package.clone()));
        }
        Ok(rows > 0)
    }

    /// All providers, enabled or not, in installation order.
    pub fn list(&self) -> Result<Vec<ProviderInfo>> {
        let rows: Vec<ProviderRow> = {
            let conn = self.lock_conn()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM providers ORDER BY rowid",
                PROVIDER_COLUMNS
            ))?;
            let mapped = stmt.query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })?;
            let mut rows = Vec::new();
            for row in mapped {
                rows.push(row?);
            }
            rows
        };

        rows.into_iter().map(provider_from_row).collect()
    }

    /// Broadcast a change to this instance's receivers.
    ///
    /// Called by the mutating operations above; also public for changes made
    /// through another handle on the same database file.
    pub fn notify(&self, event: &ChangeEvent) {
        self.receivers.broadcast(event);
    }
}

fn provider_from_row(row: ProviderRow) -> Result<ProviderInfo> {
    let (id, package, class, filter_json, enabled, installed_at) = row;
    Ok(ProviderInfo {
        id,
        component: ComponentName::new(package, class),
        filter: serde_json::from_str(&filter_json)?,
        enabled,
        installed_at,
    })
}

impl ServiceDirectory for SqliteDirectory {
    fn query_services(&self, descriptor: &Descriptor) -> Result<Vec<ProviderInfo>> {
        let matches: Vec<ProviderInfo> = self
            .list()?
            .into_iter()
            .filter(|p| p.enabled)
            .filter(|p| match &descriptor.component {
                Some(component) => &p.component == component,
                None => true,
            })
            .filter(|p| match &descriptor.package {
                Some(package) => &p.component.package == package,
                None => true,
            })
            .filter(|p| descriptor.component.is_some() || p.filter.matches(descriptor))
            .collect();

        debug!("Directory query {} matched {} providers", descriptor, matches.len());
        Ok(matches)
    }
}

impl ChangeRegistry for SqliteDirectory {
    fn register(&self, filter: ChangeFilter, receiver: Arc<dyn ChangeReceiver>) -> Result<Subscription> {
        Ok(self.receivers.register(filter, receiver))
    }

    fn registered_count(&self) -> usize {
        self.receivers.len()
    }
}
