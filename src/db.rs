//! Local SQLite database layer for the sync core.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, the metadata
//! helpers, and the SQLite implementation of [`LocalStore`]. The database file
//! is the durability boundary: a sale is safe once its row is committed here.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info};

use crate::error::StorageError;
use crate::models::{CachedProduct, PendingSale, RejectedSale};
use crate::store::{LocalStore, META_CATALOG_REFRESHED_AT, META_CATALOG_VERSION};

const DB_FILE_NAME: &str = "catalyst-sync.db";

/// Shared handle on the database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Initialize the database at `{data_dir}/catalyst-sync.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas and
/// runs pending migrations. Open failures are returned as-is: the file may
/// hold unsynced sales, so it is never deleted to recover.
pub fn init(data_dir: &Path) -> Result<DbState, StorageError> {
    fs::create_dir_all(data_dir)?;

    let db_path = data_dir.join(DB_FILE_NAME);
    info!("Opening database at {}", db_path.display());

    let conn = open_and_configure(&db_path).map_err(|e| {
        error!("Database open failed: {e}");
        e
    })?;
    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open a private in-memory database with the full schema.
pub fn open_in_memory() -> Result<DbState, StorageError> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    run_migrations(&conn)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, StorageError> {
    let conn = Connection::open(path)?;

    // FULL sync: an acknowledged enqueue must survive power loss, not just a crash.
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = FULL;",
    )?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        debug!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

fn migration_error(version: i32) -> impl FnOnce(rusqlite::Error) -> StorageError {
    move |e| {
        error!("Migration v{version} failed: {e}");
        StorageError::Migration {
            version,
            message: e.to_string(),
        }
    }
}

/// Migration v1: pending sale queue, rejection log, metadata.
fn migrate_v1(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        -- pending_sales (insert + delete only; rows are never updated)
        CREATE TABLE IF NOT EXISTS pending_sales (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT UNIQUE NOT NULL,
            payload TEXT NOT NULL,
            total REAL NOT NULL DEFAULT 0,
            cashier_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            enqueued_at TEXT DEFAULT (datetime('now'))
        );

        -- rejected_sales (permanently refused by the backend)
        CREATE TABLE IF NOT EXISTS rejected_sales (
            sale_id TEXT PRIMARY KEY,
            payload TEXT NOT NULL,
            reason TEXT NOT NULL,
            rejected_at TEXT NOT NULL
        );

        -- sync_meta (key/value)
        CREATE TABLE IF NOT EXISTS sync_meta (
            meta_key TEXT PRIMARY KEY,
            meta_value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now'))
        );

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(migration_error(1))?;

    info!("Applied migration v1");
    Ok(())
}

/// Migration v2: catalog snapshot for offline sale entry.
fn migrate_v2(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS cached_products (
            id TEXT PRIMARY KEY,
            position INTEGER NOT NULL,
            name TEXT NOT NULL,
            price REAL NOT NULL,
            stock INTEGER NOT NULL DEFAULT 0,
            category TEXT,
            cost_price REAL
        );

        CREATE INDEX IF NOT EXISTS idx_cached_products_position ON cached_products(position);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(migration_error(2))?;

    info!("Applied migration v2");
    Ok(())
}

// ---------------------------------------------------------------------------
// Metadata helpers
// ---------------------------------------------------------------------------

/// Get a single metadata value.
pub fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>, StorageError> {
    let value = conn
        .query_row(
            "SELECT meta_value FROM sync_meta WHERE meta_key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

/// Insert or update a metadata value.
pub fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<(), StorageError> {
    conn.execute(
        "INSERT INTO sync_meta (meta_key, meta_value, updated_at)
         VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(meta_key) DO UPDATE SET
            meta_value = excluded.meta_value,
            updated_at = excluded.updated_at",
        params![key, value],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// LocalStore
// ---------------------------------------------------------------------------

impl DbState {
    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        Ok(self.conn.lock()?)
    }
}

fn parse_rows<T: serde::de::DeserializeOwned>(
    payloads: Vec<String>,
) -> Result<Vec<T>, StorageError> {
    payloads
        .iter()
        .map(|p| serde_json::from_str(p).map_err(StorageError::from))
        .collect()
}

impl LocalStore for DbState {
    fn insert_pending(&self, sale: &PendingSale) -> Result<bool, StorageError> {
        let payload = serde_json::to_string(sale)?;
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT INTO pending_sales (id, payload, total, cashier_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO NOTHING",
            params![
                sale.id,
                payload,
                sale.total,
                sale.cashier_id,
                sale.created_at.to_rfc3339()
            ],
        )?;
        Ok(inserted > 0)
    }

    fn list_pending(&self) -> Result<Vec<PendingSale>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT payload FROM pending_sales ORDER BY seq ASC")?;
        let payloads = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        parse_rows(payloads)
    }

    fn delete_pending(&self, id: &str) -> Result<bool, StorageError> {
        let conn = self.lock()?;
        let deleted = conn.execute("DELETE FROM pending_sales WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    fn count_pending(&self) -> Result<usize, StorageError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM pending_sales", [], |row| {
            row.get(0)
        })?;
        Ok(count.max(0) as usize)
    }

    fn reject_pending(&self, rejected: &RejectedSale) -> Result<(), StorageError> {
        let payload = serde_json::to_string(&rejected.sale)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM pending_sales WHERE id = ?1",
            params![rejected.sale.id],
        )?;
        tx.execute(
            "INSERT INTO rejected_sales (sale_id, payload, reason, rejected_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(sale_id) DO UPDATE SET
                reason = excluded.reason,
                rejected_at = excluded.rejected_at",
            params![
                rejected.sale.id,
                payload,
                rejected.reason,
                rejected.rejected_at.to_rfc3339()
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn list_rejected(&self) -> Result<Vec<RejectedSale>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT payload, reason, rejected_at FROM rejected_sales ORDER BY rejected_at ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(payload, reason, rejected_at)| {
                let sale: PendingSale = serde_json::from_str(&payload)?;
                let rejected_at = DateTime::parse_from_rfc3339(&rejected_at)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now());
                Ok(RejectedSale {
                    sale,
                    reason,
                    rejected_at,
                })
            })
            .collect()
    }

    fn clear_rejected(&self) -> Result<usize, StorageError> {
        let conn = self.lock()?;
        Ok(conn.execute("DELETE FROM rejected_sales", [])?)
    }

    fn replace_products(
        &self,
        products: &[CachedProduct],
        version: &str,
        refreshed_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM cached_products", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO cached_products
                    (id, position, name, price, stock, category, cost_price)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for (position, p) in products.iter().enumerate() {
                stmt.execute(params![
                    p.id,
                    position as i64,
                    p.name,
                    p.price,
                    p.stock,
                    p.category,
                    p.cost_price
                ])?;
            }
        }
        set_meta(&tx, META_CATALOG_VERSION, version)?;
        set_meta(&tx, META_CATALOG_REFRESHED_AT, &refreshed_at.to_rfc3339())?;
        tx.commit()?;
        Ok(())
    }

    fn load_products(&self) -> Result<Vec<CachedProduct>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, price, stock, category, cost_price
             FROM cached_products ORDER BY position ASC",
        )?;
        let products = stmt
            .query_map([], |row| {
                Ok(CachedProduct {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    price: row.get(2)?,
                    stock: row.get(3)?,
                    category: row.get(4)?,
                    cost_price: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(products)
    }

    fn get_meta(&self, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.lock()?;
        get_meta(&conn, key)
    }

    fn set_meta(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let conn = self.lock()?;
        set_meta(&conn, key, value)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PaymentMethod, SaleLineItem};

    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .expect("pragma setup");
        conn
    }

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("prepare table list");
        stmt.query_map([], |row| row.get(0))
            .expect("query tables")
            .filter_map(|r| r.ok())
            .collect()
    }

    fn sale(id: &str, total: f64) -> PendingSale {
        PendingSale {
            id: id.to_string(),
            items: vec![SaleLineItem::new("p-1", "Widget", 1, total, total / 2.0)],
            subtotal: total,
            total,
            discount: 0.0,
            tax: 0.0,
            payment_method: PaymentMethod::Cash,
            cashier_id: "cashier-1".into(),
            notes: None,
            created_at: Utc::now(),
        }
    }

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("catalyst_sync_{name}_{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_migrations_v1_to_latest() {
        let conn = test_db();
        run_migrations(&conn).expect("run_migrations should succeed");

        let tables = table_names(&conn);
        for table in ["pending_sales", "rejected_sales", "sync_meta", "cached_products"] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = test_db();
        run_migrations(&conn).expect("first run");
        run_migrations(&conn).expect("second run should succeed");

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .expect("read schema version");
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_pending_sale_id_unique() {
        let conn = test_db();
        run_migrations(&conn).unwrap();

        conn.execute(
            "INSERT INTO pending_sales (id, payload, cashier_id, created_at)
             VALUES ('s1', '{}', 'c1', '2026-01-01T00:00:00Z')",
            [],
        )
        .expect("first insert");
        let dup = conn.execute(
            "INSERT INTO pending_sales (id, payload, cashier_id, created_at)
             VALUES ('s1', '{}', 'c1', '2026-01-01T00:00:00Z')",
            [],
        );
        assert!(dup.is_err(), "duplicate sale id should be rejected");
    }

    #[test]
    fn test_wal_mode_on_file_db() {
        let dir = temp_dir("wal");
        let db = init(&dir).expect("init file db");
        {
            let conn = db.conn.lock().unwrap();
            let mode: String = conn
                .query_row("PRAGMA journal_mode", [], |row| row.get(0))
                .expect("read journal_mode");
            assert_eq!(mode.to_lowercase(), "wal");
        }
        drop(db);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_pending_sales_survive_reopen() {
        let dir = temp_dir("reopen");
        {
            let db = init(&dir).expect("init");
            db.insert_pending(&sale("s1", 52.97)).unwrap();
            db.insert_pending(&sale("s2", 10.0)).unwrap();
        }

        let reopened = init(&dir).expect("reopen");
        let pending = reopened.list_pending().unwrap();
        let ids: Vec<&str> = pending.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s2"]);
        assert_eq!(pending[0].total, 52.97);

        drop(reopened);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_list_pending_follows_insertion_order_not_clock() {
        let db = open_in_memory().unwrap();
        let mut late = sale("late-clock", 1.0);
        late.created_at = Utc::now() + chrono::Duration::hours(3);
        let early = sale("early-clock", 2.0);

        db.insert_pending(&late).unwrap();
        db.insert_pending(&early).unwrap();

        let ids: Vec<String> = db.list_pending().unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["late-clock", "early-clock"]);
    }

    #[test]
    fn test_insert_pending_never_overwrites() {
        let db = open_in_memory().unwrap();
        assert!(db.insert_pending(&sale("s1", 5.0)).unwrap());
        assert!(!db.insert_pending(&sale("s1", 7.0)).unwrap());
        assert_eq!(db.list_pending().unwrap()[0].total, 5.0);
    }

    #[test]
    fn test_delete_pending_is_idempotent() {
        let db = open_in_memory().unwrap();
        db.insert_pending(&sale("s1", 5.0)).unwrap();
        assert!(db.delete_pending("s1").unwrap());
        assert!(!db.delete_pending("s1").unwrap());
        assert_eq!(db.count_pending().unwrap(), 0);
    }

    #[test]
    fn test_reject_pending_moves_row_in_one_transaction() {
        let db = open_in_memory().unwrap();
        db.insert_pending(&sale("s1", 5.0)).unwrap();
        db.reject_pending(&RejectedSale {
            sale: sale("s1", 5.0),
            reason: "Validation failed (HTTP 422)".into(),
            rejected_at: Utc::now(),
        })
        .unwrap();

        assert_eq!(db.count_pending().unwrap(), 0);
        let rejected = db.list_rejected().unwrap();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].sale.id, "s1");
        assert_eq!(rejected[0].reason, "Validation failed (HTTP 422)");
    }

    #[test]
    fn test_replace_products_is_full_replace() {
        let db = open_in_memory().unwrap();
        let first = vec![
            CachedProduct {
                id: "p-1".into(),
                name: "Tea".into(),
                price: 3.5,
                stock: 10,
                category: Some("Drinks".into()),
                cost_price: None,
            },
            CachedProduct {
                id: "p-2".into(),
                name: "Cake".into(),
                price: 4.0,
                stock: 2,
                category: None,
                cost_price: Some(1.5),
            },
        ];
        db.replace_products(&first, "v1", Utc::now()).unwrap();
        assert_eq!(db.load_products().unwrap(), first);

        let second = vec![first[1].clone()];
        db.replace_products(&second, "v2", Utc::now()).unwrap();
        assert_eq!(db.load_products().unwrap(), second);
        assert_eq!(
            db.get_meta(META_CATALOG_VERSION).unwrap().as_deref(),
            Some("v2")
        );
    }

    #[test]
    fn test_meta_crud() {
        let db = open_in_memory().unwrap();
        assert!(LocalStore::get_meta(&db, "k").unwrap().is_none());
        LocalStore::set_meta(&db, "k", "v1").unwrap();
        LocalStore::set_meta(&db, "k", "v2").unwrap();
        assert_eq!(LocalStore::get_meta(&db, "k").unwrap().as_deref(), Some("v2"));
    }
}
