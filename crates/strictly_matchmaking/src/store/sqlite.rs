//! SQLite-backed key/value store.

use diesel::prelude::*;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, instrument};

use crate::store::models::{KvEntry, NewKvEntry};
use crate::store::{KeyValueStore, StoreError, schema};

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Durable store in a single SQLite file.
pub struct SqliteStore {
    db_path: String,
    conn: Mutex<SqliteConnection>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("db_path", &self.db_path)
            .finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Opens (or creates) the database at `db_path` and applies migrations.
    ///
    /// Use `":memory:"` for a throwaway database.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the connection or a migration fails.
    #[instrument(skip(db_path), fields(db_path = %db_path.as_ref()))]
    pub fn open(db_path: impl AsRef<str>) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref().to_string();
        let mut conn = SqliteConnection::establish(&db_path)
            .map_err(|e| StoreError::new(format!("Failed to connect to '{}': {}", db_path, e)))?;

        let applied = conn
            .run_pending_migrations(MIGRATIONS)
            .map_err(|e| StoreError::new(format!("Migrations failed: {}", e)))?;
        info!(path = %db_path, migrations = applied.len(), "Store opened");

        Ok(Self {
            db_path,
            conn: Mutex::new(conn),
        })
    }

    /// Path this store was opened with.
    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    /// All entries in `scope`, most recently written first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    #[instrument(skip(self))]
    pub fn entries(&self, scope: &str) -> Result<Vec<KvEntry>, StoreError> {
        use schema::kv_entries::dsl;

        let entries = dsl::kv_entries
            .filter(dsl::scope.eq(scope))
            .order(dsl::updated_at.desc())
            .select(KvEntry::as_select())
            .load(&mut *self.conn())?;
        debug!(count = entries.len(), "Entries loaded");
        Ok(entries)
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, SqliteConnection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl KeyValueStore for SqliteStore {
    #[instrument(skip(self))]
    fn get(&self, scope: &str, key: &str) -> Result<Option<String>, StoreError> {
        use schema::kv_entries::dsl;

        let value = dsl::kv_entries
            .filter(dsl::scope.eq(scope))
            .filter(dsl::entry_key.eq(key))
            .select(dsl::value)
            .first::<String>(&mut *self.conn())
            .optional()?;
        debug!(found = value.is_some(), "Entry looked up");
        Ok(value)
    }

    #[instrument(skip(self, value), fields(len = value.len()))]
    fn set(&self, scope: &str, key: &str, value: &str) -> Result<(), StoreError> {
        let entry = NewKvEntry::new(
            scope.to_string(),
            key.to_string(),
            value.to_string(),
            chrono::Utc::now().naive_utc(),
        );
        diesel::replace_into(schema::kv_entries::table)
            .values(&entry)
            .execute(&mut *self.conn())?;
        debug!("Entry written");
        Ok(())
    }

    #[instrument(skip(self))]
    fn remove(&self, scope: &str, key: &str) -> Result<(), StoreError> {
        use schema::kv_entries::dsl;

        let removed = diesel::delete(
            dsl::kv_entries
                .filter(dsl::scope.eq(scope))
                .filter(dsl::entry_key.eq(key)),
        )
        .execute(&mut *self.conn())?;
        debug!(removed, "Entry removed");
        Ok(())
    }
}
