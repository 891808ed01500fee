use std::path::Path;

use anyhow::{anyhow, Context, Result};
use category_tree_core::{
    assemble_forest, Category, CategoryId, CategoryStore, SaveCategory, StoreError,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS categories (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL UNIQUE,
  parent_id INTEGER REFERENCES categories(id) ON DELETE RESTRICT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_categories_parent_id ON categories(parent_id);
";

const MIGRATION_002_SQL: &str = r"
CREATE TRIGGER IF NOT EXISTS categories_reject_self_parent
BEFORE UPDATE OF parent_id ON categories
WHEN NEW.parent_id IS NOT NULL AND NEW.parent_id = NEW.id
BEGIN
  SELECT RAISE(ABORT, 'category cannot be its own parent');
END;
";

const MIGRATIONS: &[(i64, &str)] = &[(1, MIGRATION_001_SQL), (2, MIGRATION_002_SQL)];

const SELECT_CATEGORY_COLUMNS: &str = "SELECT id, name, parent_id, created_at, updated_at FROM categories";

const UNIT_SAVEPOINT: &str = "category_unit";

pub struct SqliteCategoryStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

struct CategoryRow {
    id: i64,
    name: String,
    parent_id: Option<i64>,
    created_at: String,
    updated_at: String,
}

impl CategoryRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            parent_id: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
        })
    }

    fn into_category(self) -> Result<Category, StoreError> {
        Ok(Category {
            id: CategoryId(self.id),
            name: self.name,
            parent_id: self.parent_id.map(CategoryId),
            parent: None,
            children: None,
            created_at: parse_rfc3339(&self.created_at)?,
            updated_at: parse_rfc3339(&self.updated_at)?,
        })
    }
}

impl SqliteCategoryStore {
    /// Open a SQLite-backed category store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = MIGRATIONS
            .iter()
            .map(|(version, _)| *version)
            .filter(|version| *version > current_version)
            .collect();

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when the database is newer than this build or any
    /// migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let current_version = current_schema_version(&self.conn)?;
        if current_version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {current_version}; expected at most {LATEST_SCHEMA_VERSION}"
            ));
        }

        for (version, sql) in MIGRATIONS.iter().filter(|(version, _)| *version > current_version) {
            let tx = self
                .conn
                .transaction()
                .with_context(|| format!("failed to start migration v{version} transaction"))?;
            tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{version}"))?;
            record_schema_version(&tx, *version)?;
            tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
            tracing::info!(version = *version, "applied category schema migration");
        }

        Ok(())
    }

    #[cfg(test)]
    fn count_categories(&self) -> Result<usize> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM categories", [], |row| row.get::<_, i64>(0))
            .context("failed to count categories")?;
        usize::try_from(count).context("category count out of range")
    }

    fn query_categories(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
        context: &str,
    ) -> Result<Vec<Category>, StoreError> {
        let mut stmt = self.conn.prepare(sql).map_err(|err| classify_sqlite(&err, context))?;
        let rows = stmt
            .query_map(params, CategoryRow::from_row)
            .map_err(|err| classify_sqlite(&err, context))?;

        let mut categories = Vec::new();
        for row in rows {
            let row = row.map_err(|err| classify_sqlite(&err, context))?;
            categories.push(row.into_category()?);
        }
        Ok(categories)
    }
}

impl CategoryStore for SqliteCategoryStore {
    fn find_by_id(&self, id: CategoryId) -> Result<Category, StoreError> {
        ensure_valid_id(id)?;
        let row = self
            .conn
            .query_row(
                &format!("{SELECT_CATEGORY_COLUMNS} WHERE id = ?1"),
                params![id.0],
                CategoryRow::from_row,
            )
            .optional()
            .map_err(|err| classify_sqlite(&err, "failed to load category"))?;

        match row {
            Some(row) => row.into_category(),
            None => Err(StoreError::NotFound(format!("category {id}"))),
        }
    }

    fn find_all_as_forest(&self) -> Result<Vec<Category>, StoreError> {
        let rows = self.query_categories(
            &format!("{SELECT_CATEGORY_COLUMNS} ORDER BY id ASC"),
            [],
            "failed to list categories",
        )?;
        Ok(assemble_forest(rows))
    }

    fn find_children_of(&self, parent_id: CategoryId) -> Result<Vec<Category>, StoreError> {
        ensure_valid_id(parent_id)?;
        self.query_categories(
            &format!("{SELECT_CATEGORY_COLUMNS} WHERE parent_id = ?1 ORDER BY id ASC"),
            params![parent_id.0],
            "failed to list child categories",
        )
    }

    fn save(&mut self, category: SaveCategory) -> Result<Category, StoreError> {
        if let Some(parent_id) = category.parent_id {
            ensure_valid_id(parent_id)?;
        }
        let now = now_rfc3339()?;

        let id = match category.id {
            None => {
                self.conn
                    .execute(
                        "INSERT INTO categories(name, parent_id, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?3)",
                        params![category.name, category.parent_id.map(|id| id.0), now],
                    )
                    .map_err(|err| classify_sqlite(&err, "failed to insert category"))?;
                CategoryId(self.conn.last_insert_rowid())
            }
            Some(id) => {
                ensure_valid_id(id)?;
                let changed = self
                    .conn
                    .execute(
                        "UPDATE categories SET name = ?1, parent_id = ?2, updated_at = ?3
                         WHERE id = ?4",
                        params![category.name, category.parent_id.map(|id| id.0), now, id.0],
                    )
                    .map_err(|err| classify_sqlite(&err, "failed to update category"))?;
                if changed == 0 {
                    return Err(StoreError::NotFound(format!("category {id}")));
                }
                id
            }
        };

        self.find_by_id(id)
    }

    fn delete(&mut self, id: CategoryId) -> Result<(), StoreError> {
        ensure_valid_id(id)?;
        let changed = self
            .conn
            .execute("DELETE FROM categories WHERE id = ?1", params![id.0])
            .map_err(|err| classify_sqlite(&err, "failed to delete category"))?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("category {id}")));
        }
        Ok(())
    }

    fn begin_unit(&mut self) -> Result<(), StoreError> {
        self.conn
            .execute_batch(&format!("SAVEPOINT {UNIT_SAVEPOINT};"))
            .map_err(|err| classify_sqlite(&err, "failed to open unit of work"))
    }

    fn commit_unit(&mut self) -> Result<(), StoreError> {
        self.conn
            .execute_batch(&format!("RELEASE SAVEPOINT {UNIT_SAVEPOINT};"))
            .map_err(|err| classify_sqlite(&err, "failed to commit unit of work"))
    }

    fn rollback_unit(&mut self) -> Result<(), StoreError> {
        self.conn
            .execute_batch(&format!(
                "ROLLBACK TO SAVEPOINT {UNIT_SAVEPOINT}; RELEASE SAVEPOINT {UNIT_SAVEPOINT};"
            ))
            .map_err(|err| classify_sqlite(&err, "failed to roll back unit of work"))
    }
}

/// Map a `rusqlite` failure onto the port's error signals using SQLite's
/// extended result codes.
fn classify_sqlite(err: &rusqlite::Error, context: &str) -> StoreError {
    let detail = format!("{context}: {err}");
    match err {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            match failure.extended_code {
                rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY => StoreError::UniqueViolation(detail),
                rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY => {
                    StoreError::ForeignKeyViolation(detail)
                }
                rusqlite::ffi::SQLITE_CONSTRAINT_TRIGGER | rusqlite::ffi::SQLITE_CONSTRAINT_CHECK => {
                    StoreError::TreeShapeViolation(detail)
                }
                _ => StoreError::Backend(detail),
            }
        }
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(detail),
        _ => StoreError::Backend(detail),
    }
}

fn ensure_valid_id(id: CategoryId) -> Result<(), StoreError> {
    if id.is_valid() {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentifier(format!("category id {id} is not positive")))
    }
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String, StoreError> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| StoreError::Backend(format!("failed to format RFC3339 timestamp: {err}")))
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime, StoreError> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| StoreError::Backend(format!("invalid RFC3339 timestamp {value}: {err}")))
}
