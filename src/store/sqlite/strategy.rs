//! Statement strategies: where the database lives, its schema, and the SQL
//! the store runs against it.

use crate::config::StoreOptions;
use crate::error::Result;
use rusqlite::Connection;
use tracing::debug;

/// SQL text used by [`super::SqliteStore`].
///
/// Parameter order for `insert`/`update` is key, value, flags, exptime, cas,
/// partition (and row id for `update`). Row-returning statements yield key,
/// value, flags, exptime, cas, partition, row id.
#[derive(Debug, Clone, Copy)]
pub struct Statements {
  pub begin: &'static str,
  pub commit: &'static str,
  pub rollback: &'static str,
  pub insert: &'static str,
  pub update: &'static str,
  pub select: &'static str,
  pub select_by_row_id: &'static str,
  pub delete: &'static str,
  pub delete_partition: &'static str,
  pub set_partition_state: &'static str,
  pub list_partitions: &'static str,
  pub dump: &'static str,
}

/// Provider of an open database handle and the statements run against it.
pub trait StatementStrategy {
  /// Open and configure a connection.
  fn open(&mut self) -> Result<Connection>;

  /// Called when the store owning the connection shuts down.
  fn close(&mut self) {}

  fn init_tables(&self, conn: &Connection) -> Result<()>;

  fn destroy_tables(&self, conn: &Connection) -> Result<()>;

  fn statements(&self) -> &Statements;
}

const SINGLE_TABLE_STATEMENTS: Statements = Statements {
  begin: "BEGIN",
  commit: "COMMIT",
  rollback: "ROLLBACK",
  insert: "INSERT INTO kv (k, v, flags, exptime, cas, vbucket) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
  update: "UPDATE kv SET k = ?1, v = ?2, flags = ?3, exptime = ?4, cas = ?5, vbucket = ?6 \
           WHERE rowid = ?7",
  select: "SELECT k, v, flags, exptime, cas, vbucket, rowid FROM kv WHERE k = ?1 \
           ORDER BY rowid DESC LIMIT 1",
  select_by_row_id: "SELECT k, v, flags, exptime, cas, vbucket, rowid FROM kv \
                     WHERE rowid = ?1 AND k = ?2",
  delete: "DELETE FROM kv WHERE k = ?1 AND vbucket = ?2",
  delete_partition: "DELETE FROM kv WHERE vbucket = ?1",
  set_partition_state: "INSERT OR REPLACE INTO partition_states (vbid, state, last_change) \
                        VALUES (?1, ?2, ?3)",
  list_partitions: "SELECT vbid, state FROM partition_states ORDER BY vbid",
  dump: "SELECT k, v, flags, exptime, cas, vbucket, rowid FROM kv ORDER BY rowid",
};

/// All records in one `kv` table, partition states in `partition_states`.
#[derive(Debug, Clone)]
pub struct SingleTableStrategy {
  options: StoreOptions,
}

impl SingleTableStrategy {
  pub fn new(options: StoreOptions) -> Result<Self> {
    options.validate()?;
    Ok(Self { options })
  }

  pub fn in_memory() -> Self {
    Self {
      options: StoreOptions::default().in_memory(),
    }
  }

  pub fn options(&self) -> &StoreOptions {
    &self.options
  }
}

impl StatementStrategy for SingleTableStrategy {
  fn open(&mut self) -> Result<Connection> {
    let conn = match self.options.path.as_ref() {
      Some(path) => {
        if let Some(parent) = path.parent() {
          if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
          }
        }
        Connection::open(path)?
      }
      None => Connection::open_in_memory()?,
    };

    let journal_mode: String = conn.pragma_update_and_check(
      None,
      "journal_mode",
      self.options.journal_mode.as_str(),
      |row| row.get(0),
    )?;
    conn.pragma_update(None, "synchronous", self.options.synchronous.as_str())?;
    conn.busy_timeout(self.options.busy_timeout())?;

    debug!(
      path = ?self.options.path,
      journal_mode = %journal_mode,
      "opened sqlite store"
    );
    Ok(conn)
  }

  fn init_tables(&self, conn: &Connection) -> Result<()> {
    conn.execute_batch(
      "CREATE TABLE IF NOT EXISTS kv (
         vbucket INTEGER NOT NULL,
         k BLOB NOT NULL,
         v BLOB NOT NULL,
         flags INTEGER NOT NULL,
         exptime INTEGER NOT NULL,
         cas INTEGER NOT NULL
       );
       CREATE INDEX IF NOT EXISTS kv_key ON kv (k);
       CREATE INDEX IF NOT EXISTS kv_vbucket ON kv (vbucket);
       CREATE TABLE IF NOT EXISTS partition_states (
         vbid INTEGER PRIMARY KEY,
         state TEXT NOT NULL,
         last_change INTEGER NOT NULL
       );",
    )?;
    Ok(())
  }

  fn destroy_tables(&self, conn: &Connection) -> Result<()> {
    conn.execute_batch(
      "DROP TABLE IF EXISTS kv;
       DROP TABLE IF EXISTS partition_states;",
    )?;
    Ok(())
  }

  fn statements(&self) -> &Statements {
    &SINGLE_TABLE_STATEMENTS
  }
}
