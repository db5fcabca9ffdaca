//! The embedded cache backend: one `cache.db` per subdir.

use std::path::{Path, PathBuf};

use rusqlite::{Connection, OptionalExtension};

use crate::cache::{
    ChanneldataRow, Fingerprint, FsEntry, PackageCache, PackagePayload, PayloadTable,
    CHANNEL_URL_FORMAT_VERSION, STAGE_INDEXED,
};
use crate::error::{Error, Result};

/// Highest `PRAGMA user_version` this build understands.
const USER_VERSION: i64 = 1;

const PAYLOAD_TABLES: [PayloadTable; 7] = [
    PayloadTable::About,
    PayloadTable::IndexJson,
    PayloadTable::Recipe,
    PayloadTable::RecipeLog,
    PayloadTable::RunExports,
    PayloadTable::PostInstall,
    PayloadTable::Icon,
];

/// Cache for one subdir backed by `<subdir>/.cache/cache.db`.
pub struct SqliteCache {
    conn: Connection,
    upstream_stage: String,
}

impl SqliteCache {
    /// Open (creating directories, schema and migrations as needed) the
    /// cache for `channel_root/subdir`.
    pub fn open(channel_root: &Path, subdir: &str, upstream_stage: &str) -> Result<Self> {
        let cache_dir = channel_root.join(subdir).join(".cache");
        fs_err::create_dir_all(&cache_dir)?;
        let db_filename = cache_dir.join("cache.db");
        let brand_new = !db_filename.exists();

        tracing::debug!(
            "open cache {} brand_new={brand_new}",
            db_filename.display()
        );

        let conn = connect(&db_filename)?;
        let mut cache = SqliteCache {
            conn,
            upstream_stage: upstream_stage.to_string(),
        };
        if let Err(e) = cache.initialize(brand_new, &cache_dir) {
            // leave no half-migrated database behind; the next run starts over
            drop(cache);
            let _ = fs_err::remove_file(&db_filename);
            return Err(e);
        }
        Ok(cache)
    }

    fn initialize(&mut self, brand_new: bool, cache_dir: &Path) -> Result<()> {
        let tx = self.conn.transaction()?;
        create(&tx)?;
        migrate(&tx)?;
        tx.commit()?;
        if brand_new && cache_dir.join("stat.json").exists() {
            tracing::info!("converting legacy cache in {}", cache_dir.display());
            self.convert_legacy(cache_dir)?;
        }
        Ok(())
    }

    /// One-shot conversion of the pre-database `.cache` layout: per-kind
    /// directories of JSON files plus a `stat.json` of fingerprints.
    fn convert_legacy(&mut self, cache_dir: &Path) -> Result<()> {
        let tx = self.conn.transaction()?;

        let stat: serde_json::Map<String, serde_json::Value> =
            serde_json::from_slice(&fs_err::read(cache_dir.join("stat.json"))?)?;
        for (path, entry) in &stat {
            let mtime = entry.get("mtime").and_then(|v| v.as_i64()).unwrap_or(0);
            let size = entry.get("size").and_then(|v| v.as_i64()).unwrap_or(0);
            tx.execute(
                "INSERT OR REPLACE INTO stat (stage, path, mtime, size)
                 VALUES ('indexed', ?1, ?2, ?3)",
                (path, mtime, size),
            )?;
        }

        for (kind, table) in [
            ("index", PayloadTable::IndexJson),
            ("about", PayloadTable::About),
            ("recipe", PayloadTable::Recipe),
            ("recipe_log", PayloadTable::RecipeLog),
            ("run_exports", PayloadTable::RunExports),
            ("post_install", PayloadTable::PostInstall),
            ("icon", PayloadTable::Icon),
        ] {
            let kind_dir = cache_dir.join(kind);
            if !kind_dir.is_dir() {
                continue;
            }
            let ext = if table == PayloadTable::Icon {
                ".png"
            } else {
                ".json"
            };
            for entry in fs_err::read_dir(&kind_dir)? {
                let entry = entry?;
                let file_name = entry.file_name().to_string_lossy().into_owned();
                let Some(path) = file_name.strip_suffix(ext) else {
                    continue;
                };
                let data = fs_err::read(entry.path())?;
                tx.execute(
                    &format!(
                        "INSERT OR IGNORE INTO {} (path, {}) VALUES (?1, ?2)",
                        table.table_name(),
                        table.column_name()
                    ),
                    (path, data),
                )?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// For tests and tooling: the underlying connection.
    #[cfg(test)]
    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn connect(db_filename: &PathBuf) -> Result<Connection> {
    let conn = Connection::open(db_filename)?;
    // rollback journal, not WAL: network filesystems are a supported home
    // for channel directories
    conn.pragma_update(None, "journal_mode", "DELETE")?;
    conn.pragma_update(None, "busy_timeout", 30_000)?;
    Ok(conn)
}

/// Create schema. Safe to call on every connection.
fn create(conn: &Connection) -> Result<()> {
    for table in PAYLOAD_TABLES {
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (path TEXT PRIMARY KEY, {} BLOB)",
                table.table_name(),
                table.column_name()
            ),
            (),
        )?;
    }
    conn.execute(
        "CREATE TABLE IF NOT EXISTS stat (
            stage TEXT NOT NULL DEFAULT 'indexed',
            path TEXT NOT NULL,
            mtime NUMBER,
            size INTEGER,
            sha256 TEXT,
            md5 TEXT,
            last_modified TEXT,
            etag TEXT
        )",
        (),
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_stat ON stat (path, stage)",
        (),
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_stat_stage ON stat (stage, path)",
        (),
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS config (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
        (),
    )?;
    Ok(())
}

/// Upgrade older schemas in place. Call inside a transaction.
fn migrate(conn: &Connection) -> Result<()> {
    let user_version: i64 = conn.query_row("PRAGMA user_version", (), |row| row.get(0))?;

    if user_version > USER_VERSION {
        return Err(Error::CacheFormat(format!(
            "cache is too new: version {user_version} > {USER_VERSION}"
        )));
    }
    if user_version > 0 {
        return Ok(());
    }

    remove_prefix(conn)?;
    conn.pragma_update(None, "user_version", USER_VERSION)?;
    Ok(())
}

/// Early caches keyed rows by `{channel}/{subdir}/{fn}`; store bare
/// filenames instead. Call inside a transaction.
fn remove_prefix(conn: &Connection) -> Result<()> {
    let mut tables: Vec<&str> = PAYLOAD_TABLES.iter().map(|t| t.table_name()).collect();
    tables.push("stat");
    for table in tables {
        let prefixed: Vec<String> = conn
            .prepare(&format!(
                "SELECT path FROM {table} WHERE INSTR(path, '/') > 0"
            ))?
            .query_map((), |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        for path in prefixed {
            let basename = path.rsplit('/').next().unwrap_or(&path).to_string();
            conn.execute(
                &format!("UPDATE OR IGNORE {table} SET path = ?1 WHERE path = ?2"),
                (basename, path),
            )?;
        }
    }
    Ok(())
}

impl PackageCache for SqliteCache {
    fn save_fs_state(&mut self, entries: &[FsEntry]) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM stat WHERE stage = 'fs'", ())?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO stat (stage, path, mtime, size)
                 VALUES ('fs', ?1, ?2, ?3)",
            )?;
            for entry in entries {
                stmt.execute((&entry.path, entry.mtime, entry.size as i64))?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn changed_paths(&mut self) -> Result<Vec<FsEntry>> {
        let mut stmt = self.conn.prepare(
            "WITH
             fs AS
                 ( SELECT path, mtime, size FROM stat WHERE stage = ?1 ),
             cached AS
                 ( SELECT path, mtime, size FROM stat WHERE stage = 'indexed' )

             SELECT fs.path, fs.mtime, fs.size

             FROM fs LEFT JOIN cached USING (path)

             WHERE fs.mtime != cached.mtime OR fs.size != cached.size
                OR cached.path IS NULL",
        )?;
        let rows = stmt
            .query_map((&self.upstream_stage,), |row| {
                Ok(FsEntry {
                    path: row.get(0)?,
                    mtime: row.get(1)?,
                    size: row.get::<_, i64>(2)? as u64,
                })
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(rows)
    }

    fn store(
        &mut self,
        path: &str,
        fingerprint: &Fingerprint,
        payload: &PackagePayload,
    ) -> Result<()> {
        let tx = self.conn.transaction()?;
        for (table, data) in payload.tables() {
            tx.execute(
                &format!(
                    "INSERT OR REPLACE INTO {} (path, {}) VALUES (?1, ?2)",
                    table.table_name(),
                    table.column_name()
                ),
                (path, data),
            )?;
        }
        tx.execute(
            "INSERT OR REPLACE INTO stat (stage, path, mtime, size, sha256, md5)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            (
                STAGE_INDEXED,
                path,
                fingerprint.mtime,
                fingerprint.size as i64,
                fingerprint.sha256.map(|digest| digest.to_string()),
                fingerprint.md5.map(|digest| digest.to_string()),
            ),
        )?;
        tx.commit()?;
        Ok(())
    }

    fn indexed_packages(&mut self) -> Result<Vec<(String, Vec<u8>)>> {
        let mut stmt = self.conn.prepare(
            "SELECT path, index_json FROM stat JOIN index_json USING (path)
             WHERE stat.stage = ?1
             ORDER BY path",
        )?;
        let rows = stmt
            .query_map((&self.upstream_stage,), |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(rows)
    }

    fn run_exports(&mut self) -> Result<Vec<(String, Vec<u8>)>> {
        let mut stmt = self.conn.prepare(
            "SELECT path, run_exports FROM stat JOIN run_exports USING (path)
             WHERE stat.stage = ?1
             ORDER BY path",
        )?;
        let rows = stmt
            .query_map((&self.upstream_stage,), |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(rows)
    }

    fn channeldata_inputs(&mut self) -> Result<Vec<ChanneldataRow>> {
        // each table must USING (path) or will cross join
        let mut stmt = self.conn.prepare(
            "SELECT path, index_json, about, recipe, post_install, run_exports, icon_png
             FROM stat
                 JOIN index_json USING (path)
                 LEFT JOIN about USING (path)
                 LEFT JOIN recipe USING (path)
                 LEFT JOIN post_install USING (path)
                 LEFT JOIN run_exports USING (path)
                 LEFT JOIN icon USING (path)
             WHERE stat.stage = ?1
             ORDER BY path",
        )?;
        let rows = stmt
            .query_map((&self.upstream_stage,), |row| {
                Ok(ChanneldataRow {
                    path: row.get(0)?,
                    index_json: row.get(1)?,
                    about: row.get(2)?,
                    recipe: row.get(3)?,
                    post_install: row.get(4)?,
                    run_exports: row.get(5)?,
                    icon: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(rows)
    }

    fn channel_url_format_version(&mut self) -> Result<u32> {
        let stored: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM config WHERE key = 'channel_url_format_version'",
                (),
                |row| row.get(0),
            )
            .optional()?;
        match stored {
            Some(value) => value
                .parse()
                .map_err(|_| Error::CacheFormat(format!("bad channel_url_format_version {value}"))),
            None => {
                self.conn.execute(
                    "INSERT INTO config (key, value) VALUES ('channel_url_format_version', ?1)",
                    (CHANNEL_URL_FORMAT_VERSION.to_string(),),
                )?;
                Ok(CHANNEL_URL_FORMAT_VERSION)
            }
        }
    }
}
