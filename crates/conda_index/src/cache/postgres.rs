//! The shared server backend: every subdir of every channel in one
//! PostgreSQL database, namespaced by `{channel_prefix}/{subdir}/`.

use postgres::{Client, NoTls};

use crate::cache::{
    ChanneldataRow, Fingerprint, FsEntry, PackageCache, PackagePayload, PayloadTable,
    CHANNEL_URL_FORMAT_VERSION, STAGE_INDEXED,
};
use crate::error::{Error, Result};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS about (path TEXT PRIMARY KEY, about BYTEA);
CREATE TABLE IF NOT EXISTS index_json (path TEXT PRIMARY KEY, index_json BYTEA);
CREATE TABLE IF NOT EXISTS recipe (path TEXT PRIMARY KEY, recipe BYTEA);
CREATE TABLE IF NOT EXISTS recipe_log (path TEXT PRIMARY KEY, recipe_log BYTEA);
CREATE TABLE IF NOT EXISTS run_exports (path TEXT PRIMARY KEY, run_exports BYTEA);
CREATE TABLE IF NOT EXISTS post_install (path TEXT PRIMARY KEY, post_install BYTEA);
CREATE TABLE IF NOT EXISTS icon (path TEXT PRIMARY KEY, icon_png BYTEA);
CREATE TABLE IF NOT EXISTS stat (
    stage TEXT NOT NULL,
    path TEXT NOT NULL,
    mtime BIGINT,
    size BIGINT,
    sha256 TEXT,
    md5 TEXT,
    last_modified TEXT,
    etag TEXT,
    PRIMARY KEY (path, stage)
);
CREATE INDEX IF NOT EXISTS idx_stat_stage ON stat (stage, path);
CREATE TABLE IF NOT EXISTS config (key TEXT PRIMARY KEY, value TEXT NOT NULL);
";

/// Cache handle for one `(channel_prefix, subdir)` slice of the shared
/// database. Distinct slices may be written concurrently; the schema has no
/// cross-subdir state.
pub struct PostgresCache {
    client: Client,
    /// `{channel_prefix}/{subdir}/`, prepended to every path.
    prefix: String,
    upstream_stage: String,
}

impl PostgresCache {
    pub fn open(url: &str, channel_prefix: &str, subdir: &str, upstream_stage: &str) -> Result<Self> {
        let mut client = Client::connect(url, NoTls)?;
        client.batch_execute(SCHEMA)?;
        Ok(PostgresCache {
            client,
            prefix: format!("{channel_prefix}/{subdir}/"),
            upstream_stage: upstream_stage.to_string(),
        })
    }

    fn database_path(&self, path: &str) -> String {
        format!("{}{path}", self.prefix)
    }

    /// LIKE pattern matching exactly this cache's slice of the keyspace.
    fn path_like(&self) -> String {
        like_escape(&self.prefix)
    }

    fn plain_path(path: &str) -> String {
        path.rsplit('/').next().unwrap_or(path).to_string()
    }
}

/// Escape LIKE wildcards in `prefix` and append `%`.
fn like_escape(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

impl PackageCache for PostgresCache {
    fn save_fs_state(&mut self, entries: &[FsEntry]) -> Result<()> {
        let path_like = self.path_like();
        let mut tx = self.client.transaction()?;
        tx.execute(
            "DELETE FROM stat WHERE stage = 'fs' AND path LIKE $1",
            &[&path_like],
        )?;
        for entry in entries {
            tx.execute(
                "INSERT INTO stat (stage, path, mtime, size)
                 VALUES ('fs', $1, $2, $3)
                 ON CONFLICT (path, stage)
                 DO UPDATE SET mtime = EXCLUDED.mtime, size = EXCLUDED.size",
                &[
                    &format!("{}{}", self.prefix, entry.path),
                    &entry.mtime,
                    &(entry.size as i64),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn changed_paths(&mut self) -> Result<Vec<FsEntry>> {
        let rows = self.client.query(
            "WITH
             fs AS
                 ( SELECT path, mtime, size FROM stat WHERE stage = $1 ),
             cached AS
                 ( SELECT path, mtime, size FROM stat WHERE stage = 'indexed' )

             SELECT fs.path, fs.mtime, fs.size

             FROM fs LEFT JOIN cached USING (path)

             WHERE fs.path LIKE $2 AND
                 (fs.mtime != cached.mtime OR fs.size != cached.size
                  OR cached.path IS NULL)",
            &[&self.upstream_stage, &self.path_like()],
        )?;
        Ok(rows
            .into_iter()
            .map(|row| FsEntry {
                path: Self::plain_path(row.get(0)),
                mtime: row.get(1),
                size: row.get::<_, i64>(2) as u64,
            })
            .collect())
    }

    fn store(
        &mut self,
        path: &str,
        fingerprint: &Fingerprint,
        payload: &PackagePayload,
    ) -> Result<()> {
        let database_path = self.database_path(path);
        let mut tx = self.client.transaction()?;
        for (table, data) in payload.tables() {
            let (table, column) = (table.table_name(), table.column_name());
            tx.execute(
                &format!(
                    "INSERT INTO {table} (path, {column}) VALUES ($1, $2)
                     ON CONFLICT (path) DO UPDATE SET {column} = EXCLUDED.{column}"
                ),
                &[&database_path, &data],
            )?;
        }
        tx.execute(
            "INSERT INTO stat (stage, path, mtime, size, sha256, md5)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (path, stage)
             DO UPDATE SET mtime = EXCLUDED.mtime, size = EXCLUDED.size,
                           sha256 = EXCLUDED.sha256, md5 = EXCLUDED.md5",
            &[
                &STAGE_INDEXED,
                &database_path,
                &fingerprint.mtime,
                &(fingerprint.size as i64),
                &fingerprint.sha256.map(|digest| digest.to_string()),
                &fingerprint.md5.map(|digest| digest.to_string()),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn indexed_packages(&mut self) -> Result<Vec<(String, Vec<u8>)>> {
        let rows = self.client.query(
            "SELECT path, index_json FROM stat JOIN index_json USING (path)
             WHERE stat.stage = $1 AND path LIKE $2
             ORDER BY path",
            &[&self.upstream_stage, &self.path_like()],
        )?;
        Ok(rows
            .into_iter()
            .map(|row| (Self::plain_path(row.get(0)), row.get(1)))
            .collect())
    }

    fn run_exports(&mut self) -> Result<Vec<(String, Vec<u8>)>> {
        let rows = self.client.query(
            "SELECT path, run_exports FROM stat JOIN run_exports USING (path)
             WHERE stat.stage = $1 AND path LIKE $2
             ORDER BY path",
            &[&self.upstream_stage, &self.path_like()],
        )?;
        Ok(rows
            .into_iter()
            .map(|row| (Self::plain_path(row.get(0)), row.get(1)))
            .collect())
    }

    fn channeldata_inputs(&mut self) -> Result<Vec<ChanneldataRow>> {
        let rows = self.client.query(
            "SELECT path, index_json, about, recipe, post_install, run_exports, icon_png
             FROM stat
                 JOIN index_json USING (path)
                 LEFT JOIN about USING (path)
                 LEFT JOIN recipe USING (path)
                 LEFT JOIN post_install USING (path)
                 LEFT JOIN run_exports USING (path)
                 LEFT JOIN icon USING (path)
             WHERE stat.stage = $1 AND path LIKE $2
             ORDER BY path",
            &[&self.upstream_stage, &self.path_like()],
        )?;
        Ok(rows
            .into_iter()
            .map(|row| ChanneldataRow {
                path: Self::plain_path(row.get(0)),
                index_json: row.get(1),
                about: row.get(2),
                recipe: row.get(3),
                post_install: row.get(4),
                run_exports: row.get(5),
                icon: row.get(6),
            })
            .collect())
    }

    fn channel_url_format_version(&mut self) -> Result<u32> {
        let key = format!("{}channel_url_format_version", self.prefix);
        self.client.execute(
            "INSERT INTO config (key, value) VALUES ($1, $2) ON CONFLICT (key) DO NOTHING",
            &[&key, &CHANNEL_URL_FORMAT_VERSION.to_string()],
        )?;
        let row = self
            .client
            .query_one("SELECT value FROM config WHERE key = $1", &[&key])?;
        let value: String = row.get(0);
        value
            .parse()
            .map_err(|_| Error::CacheFormat(format!("bad channel_url_format_version {value}")))
    }
}

#[cfg(test)]
mod tests {
    // Exercising this backend needs a running server; the SQL semantics
    // shared with the embedded backend are covered by the sqlite tests.
    use super::*;

    #[test]
    fn test_like_escaping() {
        assert_eq!(like_escape("abc123/linux-64/"), "abc123/linux-64/%");
        assert_eq!(like_escape("a_b/noarch/"), "a\\_b/noarch/%");
    }

    #[test]
    fn test_plain_path() {
        assert_eq!(
            PostgresCache::plain_path("abc/noarch/zlib-1.0-0.conda"),
            "zlib-1.0-0.conda"
        );
        assert_eq!(PostgresCache::plain_path("zlib-1.0-0.conda"), "zlib-1.0-0.conda");
    }
}
