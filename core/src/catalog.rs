//! Catalog: the relational store of metadata rows plus multi-valued
//! keyword/collection tables (spec §4.3).
//!
//! `Record_Keywords.keyword` and `Record_Collections.collection` are
//! constrained by the configured `tag_regex`. SQLite has no native regex
//! operator, so the constraint is enforced by a scalar function registered
//! on the connection (`tag_matches`) referenced from a `CHECK` clause,
//! rather than a `CHECK` that inlines the pattern — the pattern is a
//! runtime `Config` value, not a schema constant.

use crate::hash::Hash;
use crate::record::{Rating, Record};
use crate::timefmt;
use crate::{ImgcatError, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::path::Path;
use uuid::Uuid;

/// Exact-match filter fields accepted by `QueryEngine::query` (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Author,
    Caption,
    Source,
    Rating,
}

impl Field {
    fn column(self) -> &'static str {
        match self {
            Field::Author => "author",
            Field::Caption => "caption",
            Field::Source => "source",
            Field::Rating => "rating",
        }
    }
}

/// Bounds completion-style result sets (spec §2 supplement, mirroring the
/// original's shell-completion helpers).
const COMPLETION_LIMIT: usize = 25;

pub struct Catalog {
    conn: Mutex<Connection>,
    hash_bits: usize,
}

impl Catalog {
    /// Opens (creating if absent) the catalog database at `path`, registers
    /// the `tag_matches` predicate from `tag_regex`, and ensures the schema
    /// exists.
    pub fn open(path: &Path, tag_regex: &str, hash_bits: usize) -> Result<Self> {
        let conn = Connection::open(path)?;
        register_tag_matches(&conn, tag_regex)?;
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            CREATE TABLE IF NOT EXISTS Record (
                uid TEXT PRIMARY KEY,
                last_updated TEXT NOT NULL,
                hash TEXT NOT NULL,
                caption TEXT,
                author TEXT,
                source TEXT,
                group_id TEXT,
                date TEXT NOT NULL,
                rating TEXT,
                source_other TEXT NOT NULL DEFAULT '[]',
                source_via TEXT NOT NULL DEFAULT '[]'
            );
            CREATE INDEX IF NOT EXISTS idx_record_hash ON Record(hash);
            CREATE INDEX IF NOT EXISTS idx_record_last_updated ON Record(last_updated);
            CREATE TABLE IF NOT EXISTS Record_Keywords (
                uid TEXT NOT NULL REFERENCES Record(uid) ON DELETE CASCADE,
                keyword TEXT NOT NULL CHECK (tag_matches(keyword)),
                PRIMARY KEY (uid, keyword)
            );
            CREATE TABLE IF NOT EXISTS Record_Collections (
                uid TEXT NOT NULL REFERENCES Record(uid) ON DELETE CASCADE,
                collection TEXT NOT NULL CHECK (tag_matches(collection)),
                PRIMARY KEY (uid, collection)
            );
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            hash_bits,
        })
    }

    /// Opens an in-memory catalog, used by tests and by in-process mode
    /// before a real cache folder is available.
    #[cfg(test)]
    pub(crate) fn open_in_memory(tag_regex: &str, hash_bits: usize) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        register_tag_matches(&conn, tag_regex)?;
        conn.execute_batch(
            "
            CREATE TABLE Record (
                uid TEXT PRIMARY KEY, last_updated TEXT NOT NULL, hash TEXT NOT NULL,
                caption TEXT, author TEXT, source TEXT, group_id TEXT, date TEXT NOT NULL,
                rating TEXT, source_other TEXT NOT NULL DEFAULT '[]', source_via TEXT NOT NULL DEFAULT '[]'
            );
            CREATE TABLE Record_Keywords (
                uid TEXT NOT NULL REFERENCES Record(uid) ON DELETE CASCADE,
                keyword TEXT NOT NULL CHECK (tag_matches(keyword)),
                PRIMARY KEY (uid, keyword)
            );
            CREATE TABLE Record_Collections (
                uid TEXT NOT NULL REFERENCES Record(uid) ON DELETE CASCADE,
                collection TEXT NOT NULL CHECK (tag_matches(collection)),
                PRIMARY KEY (uid, collection)
            );
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            hash_bits,
        })
    }

    /// Fetches one record, reconstructing `authors` from `author:*` keyword
    /// rows and `keywords`/`collections` from their join tables.
    pub fn get(&self, uid: &Uuid) -> Result<Option<Record>> {
        let conn = self.conn.lock();
        self.get_locked(&conn, uid)
    }

    fn get_locked(&self, conn: &Connection, uid: &Uuid) -> Result<Option<Record>> {
        let row = conn
            .query_row(
                "SELECT last_updated, hash, caption, source, group_id, date, rating, source_other, source_via
                 FROM Record WHERE uid = ?1",
                params![uid.simple().to_string()],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, Option<String>>(2)?,
                        r.get::<_, Option<String>>(3)?,
                        r.get::<_, Option<String>>(4)?,
                        r.get::<_, String>(5)?,
                        r.get::<_, Option<String>>(6)?,
                        r.get::<_, String>(7)?,
                        r.get::<_, String>(8)?,
                    ))
                },
            )
            .optional()?;
        let Some((last_updated, hash, caption, source, group_id, date, rating, source_other, source_via)) = row
        else {
            return Ok(None);
        };

        let keywords = self.keywords_for(conn, uid)?;
        let collections = self.collections_for(conn, uid)?;
        let authors: Vec<String> = keywords
            .iter()
            .filter_map(|k| k.strip_prefix("author:").map(str::to_string))
            .collect();

        Ok(Some(Record {
            uid: *uid,
            hash: Hash::from_hex(&hash, self.hash_bits)?,
            caption,
            authors: if authors.is_empty() { None } else { Some(authors) },
            keywords,
            source,
            group_id: group_id.map(|g| parse_uuid(&g)).transpose()?,
            collections,
            rating: rating.and_then(|r| r.chars().next().and_then(Rating::from_code)),
            date: timefmt::from_catalog_string(&date)?,
            last_updated: timefmt::from_catalog_string(&last_updated)?,
            source_other: serde_json::from_str(&source_other)?,
            source_via: serde_json::from_str(&source_via)?,
        }))
    }

    fn keywords_for(&self, conn: &Connection, uid: &Uuid) -> Result<BTreeSet<String>> {
        let mut stmt = conn.prepare("SELECT keyword FROM Record_Keywords WHERE uid = ?1")?;
        let rows = stmt
            .query_map(params![uid.simple().to_string()], |r| r.get::<_, String>(0))?
            .collect::<std::result::Result<BTreeSet<_>, _>>()?;
        Ok(rows)
    }

    fn collections_for(&self, conn: &Connection, uid: &Uuid) -> Result<BTreeSet<String>> {
        let mut stmt = conn.prepare("SELECT collection FROM Record_Collections WHERE uid = ?1")?;
        let rows = stmt
            .query_map(params![uid.simple().to_string()], |r| r.get::<_, String>(0))?
            .collect::<std::result::Result<BTreeSet<_>, _>>()?;
        Ok(rows)
    }

    /// Inserts a new record. Fails with [`ImgcatError::UidConflict`] if the
    /// uid already exists.
    pub fn insert(&self, record: &Record) -> Result<()> {
        let conn = self.conn.lock();
        if self.get_locked(&conn, &record.uid)?.is_some() {
            return Err(ImgcatError::UidConflict {
                message: format!("uid {} already present", record.uid),
            });
        }
        self.write_record_locked(&conn, record)
    }

    /// Overwrites an existing record's fields and bumps `last_updated` to
    /// `ts`. Fails with [`ImgcatError::NoSuchUid`] if absent.
    pub fn update(&self, record: &Record, ts: time::OffsetDateTime) -> Result<()> {
        let conn = self.conn.lock();
        if self.get_locked(&conn, &record.uid)?.is_none() {
            return Err(ImgcatError::NoSuchUid {
                message: format!("uid {} not present", record.uid),
            });
        }
        let mut updated = record.clone();
        updated.last_updated = ts;
        self.write_record_locked(&conn, &updated)
    }

    fn write_record_locked(&self, conn: &Connection, record: &Record) -> Result<()> {
        let uid = record.uid.simple().to_string();
        conn.execute(
            "INSERT OR REPLACE INTO Record
             (uid, last_updated, hash, caption, author, source, group_id, date, rating, source_other, source_via)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                uid,
                timefmt::to_catalog_string(record.last_updated),
                record.hash.to_hex(),
                record.caption,
                record.author(),
                record.source,
                record.group_id.map(|g| g.simple().to_string()),
                timefmt::to_catalog_string(record.date),
                record.rating.map(|r| r.code().to_string()),
                serde_json::to_string(&record.source_other)?,
                serde_json::to_string(&record.source_via)?,
            ],
        )?;
        conn.execute("DELETE FROM Record_Keywords WHERE uid = ?1", params![uid])?;
        for k in &record.keywords {
            conn.execute(
                "INSERT INTO Record_Keywords (uid, keyword) VALUES (?1, ?2)",
                params![uid, k],
            )
            .map_err(|e| keyword_error(e, k))?;
        }
        conn.execute("DELETE FROM Record_Collections WHERE uid = ?1", params![uid])?;
        for c in &record.collections {
            conn.execute(
                "INSERT INTO Record_Collections (uid, collection) VALUES (?1, ?2)",
                params![uid, c],
            )
            .map_err(|e| keyword_error(e, c))?;
        }
        Ok(())
    }

    /// Deletes a record and its keyword/collection rows. Fails with
    /// [`ImgcatError::NoSuchUid`] if absent.
    pub fn delete(&self, uid: &Uuid) -> Result<()> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "DELETE FROM Record WHERE uid = ?1",
            params![uid.simple().to_string()],
        )?;
        if n == 0 {
            return Err(ImgcatError::NoSuchUid {
                message: format!("uid {uid} not present"),
            });
        }
        Ok(())
    }

    /// All uids in ascending order.
    pub fn list_all_uids(&self) -> Result<Vec<Uuid>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT uid FROM Record ORDER BY uid")?;
        let rows = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.iter().map(|s| parse_uuid(s)).collect()
    }

    /// All uids in a freshly-shuffled order (spec §4.5 `random=true`).
    pub fn list_all_uids_random(&self) -> Result<Vec<Uuid>> {
        use rand::seq::SliceRandom;
        let mut uids = self.list_all_uids()?;
        uids.shuffle(&mut rand::thread_rng());
        Ok(uids)
    }

    /// Up to 25 uids whose textual form starts with `prefix`.
    pub fn complete_uid_prefix(&self, prefix: &str) -> Result<Vec<Uuid>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT uid FROM Record WHERE uid LIKE ?1 || '%' ORDER BY uid LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![prefix, COMPLETION_LIMIT as i64], |r| r.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.iter().map(|s| parse_uuid(s)).collect()
    }

    /// Up to 25 distinct keywords starting with `prefix`.
    pub fn tag_complete(&self, prefix: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT keyword FROM Record_Keywords WHERE keyword LIKE ?1 || '%'
             ORDER BY keyword LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![prefix, COMPLETION_LIMIT as i64], |r| r.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Uids tagged with `k`.
    pub fn uids_with_keyword(&self, k: &str) -> Result<BTreeSet<Uuid>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT uid FROM Record_Keywords WHERE keyword = ?1")?;
        let rows = stmt
            .query_map(params![k], |r| r.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.iter().map(|s| parse_uuid(s)).collect()
    }

    /// Uids tagged with every keyword in `ks` (empty slice → empty set).
    pub fn uids_with_keyword_all(&self, ks: &[String]) -> Result<BTreeSet<Uuid>> {
        let mut iter = ks.iter();
        let Some(first) = iter.next() else {
            return Ok(BTreeSet::new());
        };
        let mut acc = self.uids_with_keyword(first)?;
        for k in iter {
            let next = self.uids_with_keyword(k)?;
            acc.retain(|u| next.contains(u));
        }
        Ok(acc)
    }

    /// Uids whose `field` column exactly matches `value`. An empty `value`
    /// means "column IS NULL" (spec §4.5).
    pub fn uids_where(&self, field: Field, value: &str) -> Result<BTreeSet<Uuid>> {
        let conn = self.conn.lock();
        let column = field.column();
        let sql = if value.is_empty() {
            format!("SELECT uid FROM Record WHERE {column} IS NULL")
        } else {
            format!("SELECT uid FROM Record WHERE {column} = ?1")
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows: Vec<String> = if value.is_empty() {
            stmt.query_map([], |r| r.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?
        } else {
            stmt.query_map(params![value], |r| r.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?
        };
        rows.iter().map(|s| parse_uuid(s)).collect()
    }

    /// Number of rows sharing `hash` (hash reference counting, spec §4.4).
    pub fn count_with_hash(&self, hash: &Hash) -> Result<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM Record WHERE hash = ?1",
            params![hash.to_hex()],
            |r| r.get(0),
        )?;
        Ok(n as usize)
    }

    /// Every uid sharing `hash`.
    pub fn uids_with_hash(&self, hash: &Hash) -> Result<Vec<Uuid>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT uid FROM Record WHERE hash = ?1 ORDER BY uid")?;
        let rows = stmt
            .query_map(params![hash.to_hex()], |r| r.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.iter().map(|s| parse_uuid(s)).collect()
    }

    /// Groups of uids (size >= 2) that share a hash.
    pub fn find_duplicates(&self) -> Result<Vec<Vec<Uuid>>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT hash FROM Record GROUP BY hash HAVING COUNT(*) > 1 ORDER BY hash",
        )?;
        let hashes: Vec<String> = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let mut groups = Vec::with_capacity(hashes.len());
        for hex in hashes {
            let mut gstmt = conn.prepare("SELECT uid FROM Record WHERE hash = ?1 ORDER BY uid")?;
            let uids: Vec<String> = gstmt
                .query_map(params![hex], |r| r.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            groups.push(uids.iter().map(|s| parse_uuid(s)).collect::<Result<Vec<_>>>()?);
        }
        groups.sort_by_key(|g| std::cmp::Reverse(g.len()));
        Ok(groups)
    }
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| ImgcatError::InternalError {
        message: format!("corrupt uid '{s}' in catalog: {e}"),
    })
}

fn keyword_error(e: rusqlite::Error, keyword: &str) -> ImgcatError {
    if let rusqlite::Error::SqliteFailure(_, Some(msg)) = &e {
        if msg.contains("CHECK") {
            return ImgcatError::InvalidKeyword {
                message: format!("keyword '{keyword}' does not match configured pattern"),
            };
        }
    }
    ImgcatError::from(e)
}

fn register_tag_matches(conn: &Connection, tag_regex: &str) -> Result<()> {
    let re = regex::Regex::new(tag_regex).map_err(|e| ImgcatError::UserError {
        message: format!("invalid tag_regex: {e}"),
    })?;
    conn.create_scalar_function(
        "tag_matches",
        1,
        rusqlite::functions::FunctionFlags::SQLITE_DETERMINISTIC,
        move |ctx| {
            let text: String = ctx.get(0)?;
            Ok(re.is_match(&text))
        },
    )?;
    Ok(())
}
