use crate::cancel::CancelToken;
use crate::config::Config;
use crate::error::{CrcError, DatabaseError, Error, PackageIndexError, RecordError};
use crate::fingerprint::tree_fingerprint;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::fmt;
use std::path::Path;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Running,
    Success,
    Failed,
}

impl BuildStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildStatus::Running => "running",
            BuildStatus::Success => "success",
            BuildStatus::Failed => "failed",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "running" => Some(BuildStatus::Running),
            "success" => Some(BuildStatus::Success),
            "failed" => Some(BuildStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One build attempt. Status mutates at most once, Running -> terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRecord {
    pub uuid: String,
    pub portdir: String,
    pub version: String,
    pub status: BuildStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BuildRecord {
    pub fn running(uuid: String, portdir: &str, version: &str) -> Self {
        Self {
            uuid,
            portdir: portdir.to_string(),
            version: version.to_string(),
            status: BuildStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

fn index_key(portdir: &str, version: &str) -> String {
    format!("{portdir}@{version}")
}

/// Single-file transactional build ledger. One writer at a time; reads go
/// through the same connection, serialized by the mutex.
pub struct BuildDb {
    conn: Mutex<Option<Connection>>,
}

impl BuildDb {
    /// Open (and create, if absent) the database and its three tables.
    pub fn open(path: &Path) -> Result<Self, Error> {
        let conn =
            Connection::open(path).map_err(|err| DatabaseError::new("open", err))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS builds (
                 uuid        TEXT PRIMARY KEY,
                 portdir     TEXT NOT NULL,
                 version     TEXT NOT NULL,
                 status      TEXT NOT NULL,
                 started_at  TEXT NOT NULL,
                 finished_at TEXT
             );
             CREATE TABLE IF NOT EXISTS packages (
                 key  TEXT PRIMARY KEY,
                 uuid TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS crc_index (
                 portdir TEXT PRIMARY KEY,
                 crc     BLOB NOT NULL
             );",
        )
        .map_err(|err| DatabaseError::new("create-tables", err))?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Idempotent; further operations return `ErrDatabaseClosed`.
    pub fn close(&self) {
        if let Ok(mut guard) = self.conn.lock() {
            guard.take();
        }
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| DatabaseError::new("lock", "connection mutex poisoned".to_string()))?;
        let Some(conn) = guard.as_mut() else {
            return Err(Error::DatabaseClosed);
        };
        f(conn)
    }

    /// Upsert into `builds` after validating the record.
    pub fn save_record(&self, rec: &BuildRecord) -> Result<(), Error> {
        if uuid::Uuid::parse_str(&rec.uuid).is_err() {
            return Err(RecordError::new(&rec.uuid, "save", "invalid uuid".to_string()).into());
        }
        if rec.portdir.is_empty() {
            return Err(RecordError::new(&rec.uuid, "save", "empty portdir".to_string()).into());
        }
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO builds
                     (uuid, portdir, version, status, started_at, finished_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    rec.uuid,
                    rec.portdir,
                    rec.version,
                    rec.status.as_str(),
                    rec.started_at.to_rfc3339(),
                    rec.finished_at.map(|t| t.to_rfc3339()),
                ],
            )
            .map_err(|err| DatabaseError::new("save-record", err))?;
            Ok(())
        })
    }

    pub fn get_record(&self, uuid: &str) -> Result<BuildRecord, Error> {
        self.with_conn(|conn| get_record_tx(conn, uuid))
    }

    /// In one transaction: read the record, verify the transition is
    /// Running -> {Success, Failed}, write it back with the end time.
    pub fn update_record_status(
        &self,
        uuid: &str,
        status: BuildStatus,
        end_time: DateTime<Utc>,
    ) -> Result<(), Error> {
        if status == BuildStatus::Running {
            return Err(
                RecordError::new(uuid, "update-status", "running is not terminal".to_string())
                    .into(),
            );
        }
        self.with_conn(|conn| {
            let tx = conn
                .transaction()
                .map_err(|err| DatabaseError::new("begin", err))?;
            let rec = get_record_tx(&tx, uuid)?;
            if rec.status != BuildStatus::Running {
                return Err(RecordError::new(
                    uuid,
                    "update-status",
                    format!("status {} is terminal", rec.status),
                )
                .into());
            }
            tx.execute(
                "UPDATE builds SET status = ?1, finished_at = ?2 WHERE uuid = ?3",
                params![status.as_str(), end_time.to_rfc3339(), uuid],
            )
            .map_err(|err| DatabaseError::new("update-status", err))?;
            tx.commit()
                .map_err(|err| DatabaseError::new("commit", err))?;
            Ok(())
        })
    }

    /// Point `portdir@version` at the UUID of a successful record.
    pub fn update_package_index(
        &self,
        portdir: &str,
        version: &str,
        uuid: &str,
    ) -> Result<(), Error> {
        self.with_conn(|conn| {
            let tx = conn
                .transaction()
                .map_err(|err| DatabaseError::new("begin", err))?;
            let rec = match get_record_tx(&tx, uuid) {
                Ok(rec) => rec,
                Err(Error::RecordNotFound(_)) => {
                    return Err(PackageIndexError::new(
                        portdir,
                        version,
                        "update",
                        format!("record {uuid} does not exist"),
                    )
                    .into());
                }
                Err(err) => return Err(err),
            };
            if rec.status != BuildStatus::Success {
                return Err(PackageIndexError::new(
                    portdir,
                    version,
                    "update",
                    format!("record {uuid} has status {}", rec.status),
                )
                .into());
            }
            tx.execute(
                "INSERT OR REPLACE INTO packages (key, uuid) VALUES (?1, ?2)",
                params![index_key(portdir, version), uuid],
            )
            .map_err(|err| DatabaseError::new("update-index", err))?;
            tx.commit()
                .map_err(|err| DatabaseError::new("commit", err))?;
            Ok(())
        })
    }

    /// The record behind the index entry; with an empty version, the most
    /// recent successful build for the portdir. Orphan entries surface as
    /// package-index validation errors.
    pub fn latest_for(&self, portdir: &str, version: &str) -> Result<BuildRecord, Error> {
        self.with_conn(|conn| {
            let keys: Vec<(String, String)> = if version.is_empty() {
                let prefix = format!("{portdir}@");
                let mut stmt = conn
                    .prepare("SELECT key, uuid FROM packages WHERE key LIKE ?1")
                    .map_err(|err| DatabaseError::new("latest-for", err))?;
                let rows = stmt
                    .query_map(params![format!("{prefix}%")], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                    })
                    .map_err(|err| DatabaseError::new("latest-for", err))?;
                let mut keys: Vec<(String, String)> = rows
                    .collect::<Result<_, _>>()
                    .map_err(|err| DatabaseError::new("latest-for", err))?;
                // LIKE treats `_` as a wildcard; keep exact-prefix hits only.
                keys.retain(|(key, _)| key.starts_with(&prefix));
                keys
            } else {
                let key = index_key(portdir, version);
                let uuid: Option<String> = conn
                    .query_row(
                        "SELECT uuid FROM packages WHERE key = ?1",
                        params![key],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(|err| DatabaseError::new("latest-for", err))?;
                match uuid {
                    Some(uuid) => vec![(key, uuid)],
                    None => Vec::new(),
                }
            };
            if keys.is_empty() {
                return Err(Error::RecordNotFound(index_key(portdir, version)));
            }

            let mut latest: Option<BuildRecord> = None;
            for (key, uuid) in keys {
                let rec = match get_record_tx(conn, &uuid) {
                    Ok(rec) => rec,
                    Err(Error::RecordNotFound(_)) => {
                        return Err(PackageIndexError::new(
                            portdir,
                            version,
                            "latest-for",
                            format!("orphan index entry {key} -> missing record {uuid}"),
                        )
                        .into());
                    }
                    Err(err) => return Err(err),
                };
                if rec.status != BuildStatus::Success {
                    return Err(PackageIndexError::new(
                        portdir,
                        version,
                        "latest-for",
                        format!("index entry {key} points at {} record {uuid}", rec.status),
                    )
                    .into());
                }
                if latest
                    .as_ref()
                    .is_none_or(|best| rec.started_at > best.started_at)
                {
                    latest = Some(rec);
                }
            }
            latest.ok_or_else(|| Error::RecordNotFound(index_key(portdir, version)))
        })
    }

    /// Store the fingerprint recorded by the most recent successful build,
    /// packed big-endian.
    pub fn update_crc(&self, portdir: &str, value: u32) -> Result<(), Error> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO crc_index (portdir, crc) VALUES (?1, ?2)",
                params![portdir, value.to_be_bytes().to_vec()],
            )
            .map_err(|err| DatabaseError::new("update-crc", err))?;
            Ok(())
        })
    }

    /// Missing key is a not-found error; callers treat it as "no prior
    /// build", not a failure.
    pub fn get_crc(&self, portdir: &str) -> Result<u32, Error> {
        self.with_conn(|conn| {
            let blob: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT crc FROM crc_index WHERE portdir = ?1",
                    params![portdir],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|err| DatabaseError::new("get-crc", err))?;
            let Some(blob) = blob else {
                return Err(Error::RecordNotFound(portdir.to_string()));
            };
            let bytes: [u8; 4] = blob.as_slice().try_into().map_err(|_| {
                Error::from(CrcError::new(
                    portdir,
                    "get",
                    format!("stored fingerprint has {} bytes", blob.len()),
                ))
            })?;
            Ok(u32::from_be_bytes(bytes))
        })
    }

    /// True iff there is no stored fingerprint or it differs. Fail-safe:
    /// any database error also answers true so the port builds.
    pub fn needs_build(&self, portdir: &str, current: u32) -> bool {
        match self.get_crc(portdir) {
            Ok(stored) => stored != current,
            Err(_) => true,
        }
    }

    pub fn compute_port_crc(
        &self,
        cfg: &Config,
        portdir: &str,
        cancel: &CancelToken,
    ) -> Result<u32, Error> {
        tree_fingerprint(&cfg.port_path(portdir), cancel)
    }
}

fn get_record_tx(conn: &Connection, uuid: &str) -> Result<BuildRecord, Error> {
    let row: Option<(String, String, String, String, Option<String>)> = conn
        .query_row(
            "SELECT portdir, version, status, started_at, finished_at
               FROM builds WHERE uuid = ?1",
            params![uuid],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            },
        )
        .optional()
        .map_err(|err| DatabaseError::new("get-record", err))?;
    let Some((portdir, version, status, started_at, finished_at)) = row else {
        return Err(Error::RecordNotFound(uuid.to_string()));
    };
    let status = BuildStatus::parse(&status).ok_or_else(|| {
        Error::from(RecordError::new(
            uuid,
            "get",
            format!("unparseable status '{status}'"),
        ))
    })?;
    let started_at = parse_time(uuid, &started_at)?;
    let finished_at = match finished_at {
        Some(raw) => Some(parse_time(uuid, &raw)?),
        None => None,
    };
    Ok(BuildRecord {
        uuid: uuid.to_string(),
        portdir,
        version,
        status,
        started_at,
        finished_at,
    })
}

fn parse_time(uuid: &str, raw: &str) -> Result<DateTime<Utc>, Error> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|err| {
            RecordError::new(uuid, "get", format!("unparseable timestamp '{raw}': {err}")).into()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn open_db(dir: &tempfile::TempDir) -> BuildDb {
        BuildDb::open(&dir.path().join("builds.db")).expect("open db")
    }

    fn new_uuid() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    #[test]
    fn save_then_get_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(&dir);
        let rec = BuildRecord::running(new_uuid(), "print/indexinfo", "0.3.1");
        db.save_record(&rec).expect("save");
        let loaded = db.get_record(&rec.uuid).expect("get");
        assert_eq!(loaded, rec);
    }

    #[test]
    fn save_validates_uuid_and_portdir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(&dir);
        let rec = BuildRecord::running("not-a-uuid".to_string(), "print/indexinfo", "0.3.1");
        assert!(matches!(db.save_record(&rec), Err(Error::Record(_))));
        let rec = BuildRecord::running(new_uuid(), "", "0.3.1");
        assert!(matches!(db.save_record(&rec), Err(Error::Record(_))));
    }

    #[test]
    fn missing_record_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(&dir);
        assert!(matches!(
            db.get_record(&new_uuid()),
            Err(Error::RecordNotFound(_))
        ));
    }

    #[test]
    fn status_transitions_are_running_to_terminal_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(&dir);
        let rec = BuildRecord::running(new_uuid(), "print/indexinfo", "0.3.1");
        db.save_record(&rec).expect("save");

        assert!(matches!(
            db.update_record_status(&rec.uuid, BuildStatus::Running, Utc::now()),
            Err(Error::Record(_))
        ));
        db.update_record_status(&rec.uuid, BuildStatus::Success, Utc::now())
            .expect("running -> success");
        assert!(matches!(
            db.update_record_status(&rec.uuid, BuildStatus::Failed, Utc::now()),
            Err(Error::Record(_)),
        ));
        let loaded = db.get_record(&rec.uuid).expect("get");
        assert_eq!(loaded.status, BuildStatus::Success);
        assert!(loaded.finished_at.is_some());
    }

    #[test]
    fn package_index_rejects_missing_and_non_success_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(&dir);
        let rec = BuildRecord::running(new_uuid(), "print/indexinfo", "0.3.1");
        db.save_record(&rec).expect("save");

        assert!(matches!(
            db.update_package_index("print/indexinfo", "0.3.1", &new_uuid()),
            Err(Error::PackageIndex(_))
        ));
        assert!(matches!(
            db.update_package_index("print/indexinfo", "0.3.1", &rec.uuid),
            Err(Error::PackageIndex(_))
        ));

        db.update_record_status(&rec.uuid, BuildStatus::Success, Utc::now())
            .expect("finish");
        db.update_package_index("print/indexinfo", "0.3.1", &rec.uuid)
            .expect("index success record");
        let latest = db.latest_for("print/indexinfo", "0.3.1").expect("latest");
        assert_eq!(latest.uuid, rec.uuid);
    }

    #[test]
    fn latest_for_empty_version_scans_prefix() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(&dir);

        let mut old = BuildRecord::running(new_uuid(), "misc/help2man", "1.49.2");
        old.started_at = Utc::now() - Duration::hours(2);
        db.save_record(&old).expect("save old");
        db.update_record_status(&old.uuid, BuildStatus::Success, Utc::now())
            .expect("finish old");
        db.update_package_index("misc/help2man", "1.49.2", &old.uuid)
            .expect("index old");

        let new = BuildRecord::running(new_uuid(), "misc/help2man", "1.49.3");
        db.save_record(&new).expect("save new");
        db.update_record_status(&new.uuid, BuildStatus::Success, Utc::now())
            .expect("finish new");
        db.update_package_index("misc/help2man", "1.49.3", &new.uuid)
            .expect("index new");

        let latest = db.latest_for("misc/help2man", "").expect("latest");
        assert_eq!(latest.uuid, new.uuid);
        assert_eq!(latest.version, "1.49.3");

        assert!(matches!(
            db.latest_for("misc/other", ""),
            Err(Error::RecordNotFound(_))
        ));
    }

    #[test]
    fn orphan_index_entries_are_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(&dir);
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO packages (key, uuid) VALUES (?1, ?2)",
                params!["misc/help2man@1.49.3", new_uuid()],
            )
            .map_err(|err| DatabaseError::new("seed", err))?;
            Ok(())
        })
        .expect("seed orphan");
        assert!(matches!(
            db.latest_for("misc/help2man", "1.49.3"),
            Err(Error::PackageIndex(_))
        ));
    }

    #[test]
    fn crc_round_trip_and_needs_build() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(&dir);
        assert!(matches!(
            db.get_crc("print/indexinfo"),
            Err(Error::RecordNotFound(_))
        ));
        assert!(db.needs_build("print/indexinfo", 0xDEAD_BEEF));

        db.update_crc("print/indexinfo", 0xDEAD_BEEF).expect("crc");
        assert_eq!(db.get_crc("print/indexinfo").expect("get"), 0xDEAD_BEEF);
        assert!(!db.needs_build("print/indexinfo", 0xDEAD_BEEF));
        assert!(db.needs_build("print/indexinfo", 0xDEAD_BEEE));
    }

    #[test]
    fn reopen_is_idempotent_and_close_is_typed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("builds.db");
        let rec = BuildRecord::running(new_uuid(), "print/indexinfo", "0.3.1");
        {
            let db = BuildDb::open(&path).expect("first open");
            db.save_record(&rec).expect("save");
            db.close();
            db.close();
            assert!(matches!(
                db.get_record(&rec.uuid),
                Err(Error::DatabaseClosed)
            ));
        }
        let db = BuildDb::open(&path).expect("second open");
        assert_eq!(db.get_record(&rec.uuid).expect("survives reopen"), rec);
    }
}
