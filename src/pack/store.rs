//! SQLite-backed package store.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};

use crate::backend::Db;
use crate::errors::{EngineError, Result};
use crate::pack::{Envelope, Locator, PackageOptions};

/// Content-addressed package store sharing the engine database.
#[derive(Clone)]
pub struct PackageService {
    db: Db,
}

impl PackageService {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Insert a package. A different blob under an existing locator is
    /// `already_exists`; the same blob converges silently, and
    /// `opts.upsert` replaces unconditionally.
    pub fn create_package(&self, locator: &Locator, data: &[u8], opts: PackageOptions) -> Result<Envelope> {
        let digest = digest_of(data);
        let conn = self.db.lock();
        conn.execute(
            "INSERT OR IGNORE INTO blobs (digest, data) VALUES (?1, ?2)",
            params![digest, data],
        )?;

        let existing: Option<String> = conn
            .query_row(
                "SELECT digest FROM packages WHERE repository = ?1 AND name = ?2 AND version = ?3",
                params![locator.repository, locator.name, locator.version],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(existing_digest) = existing {
            if !opts.upsert && existing_digest != digest {
                return Err(EngineError::already_exists(format!("package {locator}")));
            }
            conn.execute(
                "UPDATE packages SET digest = ?4, size = ?5, encrypted = ?6, created = ?7
                 WHERE repository = ?1 AND name = ?2 AND version = ?3",
                params![
                    locator.repository,
                    locator.name,
                    locator.version,
                    digest,
                    data.len() as i64,
                    opts.encrypted,
                    Utc::now().to_rfc3339()
                ],
            )?;
        } else {
            conn.execute(
                "INSERT INTO packages (repository, name, version, digest, size, encrypted, created)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    locator.repository,
                    locator.name,
                    locator.version,
                    digest,
                    data.len() as i64,
                    opts.encrypted,
                    Utc::now().to_rfc3339()
                ],
            )?;
        }
        drop(conn);
        self.read_envelope(locator)
    }

    /// Idempotent write: `already_exists` is success.
    pub fn upsert_package(&self, locator: &Locator, data: &[u8], encrypted: bool) -> Result<Envelope> {
        self.create_package(
            locator,
            data,
            PackageOptions {
                encrypted,
                upsert: true,
            },
        )
    }

    pub fn read_envelope(&self, locator: &Locator) -> Result<Envelope> {
        let conn = self.db.lock();
        let row: Option<(String, i64, bool, String)> = conn
            .query_row(
                "SELECT digest, size, encrypted, created FROM packages
                 WHERE repository = ?1 AND name = ?2 AND version = ?3",
                params![locator.repository, locator.name, locator.version],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        match row {
            Some((digest, size, encrypted, created)) => Ok(Envelope {
                locator: locator.clone(),
                digest,
                size: size as u64,
                encrypted,
                created: chrono::DateTime::parse_from_rfc3339(&created)
                    .map_err(|e| EngineError::bad_parameter(format!("bad timestamp: {e}")))?
                    .with_timezone(&Utc),
            }),
            None => Err(EngineError::not_found(format!("package {locator}"))),
        }
    }

    pub fn read_package(&self, locator: &Locator) -> Result<(Envelope, Vec<u8>)> {
        let envelope = self.read_envelope(locator)?;
        let conn = self.db.lock();
        let data: Option<Vec<u8>> = conn
            .query_row(
                "SELECT data FROM blobs WHERE digest = ?1",
                params![envelope.digest],
                |row| row.get(0),
            )
            .optional()?;
        match data {
            Some(data) => Ok((envelope, data)),
            None => Err(EngineError::not_found(format!("blob for {locator}"))),
        }
    }

    /// List envelopes in a repository, newest locator order.
    pub fn list_repository(&self, repository: &str) -> Result<Vec<Envelope>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT name, version, digest, size, encrypted, created FROM packages
             WHERE repository = ?1 ORDER BY name, version",
        )?;
        let rows = stmt.query_map(params![repository], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, bool>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;
        let mut envelopes = Vec::new();
        for row in rows {
            let (name, version, digest, size, encrypted, created) = row?;
            envelopes.push(Envelope {
                locator: Locator::new(repository, &name, &version),
                digest,
                size: size as u64,
                encrypted,
                created: chrono::DateTime::parse_from_rfc3339(&created)
                    .map_err(|e| EngineError::bad_parameter(format!("bad timestamp: {e}")))?
                    .with_timezone(&Utc),
            });
        }
        Ok(envelopes)
    }

    /// Whether any package in the repository is encrypted. Drives the
    /// decrypt-phase decision in the plan builder.
    pub fn repository_has_encrypted(&self, repository: &str) -> Result<bool> {
        let count: i64 = self.db.lock().query_row(
            "SELECT COUNT(*) FROM packages WHERE repository = ?1 AND encrypted = 1",
            params![repository],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

fn digest_of(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> PackageService {
        PackageService::new(Db::in_memory().unwrap())
    }

    fn locator() -> Locator {
        Locator::new("gravitational.io", "planet", "7.0.12")
    }

    #[test]
    fn create_then_read_roundtrips() {
        let service = service();
        let envelope = service
            .create_package(&locator(), b"blob-bytes", PackageOptions::default())
            .unwrap();
        assert_eq!(envelope.size, 10);
        assert!(!envelope.encrypted);

        let (read, data) = service.read_package(&locator()).unwrap();
        assert_eq!(read.digest, envelope.digest);
        assert_eq!(data, b"blob-bytes");
    }

    #[test]
    fn conflicting_create_is_already_exists() {
        let service = service();
        service
            .create_package(&locator(), b"one", PackageOptions::default())
            .unwrap();
        let err = service
            .create_package(&locator(), b"two", PackageOptions::default())
            .unwrap_err();
        assert!(err.is_already_exists());

        // identical content converges
        service
            .create_package(&locator(), b"one", PackageOptions::default())
            .unwrap();

        // upsert replaces
        let envelope = service.upsert_package(&locator(), b"two", false).unwrap();
        let (_, data) = service.read_package(&locator()).unwrap();
        assert_eq!(data, b"two");
        assert_eq!(envelope.digest, digest_of(b"two"));
    }

    #[test]
    fn encrypted_scan_covers_repository() {
        let service = service();
        service
            .create_package(&locator(), b"plain", PackageOptions::default())
            .unwrap();
        assert!(!service.repository_has_encrypted("gravitational.io").unwrap());

        service
            .create_package(
                &Locator::new("gravitational.io", "app", "1.0.0"),
                b"secret",
                PackageOptions {
                    encrypted: true,
                    upsert: false,
                },
            )
            .unwrap();
        assert!(service.repository_has_encrypted("gravitational.io").unwrap());
        assert!(!service.repository_has_encrypted("other.io").unwrap());
    }

    #[test]
    fn missing_package_is_not_found() {
        let service = service();
        assert!(service.read_envelope(&locator()).unwrap_err().is_not_found());
    }
}
