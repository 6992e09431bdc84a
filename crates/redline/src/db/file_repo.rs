//! File repository: persistence for the `files` table.

use rusqlite::{params, Row};

use super::{Database, DatabaseError};

/// A raw file row from the database. `path` is relative to the storage root.
#[derive(Debug, Clone, PartialEq)]
pub struct FileRow {
    pub id: String,
    pub kind: String,
    pub path: String,
    pub original_name: String,
    pub mime_type: Option<String>,
    pub size_bytes: u64,
    pub checksum: String,
    pub created_at: String,
    pub expires_at: String,
}

impl FileRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            kind: row.get("kind")?,
            path: row.get("path")?,
            original_name: row.get("original_name")?,
            mime_type: row.get("mime_type")?,
            size_bytes: row.get::<_, i64>("size_bytes")? as u64,
            checksum: row.get("checksum")?,
            created_at: row.get("created_at")?,
            expires_at: row.get("expires_at")?,
        })
    }
}

pub fn insert(db: &Database, file: &FileRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO files (id, kind, path, original_name, mime_type, size_bytes, checksum,
             created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                file.id,
                file.kind,
                file.path,
                file.original_name,
                file.mime_type,
                file.size_bytes as i64,
                file.checksum,
                file.created_at,
                file.expires_at,
            ],
        )?;
        Ok(())
    })
}

pub fn find_by_id(db: &Database, id: &str) -> Result<Option<FileRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM files WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], FileRow::from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

/// Returns files whose `expires_at` is at or before `now`.
pub fn find_expired(db: &Database, now: &str) -> Result<Vec<FileRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT * FROM files WHERE expires_at <= ?1 ORDER BY expires_at ASC")?;
        let rows = stmt
            .query_map(params![now], FileRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Deletes a file row. Returns whether a row existed.
pub fn delete(db: &Database, id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute("DELETE FROM files WHERE id = ?1", params![id])?;
        Ok(changed == 1)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        Database::open_in_memory().expect("Failed to create test database")
    }

    fn sample_file(id: &str, expires_at: &str) -> FileRow {
        FileRow {
            id: id.to_string(),
            kind: "upload".to_string(),
            path: format!("upload/{}", id),
            original_name: "report.docx".to_string(),
            mime_type: Some(
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
                    .to_string(),
            ),
            size_bytes: 1024,
            checksum: "ab".repeat(32),
            created_at: "2026-01-01T00:00:00.000Z".to_string(),
            expires_at: expires_at.to_string(),
        }
    }

    #[test]
    fn test_insert_and_find() {
        let db = test_db();
        let file = sample_file("f1", "2026-01-02T00:00:00.000Z");
        insert(&db, &file).unwrap();

        assert_eq!(find_by_id(&db, "f1").unwrap(), Some(file));
        assert!(find_by_id(&db, "f2").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let db = test_db();
        let file = sample_file("dup", "2026-01-02T00:00:00.000Z");
        insert(&db, &file).unwrap();
        assert!(insert(&db, &file).is_err());
    }

    #[test]
    fn test_find_expired_is_inclusive() {
        let db = test_db();
        insert(&db, &sample_file("old", "2026-01-01T00:00:00.000Z")).unwrap();
        insert(&db, &sample_file("edge", "2026-01-02T00:00:00.000Z")).unwrap();
        insert(&db, &sample_file("fresh", "2026-01-03T00:00:00.000Z")).unwrap();

        let expired: Vec<String> = find_expired(&db, "2026-01-02T00:00:00.000Z")
            .unwrap()
            .into_iter()
            .map(|f| f.id)
            .collect();
        assert_eq!(expired, vec!["old", "edge"]);
    }

    #[test]
    fn test_delete() {
        let db = test_db();
        insert(&db, &sample_file("del", "2026-01-02T00:00:00.000Z")).unwrap();
        assert!(delete(&db, "del").unwrap());
        assert!(!delete(&db, "del").unwrap());
        assert!(find_by_id(&db, "del").unwrap().is_none());
    }
}
