//! Job repository: persistence for the `jobs` table.

use rusqlite::{params, Row};

use super::{Database, DatabaseError};

/// A raw job row from the database.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRow {
    pub id: String,
    pub file_id: String,
    pub status: String,
    pub stage: Option<String>,
    pub stage_progress: u8,
    pub sequence: u64,
    pub message: Option<String>,
    pub error_message: Option<String>,
    pub result_json: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub updated_at: String,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            file_id: row.get("file_id")?,
            status: row.get("status")?,
            stage: row.get("stage")?,
            stage_progress: row.get("stage_progress")?,
            sequence: row.get::<_, i64>("sequence")? as u64,
            message: row.get("message")?,
            error_message: row.get("error_message")?,
            result_json: row.get("result_json")?,
            created_at: row.get("created_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Inserts a new job row.
pub fn insert(db: &Database, job: &JobRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO jobs (id, file_id, status, stage, stage_progress, sequence, message,
             error_message, result_json, created_at, started_at, completed_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                job.id,
                job.file_id,
                job.status,
                job.stage,
                job.stage_progress,
                job.sequence as i64,
                job.message,
                job.error_message,
                job.result_json,
                job.created_at,
                job.started_at,
                job.completed_at,
                job.updated_at,
            ],
        )?;
        Ok(())
    })
}

/// Updates an existing job row. All fields except `id`, `file_id` and
/// `created_at` are overwritten. Returns whether a row was touched.
pub fn update(db: &Database, job: &JobRow) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET status=?2, stage=?3, stage_progress=?4, sequence=?5, message=?6,
             error_message=?7, result_json=?8, started_at=?9, completed_at=?10, updated_at=?11
             WHERE id=?1",
            params![
                job.id,
                job.status,
                job.stage,
                job.stage_progress,
                job.sequence as i64,
                job.message,
                job.error_message,
                job.result_json,
                job.started_at,
                job.completed_at,
                job.updated_at,
            ],
        )?;
        Ok(changed == 1)
    })
}

/// Finds a job by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM jobs WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], JobRow::from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

/// Returns every job in creation order.
pub fn list_all(db: &Database) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM jobs ORDER BY created_at ASC, rowid ASC")?;
        let rows = stmt
            .query_map([], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Deletes terminal jobs whose input file row no longer exists and returns
/// their ids.
pub fn delete_terminal_orphans(db: &Database) -> Result<Vec<String>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT id FROM jobs
             WHERE status IN ('completed', 'failed')
             AND file_id NOT IN (SELECT id FROM files)",
        )?;
        let ids = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        for id in &ids {
            conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
        }
        Ok(ids)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        Database::open_in_memory().expect("Failed to create test database")
    }

    fn sample_job(id: &str) -> JobRow {
        JobRow {
            id: id.to_string(),
            file_id: "file-1".to_string(),
            status: "pending".to_string(),
            stage: None,
            stage_progress: 0,
            sequence: 0,
            message: None,
            error_message: None,
            result_json: None,
            created_at: "2026-01-01T00:00:00.000Z".to_string(),
            started_at: None,
            completed_at: None,
            updated_at: "2026-01-01T00:00:00.000Z".to_string(),
        }
    }

    fn insert_file(db: &Database, id: &str) {
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO files (id, kind, path, original_name, size_bytes, checksum, created_at, expires_at)
                 VALUES (?1, 'upload', ?1, 'a.txt', 1, 'x', '2026-01-01', '2026-01-02')",
                params![id],
            )?;
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_insert_and_find() {
        let db = test_db();
        insert(&db, &sample_job("job-1")).unwrap();

        let found = find_by_id(&db, "job-1").unwrap().unwrap();
        assert_eq!(found, sample_job("job-1"));
    }

    #[test]
    fn test_find_nonexistent() {
        let db = test_db();
        assert!(find_by_id(&db, "nonexistent").unwrap().is_none());
    }

    #[test]
    fn test_update() {
        let db = test_db();
        let mut job = sample_job("job-2");
        insert(&db, &job).unwrap();

        job.status = "processing".to_string();
        job.stage = Some("analyzing".to_string());
        job.stage_progress = 40;
        job.sequence = 7;
        job.started_at = Some("2026-01-01T00:00:01.000Z".to_string());
        assert!(update(&db, &job).unwrap());

        let found = find_by_id(&db, "job-2").unwrap().unwrap();
        assert_eq!(found.status, "processing");
        assert_eq!(found.stage.as_deref(), Some("analyzing"));
        assert_eq!(found.stage_progress, 40);
        assert_eq!(found.sequence, 7);
    }

    #[test]
    fn test_update_missing_row() {
        let db = test_db();
        assert!(!update(&db, &sample_job("ghost")).unwrap());
    }

    #[test]
    fn test_list_all_in_creation_order() {
        let db = test_db();
        let mut late = sample_job("late");
        late.created_at = "2026-01-03T00:00:00.000Z".to_string();
        let mut early = sample_job("early");
        early.created_at = "2026-01-01T00:00:00.000Z".to_string();
        let mut tie = sample_job("tie");
        tie.created_at = "2026-01-01T00:00:00.000Z".to_string();
        insert(&db, &late).unwrap();
        insert(&db, &early).unwrap();
        insert(&db, &tie).unwrap();

        let ids: Vec<String> = list_all(&db).unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec!["early", "tie", "late"]);
    }

    #[test]
    fn test_delete_terminal_orphans() {
        let db = test_db();
        insert_file(&db, "kept-file");

        let mut orphan_done = sample_job("orphan-done");
        orphan_done.file_id = "gone".to_string();
        orphan_done.status = "completed".to_string();
        insert(&db, &orphan_done).unwrap();

        let mut orphan_pending = sample_job("orphan-pending");
        orphan_pending.file_id = "gone".to_string();
        insert(&db, &orphan_pending).unwrap();

        let mut live_done = sample_job("live-done");
        live_done.file_id = "kept-file".to_string();
        live_done.status = "failed".to_string();
        insert(&db, &live_done).unwrap();

        let purged = delete_terminal_orphans(&db).unwrap();
        assert_eq!(purged, vec!["orphan-done".to_string()]);
        assert!(find_by_id(&db, "orphan-done").unwrap().is_none());
        assert!(find_by_id(&db, "orphan-pending").unwrap().is_some());
        assert!(find_by_id(&db, "live-done").unwrap().is_some());
    }
}
