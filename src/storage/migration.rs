use anyhow::{bail, Result};
use rusqlite::{params, Connection};

use super::database::Database;
use super::schema::{CREATE_MIGRATIONS_TABLE_SQL, MIGRATIONS, NUM_MIGRATIONS};

/// Highest applied migration, or -1 for a fresh database.
pub fn last_migration(conn: &Connection) -> Result<i64> {
    conn.execute_batch(CREATE_MIGRATIONS_TABLE_SQL)?;
    let last: Option<i64> =
        conn.query_row("SELECT MAX(migration_id) FROM migrations", [], |row| row.get(0))?;
    Ok(last.unwrap_or(-1))
}

/// Bring the schema up to [`NUM_MIGRATIONS`]. Safe to re-run.
pub fn run_migrations(db: &Database) -> Result<()> {
    let mut conn = db.conn();
    let last = last_migration(&conn)?;

    if last > NUM_MIGRATIONS {
        bail!("the database you're connected to is newer than this tool supports");
    }
    if last == 0 {
        bail!(
            "migration from broker versions <= 2.0 is no longer supported, upgrade using a v3.x broker then try again"
        );
    }
    if last == NUM_MIGRATIONS {
        tracing::debug!(migration = last, "database schema is up to date");
        return Ok(());
    }

    for (number, sql) in MIGRATIONS.iter().enumerate().skip((last + 1) as usize) {
        tracing::info!(migration = number, "applying database migration");
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO migrations (migration_id, created_at) VALUES (?1, ?2)",
            params![number as i64, Database::now()],
        )?;
        tx.commit()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(db: &Database, n: i64) {
        db.conn()
            .execute(
                "INSERT INTO migrations (migration_id, created_at) VALUES (?1, 'now')",
                params![n],
            )
            .unwrap();
    }

    #[test]
    fn fresh_database_migrates_to_latest() {
        let db = Database::open_memory().unwrap();
        assert_eq!(last_migration(&db.conn()).unwrap(), -1);
        run_migrations(&db).unwrap();
        assert_eq!(last_migration(&db.conn()).unwrap(), NUM_MIGRATIONS);
    }

    #[test]
    fn rerun_is_noop() {
        let db = Database::open_memory().unwrap();
        run_migrations(&db).unwrap();
        run_migrations(&db).unwrap();
        let rows: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, NUM_MIGRATIONS + 1);
    }

    #[test]
    fn newer_database_is_refused() {
        let db = Database::open_memory().unwrap();
        last_migration(&db.conn()).unwrap();
        record(&db, NUM_MIGRATIONS + 1);
        let err = run_migrations(&db).unwrap_err();
        assert_eq!(err.to_string(), "the database you're connected to is newer than this tool supports");
    }

    #[test]
    fn ancient_database_is_refused() {
        let db = Database::open_memory().unwrap();
        last_migration(&db.conn()).unwrap();
        record(&db, 0);
        let err = run_migrations(&db).unwrap_err();
        assert!(err.to_string().contains("no longer supported"));
    }

    #[test]
    fn partial_database_resumes() {
        let db = Database::open_memory().unwrap();
        {
            let conn = db.conn();
            last_migration(&conn).unwrap();
            for sql in &MIGRATIONS[..3] {
                conn.execute_batch(sql).unwrap();
            }
        }
        for n in 0..3 {
            record(&db, n);
        }
        run_migrations(&db).unwrap();
        assert_eq!(last_migration(&db.conn()).unwrap(), NUM_MIGRATIONS);
    }
}
