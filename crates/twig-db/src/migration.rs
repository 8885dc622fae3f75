use rusqlite::Connection;
use tracing::debug;

use crate::error::Result;

struct Migration {
    version: i64,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        sql: include_str!("../migrations/0001_init.sql"),
    },
    Migration {
        version: 2,
        sql: include_str!("../migrations/0002_path_text.sql"),
    },
];

/// Bring the schema up to the latest version. Each migration runs in its own
/// transaction together with the `user_version` bump.
pub(crate) fn apply(conn: &mut Connection) -> Result<()> {
    let mut version = schema_version(conn)?;
    let start = version;

    for migration in MIGRATIONS.iter().filter(|m| m.version > start) {
        let tx = conn.transaction()?;
        tx.execute_batch(migration.sql)?;
        tx.pragma_update(None, "user_version", migration.version)?;
        tx.commit()?;

        debug!(from = version, to = migration.version, "applied schema migration");
        version = migration.version;
    }

    Ok(())
}

pub(crate) fn schema_version(conn: &Connection) -> Result<i64> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

pub(crate) fn latest_version() -> i64 {
    MIGRATIONS.last().map_or(0, |m| m.version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applies_every_migration_once() {
        let mut conn = Connection::open_in_memory().expect("open");
        apply(&mut conn).expect("migrate");
        assert_eq!(schema_version(&conn).expect("version"), latest_version());

        // Re-running is a no-op rather than a duplicate-column error.
        apply(&mut conn).expect("migrate again");
        let columns: i64 = conn
            .query_row(
                "SELECT count(*) FROM pragma_table_info('conversations') WHERE name = 'path_text'",
                [],
                |row| row.get(0),
            )
            .expect("columns");
        assert_eq!(columns, 1);
    }
}
