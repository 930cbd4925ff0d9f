use rusqlite::Connection;

/// Shared connection setup for every store the crate opens. WAL keeps
/// concurrent runs (separate users, same database file) from blocking
/// each other at upsert granularity.
pub fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;\n\
         PRAGMA synchronous = NORMAL;\n\
         PRAGMA foreign_keys = ON;\n\
         PRAGMA busy_timeout = 5000;\n",
    )
}
