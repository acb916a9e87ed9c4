//! Database migration system
//!
//! Tracks schema versions and applies migrations in order.

use rusqlite::Connection;
use tracing::{info, instrument};

use crate::error::Result;

/// A database migration
pub struct Migration {
    /// Version number (must be sequential starting from 1)
    pub version: u32,
    /// Description of what this migration does
    pub description: &'static str,
    /// SQL to run for this migration
    pub sql: &'static str,
}

/// All migrations in order
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Initial schema",
        sql: r#"
            -- One negotiation thread per (farmer, buyer, listing)
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                farmer_id TEXT NOT NULL,
                buyer_id TEXT NOT NULL,
                listing_id TEXT,
                bid_id TEXT,
                status TEXT NOT NULL DEFAULT 'open' CHECK (status IN ('open', 'closed')),
                farmer_unread INTEGER NOT NULL DEFAULT 0 CHECK (farmer_unread >= 0),
                buyer_unread INTEGER NOT NULL DEFAULT 0 CHECK (buyer_unread >= 0),
                context TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Append-only message log
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                sender_id TEXT NOT NULL,
                sender_role TEXT NOT NULL,
                message_type TEXT NOT NULL,
                content TEXT NOT NULL,
                original_content TEXT,
                was_filtered INTEGER NOT NULL DEFAULT 0,
                offer_price INTEGER,
                offer_quantity REAL,
                is_read INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                FOREIGN KEY (conversation_id) REFERENCES conversations(id),
                UNIQUE (conversation_id, sequence)
            );
        "#,
    },
    Migration {
        version: 2,
        description: "Enforce conversation key uniqueness",
        sql: r#"
            -- NULL listings must collide with each other, so index the coalesced value
            CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_key
                ON conversations(farmer_id, buyer_id, IFNULL(listing_id, ''));
        "#,
    },
    Migration {
        version: 3,
        description: "Add indexes for inbox and history queries",
        sql: r#"
            CREATE INDEX IF NOT EXISTS idx_conversations_farmer ON conversations(farmer_id);
            CREATE INDEX IF NOT EXISTS idx_conversations_buyer ON conversations(buyer_id);
            CREATE INDEX IF NOT EXISTS idx_messages_sender ON messages(conversation_id, sender_id);
        "#,
    },
    Migration {
        version: 4,
        description: "Guard message log against deletes and content edits",
        sql: r#"
            CREATE TRIGGER IF NOT EXISTS messages_no_delete
            BEFORE DELETE ON messages
            BEGIN
                SELECT RAISE(ABORT, 'messages are append-only');
            END;

            CREATE TRIGGER IF NOT EXISTS messages_immutable
            BEFORE UPDATE OF id, conversation_id, sequence, sender_id, sender_role,
                message_type, content, original_content, was_filtered, offer_price,
                offer_quantity, created_at
            ON messages
            BEGIN
                SELECT RAISE(ABORT, 'messages are immutable');
            END;
        "#,
    },
];

/// Initialize the migrations table
fn init_migrations_table(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )",
        [],
    )?;
    Ok(())
}

/// Get the current schema version
fn get_current_version(conn: &Connection) -> Result<u32> {
    let version: Option<u32> = conn
        .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
            row.get(0)
        })
        .unwrap_or(None);
    Ok(version.unwrap_or(0))
}

/// Record that a migration was applied
fn record_migration(conn: &Connection, migration: &Migration) -> Result<()> {
    conn.execute(
        "INSERT INTO schema_migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
        rusqlite::params![
            migration.version,
            migration.description,
            chrono::Utc::now().to_rfc3339()
        ],
    )?;
    Ok(())
}

/// Run all pending migrations
#[instrument(skip(conn))]
pub fn run_migrations(conn: &Connection) -> Result<()> {
    init_migrations_table(conn)?;

    let current_version = get_current_version(conn)?;
    info!(current_version, "Checking for pending migrations");

    for migration in MIGRATIONS {
        if migration.version > current_version {
            info!(
                version = migration.version,
                description = migration.description,
                "Applying migration"
            );

            conn.execute_batch(migration.sql)?;
            record_migration(conn, migration)?;

            info!(version = migration.version, "Migration complete");
        }
    }

    let new_version = get_current_version(conn)?;
    if new_version > current_version {
        info!(
            from = current_version,
            to = new_version,
            "Database schema updated"
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Get the latest migration version (test helper)
    fn latest_version() -> u32 {
        MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
    }

    #[test]
    fn test_migrations_run() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let version = get_current_version(&conn).unwrap();
        assert_eq!(version, latest_version());
    }

    #[test]
    fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();

        // Run twice
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version = get_current_version(&conn).unwrap();
        assert_eq!(version, latest_version());
    }

    #[test]
    fn test_migrations_sequential() {
        // Verify migrations are numbered sequentially
        for (i, migration) in MIGRATIONS.iter().enumerate() {
            assert_eq!(
                migration.version as usize,
                i + 1,
                "Migration {} should have version {}",
                migration.description,
                i + 1
            );
        }
    }

    fn insert_conversation(
        conn: &Connection,
        id: &str,
        listing: Option<&str>,
    ) -> rusqlite::Result<usize> {
        conn.execute(
            "INSERT INTO conversations (id, farmer_id, buyer_id, listing_id, created_at, updated_at)
             VALUES (?1, 'F1', 'B1', ?2, 'now', 'now')",
            rusqlite::params![id, listing],
        )
    }

    #[test]
    fn test_null_listing_key_is_unique() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        insert_conversation(&conn, "c1", None).unwrap();
        assert!(insert_conversation(&conn, "c2", None).is_err());

        insert_conversation(&conn, "c3", Some("L1")).unwrap();
        assert!(insert_conversation(&conn, "c4", Some("L1")).is_err());
    }

    #[test]
    fn test_messages_append_only() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        insert_conversation(&conn, "c1", None).unwrap();
        conn.execute(
            "INSERT INTO messages (id, conversation_id, sequence, sender_id, sender_role,
                message_type, content, created_at)
             VALUES ('m1', 'c1', 1, 'F1', 'farmer', 'text', 'hello', 'now')",
            [],
        )
        .unwrap();

        // Read flag may change
        conn.execute("UPDATE messages SET is_read = 1 WHERE id = 'm1'", [])
            .unwrap();

        assert!(conn
            .execute("UPDATE messages SET content = 'edited' WHERE id = 'm1'", [])
            .is_err());
        assert!(conn.execute("DELETE FROM messages WHERE id = 'm1'", []).is_err());
    }
}
