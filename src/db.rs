use rusqlite::Connection;
use tokio::sync::Mutex;

/// Shared SQLite handle. The async mutex lets the transactional drain hold
/// the connection across awaits on per-message client acknowledgements;
/// serialized access is also what stands in for row-level `FOR UPDATE`.
pub struct Db {
    pub conn: Mutex<Connection>,
}

impl Db {
    pub fn new(path: &str) -> Self {
        let conn = Connection::open(path).expect("Failed to open database");
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .expect("Failed to set pragmas");
        migrate(&conn);
        Db {
            conn: Mutex::new(conn),
        }
    }
}

fn migrate(conn: &Connection) {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS messages (
            message_id INTEGER PRIMARY KEY AUTOINCREMENT,
            gamespace_id INTEGER NOT NULL,
            message_uuid TEXT NOT NULL,
            message_recipient_class TEXT NOT NULL,
            message_sender TEXT NOT NULL,
            message_recipient TEXT NOT NULL,
            message_time TEXT NOT NULL,
            message_type TEXT NOT NULL,
            message_payload TEXT NOT NULL DEFAULT '{}',
            message_delivered INTEGER NOT NULL DEFAULT 0,
            message_flags TEXT NOT NULL DEFAULT '',
            UNIQUE (gamespace_id, message_uuid)
        );

        CREATE INDEX IF NOT EXISTS idx_messages_recipient
            ON messages(gamespace_id, message_recipient_class, message_recipient, message_delivered);
        CREATE INDEX IF NOT EXISTS idx_messages_sender
            ON messages(gamespace_id, message_sender);

        CREATE TABLE IF NOT EXISTS last_read_message (
            gamespace_id INTEGER NOT NULL,
            account_id TEXT NOT NULL,
            message_recipient_class TEXT NOT NULL,
            message_recipient TEXT NOT NULL,
            last_message_time TEXT NOT NULL,
            last_message_uuid TEXT NOT NULL,
            PRIMARY KEY (gamespace_id, account_id, message_recipient_class, message_recipient)
        );

        CREATE TABLE IF NOT EXISTS groups (
            group_id INTEGER PRIMARY KEY AUTOINCREMENT,
            gamespace_id INTEGER NOT NULL,
            group_class TEXT NOT NULL,
            group_key TEXT NOT NULL,
            group_store_messages INTEGER NOT NULL DEFAULT 1,
            group_clustered INTEGER NOT NULL DEFAULT 0,
            group_cluster_size INTEGER NOT NULL DEFAULT 1000,
            UNIQUE (gamespace_id, group_class, group_key)
        );

        CREATE TABLE IF NOT EXISTS group_participants (
            participation_id INTEGER PRIMARY KEY AUTOINCREMENT,
            gamespace_id INTEGER NOT NULL,
            group_id INTEGER NOT NULL REFERENCES groups(group_id) ON DELETE CASCADE,
            participation_account TEXT NOT NULL,
            participation_role TEXT NOT NULL DEFAULT '',
            participation_cluster INTEGER NOT NULL DEFAULT 0,
            UNIQUE (gamespace_id, group_id, participation_account)
        );

        CREATE INDEX IF NOT EXISTS idx_participants_account
            ON group_participants(gamespace_id, participation_account);

        CREATE TABLE IF NOT EXISTS group_clusters (
            gamespace_id INTEGER NOT NULL,
            group_id INTEGER NOT NULL REFERENCES groups(group_id) ON DELETE CASCADE,
            cluster_id INTEGER NOT NULL,
            cluster_accounts INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (gamespace_id, group_id, cluster_id)
        );",
    )
    .expect("Failed to run migrations");
}
