use std::env;

/// Service configuration. All values read from environment variables with
/// sensible defaults.
///
/// Environment variables:
/// - `DATABASE_PATH` — SQLite database file (default: `data/messages.db`)
/// - `MESSAGE_BROKER_MAX_CONNECTIONS` — broker connection pool cap (default: 10)
/// - `GROUP_CLUSTER_SIZE` — default capacity of a group cluster (default: 1000)
/// - `MESSAGE_INCOMING_QUEUE_NAME` — durable ingress queue (default: `message.incoming.queue`)
/// - `MESSAGE_PREFETCH_COUNT` — in-flight deliveries per engine (default: 32)
/// - `OUTGOING_MESSAGE_WORKERS` — batch publishing workers (default: 32)
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub database_path: String,
    pub broker_max_connections: usize,
    pub group_cluster_size: i64,
    pub incoming_queue_name: String,
    pub prefetch_count: usize,
    pub outgoing_message_workers: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            database_path: "data/messages.db".to_string(),
            broker_max_connections: 10,
            group_cluster_size: 1000,
            incoming_queue_name: "message.incoming.queue".to_string(),
            prefetch_count: 32,
            outgoing_message_workers: 32,
        }
    }
}

impl ServiceConfig {
    /// Create a ServiceConfig from environment variables, with defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = env::var("DATABASE_PATH")
            && !val.is_empty()
        {
            config.database_path = val;
        }
        if let Ok(val) = env::var("MESSAGE_BROKER_MAX_CONNECTIONS")
            && let Ok(n) = val.parse::<usize>()
        {
            config.broker_max_connections = n.max(1);
        }
        if let Ok(val) = env::var("GROUP_CLUSTER_SIZE")
            && let Ok(n) = val.parse::<i64>()
        {
            config.group_cluster_size = n.max(1);
        }
        if let Ok(val) = env::var("MESSAGE_INCOMING_QUEUE_NAME")
            && !val.is_empty()
        {
            config.incoming_queue_name = val;
        }
        if let Ok(val) = env::var("MESSAGE_PREFETCH_COUNT")
            && let Ok(n) = val.parse::<usize>()
        {
            config.prefetch_count = n.max(1);
        }
        if let Ok(val) = env::var("OUTGOING_MESSAGE_WORKERS")
            && let Ok(n) = val.parse::<usize>()
        {
            config.outgoing_message_workers = n.max(1);
        }

        config
    }
}
