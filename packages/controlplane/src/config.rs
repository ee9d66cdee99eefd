use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BlockStoreConfig {
    pub path: String,
    /// Maximum size of a single block in bytes.
    pub max_block_size: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContentConfig {
    /// Disallow new content ingestion everywhere.
    pub disable_global_adding: bool,
    /// Disallow new content ingestion on this node (shuttles unaffected).
    pub disable_local_adding: bool,
    /// Replication target applied to new content.
    pub default_replication: i32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PinConfig {
    /// Size of the pin worker pool.
    pub workers: usize,
    /// Simultaneous active pin jobs allowed per owner.
    pub max_active_per_owner: usize,
    /// Retries for transient pin failures before the content is failed.
    pub max_retries: u8,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DealConfig {
    /// Do not create any new deals (existing deals still processed).
    pub disable_deal_making: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ShuttleConfig {
    /// Inbound shuttle message handler workers.
    pub message_handlers: usize,
    /// A shuttle with no heartbeat within this window is offline.
    pub liveness_window_secs: u64,
    /// Per-shuttle outbound command queue capacity.
    pub outbound_queue_size: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TasksConfig {
    /// Interval between replication watcher passes.
    pub replication_interval_secs: u64,
    /// Delay before restarting transfers at startup, to let networking
    /// stabilize.
    pub restart_settle_delay_secs: u64,
    /// Autoretrieve index refresh interval.
    pub autoretrieve_interval_minutes: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub blockstore: BlockStoreConfig,
    pub content: ContentConfig,
    pub pin: PinConfig,
    pub deal: DealConfig,
    pub shuttle: ShuttleConfig,
    pub tasks: TasksConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("HARBOR_CONFIG").unwrap_or_else(|_| "config/config".to_string());

        let s = Config::builder()
            .set_default("database.url", "postgres://localhost/harbor")?
            .set_default("blockstore.path", "./data/blocks")?
            .set_default("blockstore.max_block_size", 1_048_576_i64)?
            .set_default("content.disable_global_adding", false)?
            .set_default("content.disable_local_adding", false)?
            .set_default("content.default_replication", 6_i64)?
            .set_default("pin.workers", 50_i64)?
            .set_default("pin.max_active_per_owner", 20_i64)?
            .set_default("pin.max_retries", 5_i64)?
            .set_default("pin.backoff_base_ms", 1000_i64)?
            .set_default("pin.backoff_max_ms", 60000_i64)?
            .set_default("deal.disable_deal_making", false)?
            .set_default("shuttle.message_handlers", 4_i64)?
            .set_default("shuttle.liveness_window_secs", 300_i64)?
            .set_default("shuttle.outbound_queue_size", 64_i64)?
            .set_default("tasks.replication_interval_secs", 60_i64)?
            .set_default("tasks.restart_settle_delay_secs", 10_i64)?
            .set_default("tasks.autoretrieve_interval_minutes", 720_i64)?
            .add_source(File::with_name(&config_path).required(false))
            // Override from environment (e.g., HARBOR__DATABASE__URL)
            .add_source(Environment::with_prefix("HARBOR").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            workers: 50,
            max_active_per_owner: 20,
            max_retries: 5,
            backoff_base_ms: 1000,
            backoff_max_ms: 60000,
        }
    }
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            disable_global_adding: false,
            disable_local_adding: false,
            default_replication: 6,
        }
    }
}

impl Default for DealConfig {
    fn default() -> Self {
        Self {
            disable_deal_making: false,
        }
    }
}

impl Default for ShuttleConfig {
    fn default() -> Self {
        Self {
            message_handlers: 4,
            liveness_window_secs: 300,
            outbound_queue_size: 64,
        }
    }
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            replication_interval_secs: 60,
            restart_settle_delay_secs: 10,
            autoretrieve_interval_minutes: 720,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_config_file() {
        let cfg = AppConfig::load().unwrap();
        assert_eq!(cfg.pin.workers, 50);
        assert_eq!(cfg.pin.max_active_per_owner, 20);
        assert_eq!(cfg.content.default_replication, 6);
        assert_eq!(cfg.tasks.autoretrieve_interval_minutes, 720);
        assert!(!cfg.deal.disable_deal_making);
    }
}
