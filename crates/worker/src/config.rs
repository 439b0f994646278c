// Worker process configuration

use std::net::SocketAddr;

use stockdigest_durable::EngineConfig;

const DEFAULT_ADMIN_BIND_ADDRESS: &str = "0.0.0.0:9300";

/// Configuration for the worker process
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub engine: EngineConfig,
    /// Where the admin HTTP API listens
    pub admin_bind_address: SocketAddr,
    /// Apply SQL migrations on startup
    pub run_migrations: bool,
    /// Serve Swagger UI at /swagger-ui
    pub enable_swagger: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            admin_bind_address: default_bind_address(),
            run_migrations: true,
            enable_swagger: true,
        }
    }
}

fn default_bind_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9300))
}

impl WorkerConfig {
    /// Create from environment variables
    ///
    /// Engine settings come from [`EngineConfig::from_lookup`]; on top of
    /// those: `ADMIN_BIND_ADDRESS` (default "0.0.0.0:9300"),
    /// `RUN_MIGRATIONS` and `ENABLE_SWAGGER` ("false" to disable).
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let engine = EngineConfig::from_lookup(&lookup);

        let admin_bind_address = match lookup("ADMIN_BIND_ADDRESS") {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                tracing::warn!(
                    value = %raw,
                    default = DEFAULT_ADMIN_BIND_ADDRESS,
                    "invalid ADMIN_BIND_ADDRESS, using default"
                );
                default_bind_address()
            }),
            None => default_bind_address(),
        };

        let enabled = |key: &str| {
            lookup(key)
                .map(|v| !v.trim().eq_ignore_ascii_case("false"))
                .unwrap_or(true)
        };

        Self {
            engine,
            admin_bind_address,
            run_migrations: enabled("RUN_MIGRATIONS"),
            enable_swagger: enabled("ENABLE_SWAGGER"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_map(vars: &[(&str, &str)]) -> WorkerConfig {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = from_map(&[]);
        assert_eq!(config.admin_bind_address.to_string(), DEFAULT_ADMIN_BIND_ADDRESS);
        assert!(config.run_migrations);
        assert!(config.enable_swagger);
        assert_eq!(config.engine.pool.pool_size, 3);
    }

    #[test]
    fn test_overrides() {
        let config = from_map(&[
            ("ADMIN_BIND_ADDRESS", "127.0.0.1:8088"),
            ("RUN_MIGRATIONS", "false"),
            ("WORKER_POOL_SIZE", "6"),
            ("WORKER_ID", "digest-1"),
        ]);
        assert_eq!(config.admin_bind_address.port(), 8088);
        assert!(!config.run_migrations);
        assert!(config.enable_swagger);
        assert_eq!(config.engine.pool.pool_size, 6);
        assert_eq!(config.engine.pool.worker_id, "digest-1");
    }

    #[test]
    fn test_invalid_bind_address_falls_back() {
        let config = from_map(&[("ADMIN_BIND_ADDRESS", "not-an-address")]);
        assert_eq!(config.admin_bind_address, default_bind_address());
    }
}
