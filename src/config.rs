//! Process configuration, loaded once at startup from the environment.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub enable_tls: bool,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub max_concurrent_requests: usize,
    pub request_timeout: Duration,
    pub max_idle_conns: usize,
    pub max_conns_per_host: usize,
    pub debug: bool,

    pub workload_manager_addr: String,

    pub store_type: StoreType,
    pub redis_addr: String,
    pub redis_password: Option<String>,
    pub valkey_addr: String,
    pub valkey_password: Option<String>,
    pub valkey_disable_cache: bool,
    pub valkey_force_single: bool,

    pub identity_namespace: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreType {
    Redis,
    Valkey,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let enable_tls: bool = env_parse("ENABLE_TLS", false)?;
        let tls_cert = std::env::var("TLS_CERT").ok().filter(|v| !v.is_empty());
        let tls_key = std::env::var("TLS_KEY").ok().filter(|v| !v.is_empty());
        if enable_tls && (tls_cert.is_none() || tls_key.is_none()) {
            anyhow::bail!("ENABLE_TLS is set but TLS_CERT and TLS_KEY must both be provided");
        }

        let store_type = match env_str("STORE_TYPE", "redis").to_lowercase().as_str() {
            "valkey" => StoreType::Valkey,
            _ => StoreType::Redis,
        };

        Ok(Self {
            port: env_parse("PORT", 9090)?,
            enable_tls,
            tls_cert,
            tls_key,
            max_concurrent_requests: env_parse("MAX_CONCURRENT_REQUESTS", 1000)?,
            request_timeout: Duration::from_secs(env_parse("REQUEST_TIMEOUT", 30)?),
            max_idle_conns: env_parse("MAX_IDLE_CONNS", 100)?,
            max_conns_per_host: env_parse("MAX_CONNS_PER_HOST", 32)?,
            debug: env_parse("DEBUG", false)?,

            workload_manager_addr: env_required("WORKLOAD_MANAGER_ADDR")?,

            store_type,
            redis_addr: env_str("REDIS_ADDR", "127.0.0.1:6379"),
            redis_password: std::env::var("REDIS_PASSWORD").ok().filter(|v| !v.is_empty()),
            valkey_addr: env_str("VALKEY_ADDR", "127.0.0.1:6379"),
            valkey_password: std::env::var("VALKEY_PASSWORD").ok().filter(|v| !v.is_empty()),
            valkey_disable_cache: env_parse("VALKEY_DISABLE_CACHE", false)?,
            valkey_force_single: env_parse("VALKEY_FORCE_SINGLE", false)?,

            identity_namespace: env_str("PICOD_ROUTER_NAMESPACE", "default"),
        })
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_required(key: &str) -> anyhow::Result<String> {
    std::env::var(key).map_err(|_| anyhow::anyhow!("required env var {key} is not set"))
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("failed to parse env var {key}={val}: {e}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_parse_falls_back_to_default() {
        std::env::remove_var("CONFIG_TEST_MISSING");
        let v: u16 = env_parse("CONFIG_TEST_MISSING", 42).unwrap();
        assert_eq!(v, 42);
    }

    #[test]
    fn env_parse_rejects_unparsable_value() {
        std::env::set_var("CONFIG_TEST_BAD", "not-a-number");
        let result: anyhow::Result<u16> = env_parse("CONFIG_TEST_BAD", 0);
        assert!(result.is_err());
        std::env::remove_var("CONFIG_TEST_BAD");
    }
}
