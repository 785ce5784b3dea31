use std::env;
use std::time::Duration;

/// Process-wide configuration, loaded once at startup and never mutated.
///
/// Every tunable the gateway, worker, and replay coordinator share lives here
/// so the three collaborators agree on the same deadlines without threading
/// raw env lookups through the call stack.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub auth_verifier_url: String,
    pub server_host: String,
    pub server_port: u16,
    pub is_dev: bool,
    pub allowed_origins: Vec<String>,

    /// How long a presence key lives before it expires without a refresh.
    pub presence_ttl: Duration,
    /// Derived as presence_ttl / 2, never read from the environment.
    pub presence_refresh_interval: Duration,
    /// Time budget for a client to complete the AUTHENTICATING handshake.
    pub auth_deadline: Duration,
    /// Time since the last heartbeat after which the watchdog considers a
    /// session dead and tears it down.
    pub dead_after: Duration,
    /// Per-message processing budget for the delivery worker.
    pub msg_deadline: Duration,
    /// Clock-skew allowance for the undelivered-replay race guard.
    pub replay_skew: Duration,
    /// Minimum interval between undelivered-count notifications to the same user.
    pub notify_debounce: Duration,
}

fn env_duration_secs(key: &str, default_secs: u64) -> Duration {
    let secs = env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default_secs);
    Duration::from_secs(secs)
}

impl Config {
    pub fn from_env() -> Result<Self, env::VarError> {
        dotenvy::dotenv().ok();

        let presence_ttl = env_duration_secs("PRESENCE_TTL", 30);

        Ok(Config {
            database_url: env::var("DATABASE_URL")?,
            redis_url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string()),
            auth_verifier_url: env::var("AUTH_VERIFIER_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:9000/verify".to_string()),
            server_host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            server_port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .unwrap_or(8080),
            is_dev: env::var("APP_ENV").as_deref() != Ok("production"),
            allowed_origins: env::var("ALLOWED_ORIGINS")
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),

            presence_refresh_interval: presence_ttl / 2,
            presence_ttl,
            auth_deadline: env_duration_secs("AUTH_DEADLINE", 15),
            dead_after: env_duration_secs("DEAD_AFTER", 60),
            msg_deadline: env_duration_secs("MSG_DEADLINE", 30),
            replay_skew: env_duration_secs("REPLAY_SKEW", 2),
            notify_debounce: env_duration_secs("NOTIFY_DEBOUNCE", 60),
        })
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presence_refresh_interval_is_half_ttl() {
        let ttl = Duration::from_secs(60);
        assert_eq!(ttl / 2, Duration::from_secs(30));
    }
}
