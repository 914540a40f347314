//! Server configuration.
//!
//! Every setting is a CLI flag with a matching environment variable.
//! Tests build a [`ServerConfig`] literal and fill the rest from `Default`.

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "social-server", about = "Real-time presence and fan-out server")]
pub struct ServerConfig {
    /// Address for the HTTP + WebSocket listener.
    #[arg(long, env = "SOCIAL_LISTEN_ADDR", default_value = "127.0.0.1:8080")]
    pub listen_addr: String,

    /// Path to the SQLite database. If omitted, an in-memory database is used.
    #[arg(long, env = "SOCIAL_DB_PATH")]
    pub db_path: Option<String>,

    /// Session lifetime in seconds (matches the session cookie max-age).
    #[arg(long, env = "SOCIAL_SESSION_TTL_SECS", default_value = "86400")]
    pub session_ttl_secs: u64,

    /// How often expired sessions are swept from memory, in seconds.
    #[arg(long, env = "SOCIAL_SESSION_SWEEP_SECS", default_value = "300")]
    pub session_sweep_secs: u64,

    /// Capacity of each connection's outbound event queue.
    #[arg(long, env = "SOCIAL_OUTBOUND_QUEUE", default_value = "256")]
    pub outbound_queue: usize,

    /// Deadline for writing one frame to a client before the connection is dropped.
    #[arg(long, env = "SOCIAL_WRITE_TIMEOUT_SECS", default_value = "10")]
    pub write_timeout_secs: u64,

    /// Close connections that send nothing (not even a heartbeat) for this long.
    #[arg(long, env = "SOCIAL_IDLE_TIMEOUT_SECS", default_value = "120")]
    pub idle_timeout_secs: u64,

    /// Largest inbound frame accepted, in bytes.
    #[arg(long, env = "SOCIAL_MAX_FRAME_LEN", default_value = "65536")]
    pub max_frame_len: usize,

    /// Inbound frames allowed per second per connection (token bucket).
    #[arg(long, env = "SOCIAL_RATE_LIMIT", default_value = "20")]
    pub rate_limit_per_sec: u32,

    /// Origins allowed by CORS (comma-separated).
    #[arg(
        long,
        env = "SOCIAL_ALLOWED_ORIGINS",
        value_delimiter = ',',
        default_value = "http://localhost:3000"
    )]
    pub allowed_origins: Vec<String>,

    /// bcrypt work factor for new password hashes.
    #[arg(long, env = "SOCIAL_BCRYPT_COST", default_value = "12")]
    pub bcrypt_cost: u32,

    /// Mark the session cookie `Secure` (enable behind HTTPS).
    #[arg(long, env = "SOCIAL_COOKIE_SECURE")]
    pub cookie_secure: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            db_path: None,
            session_ttl_secs: 86_400,
            session_sweep_secs: 300,
            outbound_queue: 256,
            write_timeout_secs: 10,
            idle_timeout_secs: 120,
            max_frame_len: 65_536,
            rate_limit_per_sec: 20,
            allowed_origins: vec!["http://localhost:3000".to_string()],
            bcrypt_cost: bcrypt::DEFAULT_COST,
            cookie_secure: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_match_default_impl() {
        let parsed = ServerConfig::parse_from(["social-server"]);
        let default = ServerConfig::default();
        assert_eq!(parsed.listen_addr, default.listen_addr);
        assert_eq!(parsed.session_ttl_secs, default.session_ttl_secs);
        assert_eq!(parsed.outbound_queue, default.outbound_queue);
        assert_eq!(parsed.allowed_origins, default.allowed_origins);
        assert!(!parsed.cookie_secure);
    }

    #[test]
    fn origins_split_on_comma() {
        let parsed = ServerConfig::parse_from([
            "social-server",
            "--allowed-origins",
            "http://a.test,http://b.test",
        ]);
        assert_eq!(parsed.allowed_origins, vec!["http://a.test", "http://b.test"]);
    }
}
