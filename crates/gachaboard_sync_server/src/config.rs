use gachaboard_sync::engine::EngineConfig;
use gachaboard_sync::schema::SchemaDescriptor;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host (default: 0.0.0.0)
    pub host: String,
    /// Server port, from SYNC_PORT or PORT (default: 5858)
    pub port: u16,
    /// Directory holding one database per room (default: ./.rooms)
    pub rooms_dir: PathBuf,
    /// CORS allowed origins (comma-separated, `*` allows any)
    pub cors_origins: Vec<String>,
    /// Seconds a socket may take to send its connect message (default: 10)
    pub handshake_timeout_secs: u64,
    /// Seconds of client silence before a session is closed (default: 0, disabled)
    pub session_idle_timeout_secs: u64,
    /// Frames queued per session before a slow reader is disconnected (default: 1024)
    pub outbound_queue_size: usize,
    /// Document schema clients must match
    pub schema: SchemaDescriptor,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("SYNC_PORT")
            .or_else(|_| env::var("PORT"))
            .unwrap_or_else(|_| "5858".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let rooms_dir =
            PathBuf::from(env::var("ROOMS_DIR").unwrap_or_else(|_| "./.rooms".to_string()));

        let cors_origins = env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "*".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let handshake_timeout_secs = env::var("HANDSHAKE_TIMEOUT_SECS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .unwrap_or(10);

        let session_idle_timeout_secs = env::var("SESSION_IDLE_TIMEOUT_SECS")
            .unwrap_or_else(|_| "0".to_string())
            .parse()
            .unwrap_or(0);

        let outbound_queue_size = env::var("OUTBOUND_QUEUE_SIZE")
            .unwrap_or_else(|_| "1024".to_string())
            .parse()
            .unwrap_or(1024);

        let schema = match env::var("SCHEMA_PATH") {
            Ok(path) if !path.trim().is_empty() => {
                let json = std::fs::read_to_string(path.trim())
                    .map_err(|e| ConfigError::Schema(format!("{}: {}", path, e)))?;
                SchemaDescriptor::from_json(&json)
                    .map_err(|e| ConfigError::Schema(format!("{}: {}", path, e)))?
            }
            _ => SchemaDescriptor::board(),
        };

        Ok(Config {
            host,
            port,
            rooms_dir,
            cors_origins,
            handshake_timeout_secs,
            session_idle_timeout_secs,
            outbound_queue_size,
            schema,
        })
    }

    /// Get the server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether any origin may connect.
    pub fn allows_any_origin(&self) -> bool {
        self.cors_origins.is_empty() || self.cors_origins.iter().any(|o| o == "*")
    }

    /// Engine tunables derived from this configuration.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            schema: self.schema.clone(),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs.max(1)),
            idle_timeout: (self.session_idle_timeout_secs > 0)
                .then(|| Duration::from_secs(self.session_idle_timeout_secs)),
            outbound_queue: self.outbound_queue_size.max(1),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid SYNC_PORT/PORT environment variable")]
    InvalidPort,
    #[error("Failed to load schema from SCHEMA_PATH: {0}")]
    Schema(String),
}
