use serde_derive::{Deserialize, Serialize};
use serdeconv;
use std::path::Path;
use std::time::Duration;

/// Tunable server constants. All capacities are fixed at construction;
/// nothing here grows at runtime.
#[derive(Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub backlog: i32,
    pub max_connections: usize,
    pub max_active_handshakes: usize,
    pub max_events: usize,
    pub poll_wait_ms: u64,
    pub handshake_timeout_ms: u64,
}

impl ServerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> ServerConfig {
        serdeconv::from_toml_file(path).expect("Error loading server configuration file")
    }

    #[inline]
    pub fn poll_wait(&self) -> Duration {
        Duration::from_millis(self.poll_wait_ms)
    }

    #[inline]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            port: 8081,
            backlog: 64,
            max_connections: 64,
            max_active_handshakes: 32,
            max_events: 256,
            poll_wait_ms: 10,
            handshake_timeout_ms: 5000,
        }
    }
}

/// Tunable client constants.
#[derive(Serialize, Deserialize, Clone)]
pub struct ClientConfig {
    pub max_events: usize,
    pub poll_wait_ms: u64,
    pub handshake_timeout_ms: u64,
}

impl ClientConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> ClientConfig {
        serdeconv::from_toml_file(path).expect("Error loading client configuration file")
    }

    #[inline]
    pub fn poll_wait(&self) -> Duration {
        Duration::from_millis(self.poll_wait_ms)
    }

    #[inline]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            max_events: 16,
            poll_wait_ms: 10,
            handshake_timeout_ms: 5000,
        }
    }
}
