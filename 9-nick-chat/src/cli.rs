use std::time::Duration;

use clap::Parser;

use crate::server::ServerConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Run as the chat server instead of an interactive client.
    #[arg(long, env = "CHAT_SERVER")]
    pub server: bool,

    /// Address to bind (server) or connect to (client).
    #[arg(long, env = "CHAT_ADDRESS", default_value = "localhost:9000")]
    pub address: String,

    /// Maximum number of connections served at once. Unlimited when unset.
    #[arg(long, env = "CHAT_MAX_CONNECTIONS")]
    pub max_connections: Option<usize>,

    /// Upper bound on a single write to a recipient, in milliseconds.
    #[arg(long, env = "CHAT_DELIVERY_TIMEOUT_MS", default_value_t = 5000)]
    pub delivery_timeout_ms: u64,
}

impl Cli {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            max_connections: self.max_connections,
            delivery_timeout: Duration::from_millis(self.delivery_timeout_ms),
        }
    }
}
