pub mod api;
pub mod broadcast;
pub mod config;
pub mod handle;
pub mod ingest;
pub mod payload;
pub mod producer;
pub mod registry;
pub mod relay;
pub mod session;
pub mod shutdown;

pub use api::{router, AppState};
pub use config::{Cli, ConfigError, RelayConfig};
pub use payload::Payload;
pub use relay::Relay;
