pub mod aggregate;
pub mod auth;
pub mod config;
pub mod error;
pub mod handshake;
pub mod heartbeat;
pub mod hub;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod schema;
pub mod server;
pub mod service;

pub use config::HubConfig;
pub use error::{HubError, Result};
pub use hub::{Hub, HubStores};
pub use server::HubServer;
pub use service::ServiceEvent;
