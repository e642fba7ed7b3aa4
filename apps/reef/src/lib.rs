pub mod cli;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod registry;
pub mod save;
pub mod search;
pub mod service;
pub mod session;
pub mod telemetry;
pub mod viewport;

pub use connection::Connection;
pub use error::ReefError;
pub use events::EventBus;
pub use registry::SessionRegistry;
pub use session::Session;
pub use viewport::Viewport;
