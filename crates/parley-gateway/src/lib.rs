pub mod auth;
pub mod connection;
pub mod error;
pub mod presence;
pub mod relay;
pub mod store;

pub use error::RelayError;
pub use presence::{ConnectionId, PresenceTracker};
pub use relay::RelayEngine;
pub use store::ChatStore;
