// Library crate; main.rs and the integration tests both build on it.

pub mod config;
pub mod error;
pub mod events;
pub mod janitor;
pub mod load;
pub mod queue;
pub mod routes;
pub mod server;
pub mod settings;
pub mod state;
pub mod store;
