pub mod app;
pub mod auth;
pub mod channel;
pub mod client;
pub mod config;
pub mod dedup;
pub mod directory;
pub mod error;
pub mod hub;
pub mod presence;
pub mod read_receipts;
pub mod recommendation;
pub mod router;
pub mod store;
pub mod types;
