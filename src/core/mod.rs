pub mod client;
pub mod context;
pub(crate) mod engine;
pub mod event;
pub mod server;
pub(crate) mod socket;
