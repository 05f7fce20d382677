pub mod campaign;
pub mod config;
pub mod error;
pub mod transport;
