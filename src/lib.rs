pub mod cache;
pub mod config;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod filter;
pub mod geocode;
pub mod harness;
pub mod model;
pub mod pipeline;
pub mod store;
