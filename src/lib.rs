pub mod agent;
pub mod aggregate;
pub mod config;
pub mod flush;
pub mod follow;
pub mod migrate;
pub mod parse;
pub mod store;
