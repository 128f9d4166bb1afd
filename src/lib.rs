pub mod client;
pub mod config;
pub mod errors;
pub mod flow;
pub mod runner;
pub mod server;
