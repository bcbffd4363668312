pub mod config;
pub mod http;
pub mod service;
pub mod snapshot;
pub mod version;
pub mod worker;
