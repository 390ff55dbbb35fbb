pub mod auth;
pub mod config;
pub mod http;

pub use config::DaemonConfig;
pub use http::{router, router_with_shutdown, HttpState};
