pub mod config;
pub mod connectivity;
pub mod fs;
pub mod host;
pub mod http;
pub mod json;
pub mod providers;
pub mod store;
pub mod systemd;
