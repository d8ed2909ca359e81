pub mod api;
pub mod clap;
mod config;
pub mod coordination;
pub mod database;
pub mod service;
mod utils;

// Sync RwLock: services() is used from many non-async contexts and the value
// is written exactly once during startup
use std::sync::RwLock;

pub use config::Config;
pub use database::Database;
pub use service::Services;
pub use utils::error::{Error, ErrorKind, Result};

pub static SERVICES: RwLock<Option<&'static Services>> = RwLock::new(None);

pub fn services() -> &'static Services {
    SERVICES
        .read()
        .unwrap()
        .expect("SERVICES should be initialized when this is called")
}
