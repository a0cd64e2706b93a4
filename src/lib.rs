pub mod auth;
pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod database;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod models;
pub mod probe;
pub mod retry;
pub mod routes;
pub mod server;

pub use error::{AppError, AppResult};
