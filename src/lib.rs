//! Transaction submission subsystem for a multi-tenant bulk-payment platform
//! on Stellar: channel account pool, signature service, distribution account
//! resolution and the submitter engine.

pub mod bootstrap;
pub mod channel_accounts;
pub mod config;
pub mod error;
pub mod keystore;
pub mod resolver;
pub mod server;
pub mod signing;
pub mod stellar;
pub mod store;
pub mod submitter;

pub use error::{AppError, AppResult, ErrorClass};
