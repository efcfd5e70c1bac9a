pub mod auth;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;

pub use auth::{Authenticator, Principal, StaticTokenAuthenticator};
pub use config::Config;
pub use error::{Error, Result};
pub use models::{ClientToken, Notification, UserId};
