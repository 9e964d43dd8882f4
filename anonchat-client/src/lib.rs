pub mod config;
pub mod error;
pub mod history;
pub mod identity;
pub mod runtime;
pub mod session;
pub mod upload;
