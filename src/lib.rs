pub mod app;
pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod notify;
pub mod state;
pub mod storage;
pub mod store;
