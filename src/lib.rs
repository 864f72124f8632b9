pub mod api;
pub mod assist;
pub mod auth;
pub mod config;
pub mod error;
pub mod generation;
pub mod logger;
pub mod models;
pub mod notes;
pub mod rag;
pub mod search;
pub mod state;
pub mod store;

#[cfg(test)]
mod testing;
