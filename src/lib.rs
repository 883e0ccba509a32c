// Overlang client - authenticated request pipeline and session bridge

pub mod auth;
pub mod backend;
pub mod config;
pub mod error;
pub mod http_client;
pub mod session;
