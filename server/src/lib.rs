pub mod ai;
pub mod app;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod prompting;
pub mod realtime;
pub mod resolver;
pub mod routes;
pub mod store;
pub mod types;
pub mod util;
pub mod webhook;
pub mod whatsapp;
