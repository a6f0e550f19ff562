pub mod commands;
pub mod config;
pub mod degrade;
pub mod diagnostics;
pub mod http;
pub mod runtime;
pub mod sse;
