pub mod app;
pub mod command;
pub mod config;
pub mod domain;
pub mod error;
pub mod fallback;
pub mod fetch;
pub mod fs_util;
pub mod genome;
pub mod indexer;
pub mod installer;
pub mod output;
pub mod snapshot;
pub mod store;
pub mod template;
