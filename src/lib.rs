pub mod config;
pub mod domain;
pub mod error;
pub mod one;
pub mod output;
pub mod query;
pub mod registry;
pub mod resolver;
pub mod store;
pub mod transfer;
