pub mod collection;
pub mod config;
pub mod document;
pub mod error;
pub mod logging;
pub mod patch;
pub mod path;
pub mod schema;
pub mod server;
pub mod skiplist;
pub mod subscribe;
pub mod token;
