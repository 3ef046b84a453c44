pub mod aggregator;
pub mod app;
pub mod backend;
pub mod config;
pub mod dispatcher;
pub mod inventory;
pub mod output;
pub mod resolver;
pub mod syntax;

pub use gpibtool_protocol as protocol;
pub use gpibtool_protocol::{Error, Result};
