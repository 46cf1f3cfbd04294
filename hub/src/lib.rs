pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod hub;
pub mod registry;
pub mod store;

pub use hub::ChatHub;
pub use registry::{Connection, GroupRegistry};
