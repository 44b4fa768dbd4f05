pub mod audit;
pub mod auth;
pub mod config;
pub mod engine;
pub mod limits;
pub mod maintenance;
pub mod model;
pub mod observability;
pub mod policy;
pub mod sql;
pub mod tenant;
pub mod tls;
pub mod wal;
pub mod wire;
