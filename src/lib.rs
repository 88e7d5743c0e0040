pub mod auth;
pub mod engine;
pub mod gateway;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod sql;
pub mod sweeper;
pub mod tls;
pub mod token;
pub mod wal;
pub mod wire;
