//! Database layer for tally-core

mod connection;
mod migrations;

pub use connection::Database;
