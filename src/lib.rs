pub mod api;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod driver;
pub mod error;
pub mod fetch;
pub mod processor;
pub mod proxy;
pub mod schedule;
pub mod scorer;
pub mod types;

#[cfg(test)]
mod testing;
