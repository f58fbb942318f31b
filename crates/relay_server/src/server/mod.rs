#![forbid(unsafe_code)]

pub mod auth;
pub mod connection;
pub mod health;
pub mod history;
pub mod registry;
pub mod rooms;
pub mod router;
pub mod store;


#[cfg(test)]
mod registry_tests;

#[cfg(test)]
mod router_tests;
