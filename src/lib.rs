//! Ward capacity: bed allocation, department resource ledgers and the
//! admission/discharge workflow of the hospital management system.
//!
//! The HTTP binary in `main.rs` is a thin shell over [`app::router`]; every
//! domain rule lives in the services below and the [`store::CapacityStore`]
//! they share.

pub mod admission;
pub mod app;
pub mod audit;
pub mod beds;
pub mod cache;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod feed;
pub mod handlers;
pub mod ledger;
pub mod metrics;
pub mod models;
pub mod resources;
pub mod store;
