//! Library surface for the session-aware sandbox gateway. `main.rs` is a
//! thin binary entry point over this crate; integration tests drive
//! [`server::build_router`] directly against fakes.

pub mod config;
pub mod error;
pub mod identity;
pub mod model;
pub mod proxy;
pub mod server;
pub mod session;
pub mod state;
pub mod store;
