//! Core types and algorithms of the temporal rating engine.
//!
//! This crate is deliberately free of HTTP and database dependencies.
//! Storage is reached through [`store::RatingStore`]; everything else is
//! either a pure function or an async driver over that trait.

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
// Suppress the advisory lint about `Send` bounds on the returned futures.
#![allow(async_fn_in_trait)]

pub mod builder;
pub mod calculation;
pub mod classify;
pub mod entity;
pub mod error;
pub mod finding;
pub mod lifecycle;
pub mod lineage;
pub mod locks;
pub mod resolver;
pub mod snapshot;
pub mod stats;
pub mod store;

pub use error::{Error, Result};
