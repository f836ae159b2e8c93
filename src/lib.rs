//! Lucky-draw prize engine.
//!
//! Operator consoles share one realtime registry holding registrants, prize
//! tier counts and the winner board. This crate keeps a replica of that
//! registry, runs the spinning wheel, and commits each winner with a
//! conditional write so two consoles drawing at once never overwrite each
//! other.

pub mod allocator;
pub mod config;
pub mod engine;
pub mod firebase;
pub mod memory;
pub mod metrics;
pub mod pool;
pub mod registration;
pub mod registry;
pub mod server;
pub mod spin;
pub mod sync;
pub mod tiers;
