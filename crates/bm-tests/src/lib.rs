//! # bm-tests
//!
//! Integration tests for the bm node.
//!
//! This crate provides:
//! - A harness running several nodes in-process over localhost
//! - Generators and proptest strategies for wire types
//! - Cross-crate scenarios: framing, proof-of-work, gossip and sync

pub mod generators;
pub mod harness;


#[cfg(test)]
mod property_tests;

#[cfg(test)]
mod pow_tests;

#[cfg(test)]
mod network_tests;

pub use generators::*;
pub use harness::*;
