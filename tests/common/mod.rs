//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Redis testcontainer setup
//! - Fixture entities (`User`, `Rank`, `Friend`, `Member`)
//! - Node builders over in-memory backends

#![allow(dead_code)]

pub mod containers;
pub mod fixtures;

pub use containers::*;
pub use fixtures::*;
