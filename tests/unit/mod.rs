//! Unit tests for selfmend modules
//!
//! These tests drive components through the public API with in-memory
//! collaborators; nothing touches the network.

mod test_analysis;
mod test_classifier;
mod test_config;
mod test_manager;
mod test_monitor;
mod test_recovery;
