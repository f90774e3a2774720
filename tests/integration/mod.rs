//! Integration tests for the flow repair loop

mod retry_loop;
mod sled_persistence;
