//! Property-based tests for attempt memory and the retry loop
