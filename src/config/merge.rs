//! Source merge order and defaults.

pub mod merge_policy;

pub use merge_policy::builder_with_defaults;
