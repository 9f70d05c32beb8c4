//! Terminal rendering for command results

pub mod summary;
