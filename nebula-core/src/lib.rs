//! Nebula core library exports

pub mod config;
pub mod fetch;
pub mod platform;
pub mod policy;
pub mod trust;
pub mod update;
