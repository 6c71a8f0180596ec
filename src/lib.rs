//! Onboarding engine — completion tracking for onboarding panels.

pub mod config;
pub mod error;
pub mod onboarding;
pub mod store;
