//! Coursegate - content access gating for course modules and lessons
//!
//! This library provides the gating engine and its database-backed service.
//! It exposes all modules for testing purposes.

pub mod entities;
pub mod errors;
pub mod gating;
pub mod jobs;
pub mod settings;
pub mod storage;
pub mod web;
