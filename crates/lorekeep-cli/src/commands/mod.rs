//! Command handlers

pub mod config;
pub mod contexts;
pub mod entity;
pub mod status;
pub mod sync;
