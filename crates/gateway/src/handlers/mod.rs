//! API handlers module

pub mod admin;
pub mod demo;
pub mod health;
pub mod records;
pub mod sessions;
