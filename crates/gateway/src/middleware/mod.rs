//! Gateway middleware

pub mod identity;
