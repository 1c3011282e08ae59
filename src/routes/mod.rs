//! Route modules for the conversion gateway

pub mod convert;
pub mod health;
