//! Core aegis library (session bridge, hosted provider, callback handling).

pub mod callback;
pub mod config;
pub mod hosted;
pub mod session;
pub mod storage;
