//! Palisade — encrypted chat client core library.

pub mod api;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod session;
pub mod status;
pub mod sync;
