//! `Palisade` wire protocol library.
//!
//! Shared by the client core and the broker: chat message wire types,
//! account-status broadcast types, and the JSON broker frame codec.

pub mod broker;
pub mod message;
pub mod status;
