//! `Palisade` broker library.
//!
//! Exposes the publish/subscribe broker for use in tests and embedding.
//! The broker accepts WebSocket connections, tracks topic subscriptions,
//! and fans published bodies out to subscribers. Chat payloads sent to the
//! application destination are routed to both participants' topics.

pub mod broker;
pub mod config;
