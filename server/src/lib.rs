//! Cipherpost server
//!
//! An end-to-end encrypted messaging broker. The server stores and moves
//! opaque ciphertext and public key material; every cross-step invariant
//! (one-time pre-key consumption, drain-and-mark, destroy-once, roster change
//! plus announcement) is a single SQLite transaction.

pub mod auth;
pub mod config;
pub mod database;
pub mod db;
pub mod delivery;
pub mod device_codes;
pub mod envelopes;
pub mod error;
pub mod groups;
pub mod keys;
pub mod routing;
pub mod websocket;
