//! Integration tests for rfq-client.
//!
//! These tests run the connection manager and the application against a
//! local tungstenite server speaking the maker protocol.

pub mod common;
