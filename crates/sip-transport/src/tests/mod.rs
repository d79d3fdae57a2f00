//! Cross-module tests for the transport engine.

mod engine_test;
