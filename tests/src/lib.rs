//! Integration tests for the wire protocol live under `tests/`. This
//! crate has no library surface of its own.
