//! End-to-end integration tests for kvnode
//!
//! The tests under `tests/` run a real listener on `127.0.0.1:0` and talk
//! to it over TCP with the binary protocol.
