//! Storage engine test suite
