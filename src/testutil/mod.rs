//! Test Fixtures
//!
//! Shared fixtures for unit and integration tests: a mock storage node that
//! speaks the small slice of HTTP/1.1 the client exercises. Kept in the
//! library so `tests/` can use it too.

pub mod fixtures;
pub mod mock_shark;
