//! TestServer: full-stack integration test harness for memgate.

mod server;

pub use server::{TestError, TestServer};
