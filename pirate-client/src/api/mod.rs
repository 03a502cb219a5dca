//! Local control surface for this device: a small HTTP API plus an SSE
//! event stream, both reading and writing through the Session Store
//! rather than touching the kernel or adapter directly.

pub mod server;
pub mod sse;
