//! Gateway: HTTP server and process wiring.
//!
//! Single port serves the health check and the webhook endpoint. All dispatch components are
//! built once at startup and shared by every event.

mod server;

pub use server::{run_gateway, GatewayState};
