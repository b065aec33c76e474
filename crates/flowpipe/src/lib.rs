//! Network gateways and load balancing for flow-based-programming pipes.
//!
//! # Crate Structure
//!
//! - [`frame`] - Header-block framing shared by every pipe
//! - [`transport`] - Listen endpoints (TCP, TLS, Unix, WebSocket)
//! - [`gateway`] - Connection multiplexing and HTTP transcoding (behind `gateway` feature)
//! - [`balancer`] - Round-robin fan-out over named ports (behind `balancer` feature)

/// Re-export frame types.
pub mod frame {
    pub use flowpipe_frame::*;
}

/// Re-export transport types.
pub mod transport {
    pub use flowpipe_transport::*;
}

/// Re-export gateway types (requires `gateway` feature).
#[cfg(feature = "gateway")]
pub mod gateway {
    pub use flowpipe_gateway::*;
}

/// Re-export balancer types (requires `balancer` feature).
#[cfg(feature = "balancer")]
pub mod balancer {
    pub use flowpipe_balancer::*;
}
