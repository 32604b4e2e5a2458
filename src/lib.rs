//! # cryobus
//!
//! A monitor-and-control (M&C) stack for addressable devices on a CAN-based
//! instrumentation bus, used to operate and test cryogenic receiver front-end
//! hardware.
//!
//! ## Features
//!
//! - **Typed transactions**: monitor (read) and control (write) requests
//!   addressed by node id + relative CAN address (RCA), with typed results
//! - **Pluggable transport**: the core depends on a narrow [`Transport`]
//!   contract, never on adapter-vendor specifics
//! - **Capability composition**: device flavors share a growing command
//!   vocabulary by stacking capability layers instead of inheriting
//! - **Batched sequences**: many transactions submitted together with minimal
//!   per-request overhead, for multi-point bias sweeps
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use cryobus::prelude::*;
//! use cryobus::device::capability::{cold_cartridge, generic_bus, module_controller};
//!
//! // Open a session on one physical adapter (one open session per adapter).
//! let session = Session::open(Box::new(my_transport), 1_000_000).await?;
//! let conn = Arc::new(StandardConnection::new(session.clone()));
//!
//! // Compose a cold cartridge device on node 0x13, cartridge band 3.
//! let dev = Device::compose(conn, 0x13, 3, vec![
//!     generic_bus(),
//!     module_controller(),
//!     cold_cartridge(),
//! ])?;
//!
//! let temps = dev.cartridge_temps().await?;
//! let curve = dev.iv_curve(0, 1, None, None, None).await?;
//! ```
//!
//! ## Layering
//!
//! ```text
//! Device facade           typed methods, port offsets, batch sweeps
//!   └─ Command Registry     name -> (RCA, codec), capability composition
//!        └─ Bus Connection     timeout + retry policy, two implementations
//!             └─ Sequence Runner   ordered, partial-failure batching
//!                  └─ Transaction Codec   pure wire encode/decode
//!                       └─ Transport      physical adapter boundary
//! ```

pub mod core;
pub mod codec;
pub mod bus;
pub mod device;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::bus::connection::{
        BatchedConnection, BusConnection, ConnectionConfig, StandardConnection,
    };
    pub use crate::bus::session::Session;
    pub use crate::bus::transport::Transport;
    pub use crate::core::address::{BusAddress, FrameLayout};
    pub use crate::core::error::{Error, FailureKind, Result};
    pub use crate::core::transaction::{
        Direction, Sequence, Transaction, TransactionOutcome, TransactionResult,
    };
    pub use crate::core::value::Value;
    pub use crate::device::facade::Device;
    pub use crate::device::registry::{Capability, CapabilityLayer, CommandRegistry};
}

// Re-export core types at crate root for convenience
pub use crate::bus::connection::{BatchedConnection, BusConnection, StandardConnection};
pub use crate::bus::session::Session;
pub use crate::bus::transport::Transport;
pub use crate::core::address::{BusAddress, FrameLayout};
pub use crate::core::error::{Error, FailureKind, Result};
pub use crate::core::transaction::{Direction, Sequence, Transaction, TransactionResult};
pub use crate::core::value::Value;
pub use crate::device::facade::Device;
