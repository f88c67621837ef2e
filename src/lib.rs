//! # DTN - Delay/Disruption Tolerant Networking
//!
//! A store-and-forward networking stack for intermittently connected,
//! high-latency environments, in pure RUST
//!
//! # Specifications
//!
//! | Document      | Title      | Link       |
//! | ------------- | ------------- | ------------- |
//! | RFC 5050 | Bundle Protocol Specification | <https://www.rfc-editor.org/rfc/rfc5050.html> |
//! | RFC 5326 | Licklider Transmission Protocol | <https://www.rfc-editor.org/rfc/rfc5326.html> |
//! | CCSDS 734.2-B-1 | CCSDS Bundle Protocol Specification | <https://public.ccsds.org/Pubs/734x2b1.pdf> |
//! | CCSDS 734.1-B-1 | Licklider Transmission Protocol for CCSDS | <https://public.ccsds.org/Pubs/734x1b1.pdf> |
//!
//! The stack is layered bottom-up: a transactional durable heap
//! ([`store`]) holds all protocol state; zero-copy objects ([`zco`])
//! thread application payloads through the protocol layers without
//! copying; LTP ([`ltp`]) moves blocks reliably across one high-latency
//! hop; BP ([`bp`]) routes bundles end to end over LTP and TCP
//! convergence layers. The [`ipc`] substrate supplies the semaphores,
//! shared memory, and task registry the daemons coordinate through.

#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(warnings))]

pub mod bp;
pub mod common;
pub mod ipc;
pub mod ltp;
pub mod store;
/// Command-line and auxiliary tooling support.
pub mod tools;
pub mod zco;

pub use crate::tools::error;

#[cfg(test)]
mod tests {
    pub fn init() {
        std::env::set_var("RUST_LOG", "debug");
        env_logger::builder().is_test(true).try_init().ok();
    }
}
