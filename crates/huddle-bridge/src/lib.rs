//! # huddle-bridge
//!
//! Distributed ingress bridges for the Huddle relay.
//!
//! Each bridge implements [`huddle_core::IngressBridge`] over an external
//! bus so that several relay instances serve the same rooms:
//!
//! - **Redis** - pub/sub channel per room (feature `redis`, default)
//! - **Kafka** - one partition of a topic keyed by room (feature `kafka`)
//!
//! Startup connections go through [`connect_with_retry`].

pub mod retry;

#[cfg(feature = "redis")]
pub mod pubsub;

#[cfg(feature = "kafka")]
pub mod partitioned;

pub use retry::{connect_with_retry, DEFAULT_CONNECT_ATTEMPTS, DEFAULT_CONNECT_DELAY};

#[cfg(feature = "redis")]
pub use pubsub::RedisBridge;

#[cfg(feature = "kafka")]
pub use partitioned::{LogBridge, LogBridgeConfig};
