//! Gatehouse Store Capabilities
//!
//! The gateway's external collaborators - broker publish/subscribe, the
//! consumer-offset coordination store, the topic manager, and the service
//! registry - expressed as capability traits. Every trait has a real-backend
//! integration point and an in-memory dummy; selection is configuration
//! driven, and components receive the stores they use as explicit
//! dependencies.

pub mod error;
pub mod memory;
pub mod traits;
pub mod types;

pub use error::{OffsetError, Result, StoreError};
pub use memory::{
    DummyManager, DummyOffsetStore, DummyPubStore, DummyRegistry, DummySubStore, MemoryBroker,
};
pub use traits::{Lifecycle, ManagerStore, OffsetStore, PubStore, Registry, SubStore};
pub use types::{InstanceInfo, SubMessage};
