//! # PVC Drivers
//!
//! Abstraction layer over the external collaborators the coordination
//! core drives: the hypervisor, the host network stack, the replicated
//! block store, and the out-of-band fence controller.
//!
//! Every driver is an async trait. Mock backends simulate all four in
//! memory for `--dev` mode and the test suite; the `system` backends
//! shell out to the host tools (virsh, ip, bridge, rbd, ipmitool)
//! through a shared bounded-deadline command runner.

pub mod command;
pub mod error;
pub mod mock;
pub mod system;
pub mod traits;
pub mod types;

pub use error::{DriverError, Result};
pub use mock::{MockFence, MockHypervisor, MockNetwork, MockStorage};
pub use traits::{FenceDriver, HypervisorDriver, NetworkDriver, StorageDriver};
pub use types::{
    bridge_device, DomainRuntimeState, DomainSpec, IpmiCredentials, FENCE_DEADLINE,
    NETWORK_OP_DEADLINE, STORAGE_OP_DEADLINE, VM_MIGRATE_DEADLINE, VM_START_DEADLINE,
};
