//! VM lifecycle core.
//!
//! Starts a VM from a bootc disk image, bridges its network to the host
//! through a user-mode proxy, waits for the remote shell, and tears it down
//! again. State that must survive between invocations lives in the
//! [`Registry`]; liveness is always re-derived from process probes.

pub mod guest_addr;
pub mod hypervisor;
pub mod lifecycle;
pub mod network;
pub mod ports;
pub mod process;
pub mod record;
pub mod registry;
pub mod remote;
pub mod state;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use hypervisor::{HypervisorDriver, LaunchSpec};
pub use lifecycle::{
    Orchestrator, RemovalPlan, StartOutcome, StartPath, StartRequest, StopReport, VmLayout,
    VmStatus,
};
pub use network::{Gvproxy, NetworkProxy, ProxySpec};
pub use record::{ConnectionInfo, VmRecord};
pub use registry::Registry;
pub use state::VmState;
