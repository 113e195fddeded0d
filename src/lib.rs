//! glasshouse: on-demand GPU VM session launcher.
//!
//! Two cooperating processes share this library:
//!
//! - the **client orchestrator** (`glasshouse`) runs on the virtualization
//!   host: it hibernates sibling machines competing for the GPU, reconciles
//!   USB passthrough, boots the target machine, asks the in-guest agent to
//!   launch the application, and hands the session to the remote-display
//!   client once the guest signals readiness;
//! - the **guest side** (`glasshouse-agentd` + `glasshouse-watch`) runs
//!   inside the target machine: the agent daemon exposes the guest control
//!   plane, the watcher waits for the application's window to become
//!   interactive and reports readiness, liveness and termination back.
//!
//! The two sides talk over two narrow HTTP channels (see `control`); all
//! waiting is bounded polling, matching the slow and occasionally flaky
//! behaviour of the underlying hypervisor and window-manager APIs.

pub mod agent;
pub mod config;
pub mod control;
pub mod hibernate;
pub mod httpc;
pub mod logging;
pub mod process;
pub mod progress;
pub mod session;
pub mod usb;
pub mod virt;

/// Default control-plane port on both sides when the configuration does not
/// override it.
pub const DEFAULT_CONTROL_PORT: u16 = 5000;
