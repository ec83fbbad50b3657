//! Supervised broker for a privileged network-interface helper process.
//!
//! The broker spawns the helper through a restricted-privilege launcher,
//! owns its stdin/stdout byte channel, and mediates two traffic kinds over
//! it: request/response commands (interface enumeration, status, link
//! up/down, address configuration) and unsolicited link-change events
//! fanned out to per-interface subscribers.
//!
//! One command is in flight at a time; concurrent callers queue and are
//! served in order. The worker treats a response timeout, channel EOF, or
//! unexpected helper exit as fatal and terminates, leaving restart policy
//! to whatever supervises the worker.
//!
//! ```no_run
//! use ifbroker::{Options, WorkerConfig};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let handle = ifbroker::start(WorkerConfig::new(
//!     "/usr/lib/ifbroker/launcher",
//!     "/usr/lib/ifbroker/helper",
//! ))?;
//!
//! let mut events = handle.subscribe("eth0");
//! handle.setup("eth0", Options {
//!     ipv4_address: Some("192.168.1.10".to_string()),
//!     ipv4_subnet_mask: Some("255.255.255.0".to_string()),
//!     ..Options::default()
//! }).await?;
//! handle.ifup("eth0").await?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("eth0: {}", event.tag());
//! }
//! # Ok(())
//! # }
//! ```

pub mod bridge;
mod config;
mod registry;
mod worker;

pub use bridge::protocol::{
    Command, IfIdentity, InterfaceKind, Notification, OperState, Options, Response, Settings,
    Stats, Status,
};
pub use bridge::transport::{Channel, HelperSpawner, LauncherSpawner, SpawnError};
pub use config::{DEFAULT_CALL_TIMEOUT, ManagedInterfaces, WorkerConfig};
pub use registry::{Subscription, SubscriptionRegistry};
pub use worker::{CallError, Termination, WorkerHandle, start, start_with_channel};
