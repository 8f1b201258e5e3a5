//! Transaction-processing middleware core: coordinator, resource
//! proxies and the transport that connects them.
//!
//! A domain is a set of processes wired together through an immutable
//! [`transport::Endpoints`] registry: one [`manager::Manager`] owning
//! the transaction table and the durable decision [`log::Log`], and one
//! [`resource::ResourceProxy`] per resource-manager instance bridging
//! the coordinator to the XA switch. Subordinate domains participate as
//! single branches through the domain directives of the wire protocol in
//! `xatmi-core`.
//!
//! # Example
//!
//! ```no_run
//! use xatmi_core::protocol::ProcessHandle;
//! use xatmi_tm::config::{ManagerConfig, ResourceConfig};
//! use xatmi_tm::log::{InMemoryStore, Log};
//! use xatmi_tm::manager::Manager;
//! use xatmi_tm::transport::{Endpoints, Transport};
//!
//! # async fn demo() -> xatmi_core::Result<()> {
//! let config = ManagerConfig::builder()
//!     .resource(ResourceConfig::new("accounts").openinfo("db=accounts"))
//!     .build()
//!     .expect("valid config");
//!
//! let mut endpoints = Endpoints::builder();
//! let inbound = endpoints.register(ProcessHandle::random());
//! let transport = Transport::new(endpoints.build());
//!
//! let mut manager = Manager::new(
//!     &config,
//!     Log::new(InMemoryStore::new()),
//!     transport,
//!     inbound,
//! );
//! let trid = manager.begin()?;
//! manager.commit(&trid).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod coordinate;
pub mod log;
pub mod manager;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod resource;
pub mod transport;

pub use config::{ConfigError, ManagerConfig, ResourceConfig};
pub use coordinate::Coordinate;
pub use log::{Decision, FileStore, InMemoryStore, Log, LogEntry, LogStore};
pub use manager::{AdminSnapshot, Manager, Outbound, Participant, Stage};
pub use resource::{ProxyState, ResourceProxy, XaSwitch};
pub use transport::{Endpoints, EndpointsBuilder, Inbound, Transport};
