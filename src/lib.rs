//! A small SSH daemon with a policy core: a static user table, a capability
//! gate answering authentication and forwarding requests, a session dispatcher
//! for shells, commands and reachability probes, and graceful shutdown.

pub mod config;
pub mod credentials;
pub mod error;
pub mod policy;
pub mod probe;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod task;

pub use config::DaemonConfig;
pub use credentials::{CredentialStore, Identity, IdentityRecord};
pub use error::{ListenerError, LoadError, ProbeError, SessionError};
pub use policy::{AuthenticationPolicy, CapabilityGate, ForwardPolicy};
pub use session::{classify, Classification, Dispatcher, SessionOutcome, SessionOutput, SessionRequest};
pub use shutdown::ShutdownCoordinator;
