//! Reference implementations of clusterup's external collaborators
//! (`Backend`, `PackageService`, `KubernetesClient`, `RemoteAgent`) plus
//! the runtime `Config` and telemetry init. None of these interfaces has
//! a real network client yet — these are the in-memory/filesystem
//! stand-ins good enough to drive the engine end-to-end in tests.

pub mod backend;
pub mod config;
pub mod kubernetes;
pub mod package;
pub mod remote;
pub mod telemetry;

pub use backend::{Backend, BackendAvailability, InMemoryClusterBackend, LocalFileBackend};
pub use config::{Config, ConfigBuilder, FileDefaults};
pub use kubernetes::{FakeKubernetesClient, KubernetesClient};
pub use package::{InMemoryPackageService, PackageEnvelope, PackageService};
pub use remote::{RecordingRemoteAgent, RemoteAgent};
