//! # artifactctl-follower
//!
//! Keeps installed artifacts in sync with their registries.
//!
//! A follow session resolves each reference through the index cache, fetches
//! the engine's reported versions once, then runs one [`Follower`] task per
//! reference under a [`Supervisor`]:
//!
//! ```text
//! Created -> Scheduled -> Checking -> Installing -> Sleeping -> Scheduled ...
//!                              \-> Sleeping (unchanged or incompatible)
//! shutdown -> Stopping -> Stopped
//! ```

pub mod backoff;
pub mod config;
pub mod deps;
pub mod error;
pub mod follower;
pub mod gate;
pub mod schedule;
pub mod session;
pub mod supervisor;
pub mod versions;

pub use backoff::{BackoffConfig, BackoffError, BackoffTransport, Transport, TransportResponse};
pub use config::Config;
pub use deps::{
    resolve_dependencies, ConfigResolver, DependencyError, RegistryConfigResolver, ResolvedArtifact,
};
pub use error::FollowError;
pub use follower::{
    ArtifactSource, CheckOutcome, Follower, FollowerConfig, FollowerPhase, FollowerReport,
    RegistrySource, Release,
};
pub use gate::{check_requirements, CompatibilityError};
pub use schedule::{parse_duration, Schedule, ScheduleError};
pub use session::{run_follow, signature_policy, FollowSession};
pub use supervisor::{wait_for_shutdown, CompletionCounter, Supervisor, SupervisorError};
pub use versions::{fetch_engine_versions, EngineVersions, VersionsError};
