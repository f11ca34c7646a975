//! Persona application substrate.
//!
//! An application declares its whole component tree once, during the startup
//! epoch, against an [`AppContext`]. Every process runs the same declarations
//! and then dispatches to the persona it plays:
//! - the build persona computes secrets, runs file producers and writes the
//!   deployment manifest
//! - process personas (servers, workers) run one per container
//! - the terminal persona serves commands
//! - with no persona selected, every process persona and then the terminal
//!   run together in one process
//!
//! Components are matched across processes by their [`Id`], never by shared
//! runtime state.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

mod command;
pub mod config;
mod context;
pub mod deploy;
pub mod envfile;
mod epoch;
mod error;
mod files;
mod harness;
mod host;
mod ledger;
mod persona;
mod secret;
mod server;
mod store;
pub mod telemetry;

pub use command::{CommandSet, ParsedArgs};
pub use config::AppConfig;
pub use context::{AppContext, ExecutionMode, RuntimeContext, BUILD_PERSONA_KEY, IN_PROCESS_KEY};
pub use deploy::{DeploymentModel, JsonManifestSink, ManifestSink, ServiceSpec, VolumeMount};
pub use epoch::{ActivePersona, EpochHandle, EpochState, Running, Startup};
pub use error::{PersonaError, PersonaResult};
pub use files::{BuildFile, FileRegistry, Producer};
pub use host::HostKind;
pub use ledger::{PasswordLedger, PortAllocator, DEFAULT_PORT_BASE};
pub use persona::{entry_point, EntryFuture, EntryPoint, Persona, PersonaRegistry};
pub use persona_identity::Id;
pub use secret::{secret_env_var, Secret, SecretRegistry};
pub use server::ServerHandle;
pub use store::PersistentStore;
