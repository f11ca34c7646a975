//! Host kinds: the execution environment a persona expects.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a persona's entry point runs.
///
/// This is a closed set; every consumer matches it exhaustively so that a new
/// host kind forces each decision site to be revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKind {
    /// Long-running standalone process (server, worker).
    Process,
    /// The single interactive command-line session.
    Terminal,
    /// One-shot command invocation.
    Command,
    /// Build-time process emitting deployment artifacts.
    Build,
    /// Infrastructure-only node with nothing to execute.
    Placeholder,
}

impl HostKind {
    /// Whether a process of this kind receives secrets through its environment.
    pub fn receives_env(self) -> bool {
        match self {
            HostKind::Process | HostKind::Terminal | HostKind::Command => true,
            HostKind::Build | HostKind::Placeholder => false,
        }
    }

    /// Whether this kind is packaged as its own deployable service.
    pub fn is_deployable(self) -> bool {
        match self {
            HostKind::Process => true,
            HostKind::Terminal | HostKind::Command | HostKind::Build | HostKind::Placeholder => {
                false
            }
        }
    }

    /// Whether dispatching to this kind can execute anything.
    pub fn is_runnable(self) -> bool {
        match self {
            HostKind::Placeholder => false,
            HostKind::Process | HostKind::Terminal | HostKind::Command | HostKind::Build => true,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HostKind::Process => "process",
            HostKind::Terminal => "terminal",
            HostKind::Command => "command",
            HostKind::Build => "build",
            HostKind::Placeholder => "placeholder",
        }
    }
}

impl fmt::Display for HostKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
