//! Execution epochs.
//!
//! A process starts in the startup epoch, where the component tree is
//! declared identically in every environment. Dispatch moves it, exactly
//! once, into the runtime epoch of a single persona.
//!
//! The epoch is tracked twice: statically through the [`Startup`]/[`Running`]
//! marker on [`AppContext`](crate::AppContext), and dynamically through an
//! [`EpochHandle`] that long-lived handles (stores, secrets, indexes) carry
//! and check on every call.

use crate::error::{PersonaError, PersonaResult};
use crate::host::HostKind;
use persona_identity::Id;
use std::sync::{Arc, OnceLock};

mod sealed {
    pub trait Sealed {}
}

/// Type-level epoch marker.
pub trait EpochState: sealed::Sealed {}

/// Declarations are legal; nothing runs yet.
#[derive(Debug)]
pub enum Startup {}

/// A persona has been selected; declarations are over.
#[derive(Debug)]
pub enum Running {}

impl sealed::Sealed for Startup {}
impl sealed::Sealed for Running {}
impl EpochState for Startup {}
impl EpochState for Running {}

/// The persona selected for this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivePersona {
    pub id: Id,
    pub key: String,
    pub host: HostKind,
}

#[derive(Debug)]
struct Selection {
    persona: ActivePersona,
    in_process: bool,
}

/// Shared, set-once marker of the current persona.
#[derive(Debug, Clone, Default)]
pub struct EpochHandle {
    current: Arc<OnceLock<Selection>>,
}

impl EpochHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// The selected persona, or `None` during startup.
    pub fn current(&self) -> Option<&ActivePersona> {
        self.current.get().map(|selection| &selection.persona)
    }

    pub fn is_startup(&self) -> bool {
        self.current.get().is_none()
    }

    /// Whether every persona runs together in this process. Such a run owns
    /// the build state itself instead of reading it from the environment.
    pub fn is_in_process(&self) -> bool {
        self.current.get().is_some_and(|selection| selection.in_process)
    }

    /// Leave the startup epoch. Fails if a persona was already selected.
    pub(crate) fn enter(&self, persona: ActivePersona) -> PersonaResult<()> {
        self.select(persona, false)
    }

    /// Leave the startup epoch for an in-process run of every persona.
    pub(crate) fn enter_in_process(&self, persona: ActivePersona) -> PersonaResult<()> {
        self.select(persona, true)
    }

    fn select(&self, persona: ActivePersona, in_process: bool) -> PersonaResult<()> {
        self.current
            .set(Selection {
                persona,
                in_process,
            })
            .map_err(|_| PersonaError::AlreadyDispatched)
    }

    /// Guard for declaration-only operations.
    pub fn assert_startup_time(&self, operation: &str) -> PersonaResult<()> {
        if self.is_startup() {
            Ok(())
        } else {
            Err(epoch_error("startup", operation))
        }
    }

    /// Guard for operations that only make sense once a persona is selected.
    pub fn assert_not_startup(&self, operation: &str) -> PersonaResult<&ActivePersona> {
        self.current()
            .ok_or_else(|| epoch_error("runtime", operation))
    }

    /// Like [`assert_not_startup`](Self::assert_not_startup), and the persona
    /// must be able to execute.
    pub fn assert_runtime(&self, operation: &str) -> PersonaResult<&ActivePersona> {
        let persona = self.assert_not_startup(operation)?;
        if persona.host.is_runnable() {
            Ok(persona)
        } else {
            Err(epoch_error("runtime", operation))
        }
    }

    /// Guard for build-state operations: the build persona, or an in-process
    /// run standing in for it.
    pub fn assert_build_time(&self, operation: &str) -> PersonaResult<&ActivePersona> {
        match self.current.get() {
            Some(Selection { persona, .. }) if persona.host == HostKind::Build => Ok(persona),
            Some(Selection {
                persona,
                in_process: true,
            }) => Ok(persona),
            _ => Err(epoch_error("build", operation)),
        }
    }
}

fn epoch_error(expected: &'static str, operation: &str) -> PersonaError {
    PersonaError::Epoch {
        expected,
        operation: operation.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn persona(host: HostKind) -> ActivePersona {
        ActivePersona {
            id: Id::root("app").child("p"),
            key: "p".to_string(),
            host,
        }
    }

    #[test]
    fn startup_guards_before_dispatch() {
        let epoch = EpochHandle::new();
        assert!(epoch.assert_startup_time("declare").is_ok());
        assert!(matches!(
            epoch.assert_runtime("get"),
            Err(PersonaError::Epoch { expected: "runtime", .. })
        ));
        assert!(epoch.assert_build_time("write").is_err());
    }

    #[test]
    fn runtime_guards_after_dispatch() {
        let epoch = EpochHandle::new();
        epoch.enter(persona(HostKind::Process)).unwrap();
        assert!(matches!(
            epoch.assert_startup_time("declare"),
            Err(PersonaError::Epoch { expected: "startup", .. })
        ));
        assert_eq!(epoch.assert_runtime("get").unwrap().key, "p");
        assert!(epoch.assert_build_time("write").is_err());
    }

    #[test]
    fn marker_is_set_once() {
        let epoch = EpochHandle::new();
        epoch.enter(persona(HostKind::Build)).unwrap();
        assert!(matches!(
            epoch.enter(persona(HostKind::Process)),
            Err(PersonaError::AlreadyDispatched)
        ));
        assert_eq!(epoch.current().unwrap().host, HostKind::Build);
    }

    #[test]
    fn in_process_run_owns_build_state() {
        let single = EpochHandle::new();
        single.enter(persona(HostKind::Process)).unwrap();
        assert!(!single.is_in_process());
        assert!(single.assert_build_time("write").is_err());

        let together = EpochHandle::new();
        together.enter_in_process(persona(HostKind::Process)).unwrap();
        assert!(together.is_in_process());
        assert_eq!(together.assert_build_time("write").unwrap().key, "p");
        assert!(matches!(
            together.enter(persona(HostKind::Build)),
            Err(PersonaError::AlreadyDispatched)
        ));
    }

    #[test]
    fn placeholder_cannot_run() {
        let epoch = EpochHandle::new();
        epoch.enter(persona(HostKind::Placeholder)).unwrap();
        assert!(epoch.assert_not_startup("inspect").is_ok());
        assert!(epoch.assert_runtime("get").is_err());
    }
}
