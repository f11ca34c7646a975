//! Personas and the per-context persona registry.

use crate::context::RuntimeContext;
use crate::error::{PersonaError, PersonaResult};
use crate::host::HostKind;
use futures::future::BoxFuture;
use persona_identity::Id;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Future returned by an entry point.
pub type EntryFuture = BoxFuture<'static, anyhow::Result<()>>;

/// Persona behavior, invoked once the persona is selected.
pub type EntryPoint = Arc<dyn Fn(RuntimeContext) -> EntryFuture + Send + Sync>;

/// Box an async closure into an [`EntryPoint`].
pub fn entry_point<F, Fut>(f: F) -> EntryPoint
where
    F: Fn(RuntimeContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |rt| Box::pin(f(rt)))
}

/// A named bundle of host kind and entry point.
#[derive(Clone)]
pub struct Persona {
    pub id: Id,
    pub host: HostKind,
    pub key: String,
    pub(crate) entry: Option<EntryPoint>,
}

impl Persona {
    /// Persona keyed by the id's safe name.
    pub fn new(id: Id, host: HostKind, entry: Option<EntryPoint>) -> Self {
        let key = id.to_safe_name();
        Self {
            id,
            host,
            key,
            entry,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn has_entry(&self) -> bool {
        self.entry.is_some()
    }
}

impl fmt::Debug for Persona {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Persona")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("key", &self.key)
            .field("entry", &self.entry.is_some())
            .finish()
    }
}

/// Registry of every persona declared in one application context.
#[derive(Debug, Default)]
pub struct PersonaRegistry {
    by_key: BTreeMap<String, Persona>,
    terminal: Option<String>,
}

impl PersonaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a persona. Keys are unique; at most one terminal persona.
    pub fn register(&mut self, persona: Persona) -> PersonaResult<()> {
        if self.by_key.contains_key(&persona.key) {
            return Err(PersonaError::DuplicatePersona(persona.key));
        }
        if persona.host == HostKind::Terminal {
            if let Some(existing) = &self.terminal {
                return Err(PersonaError::DuplicateTerminal {
                    existing: existing.clone(),
                });
            }
            self.terminal = Some(persona.key.clone());
        }
        self.by_key.insert(persona.key.clone(), persona);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Persona> {
        self.by_key.get(key)
    }

    pub fn find_by_id(&self, id: &Id) -> Option<&Persona> {
        self.by_key.values().find(|p| &p.id == id)
    }

    pub fn terminal(&self) -> Option<&Persona> {
        self.terminal.as_deref().and_then(|key| self.by_key.get(key))
    }

    /// Personas of one host kind, in key order.
    pub fn of_kind(&self, host: HostKind) -> impl Iterator<Item = &Persona> {
        self.by_key.values().filter(move |p| p.host == host)
    }

    pub fn keys(&self) -> Vec<String> {
        self.by_key.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}
