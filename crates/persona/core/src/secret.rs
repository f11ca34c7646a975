//! Secret routing.
//!
//! A secret is computed once by the build persona and delivered to every other
//! persona through an environment variable holding its JSON encoding. An
//! in-process run computes its secrets itself.

use crate::epoch::EpochHandle;
use crate::error::{PersonaError, PersonaResult};
use crate::host::HostKind;
use persona_identity::Id;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};
use tracing::debug;

type Compute = Box<dyn Fn() -> PersonaResult<Value> + Send + Sync>;

/// Environment variable name carrying the secret bound to `id`.
pub fn secret_env_var(id: &Id) -> String {
    id.to_safe_name().to_ascii_uppercase()
}

pub(crate) struct SecretCell {
    id: Id,
    env_var: String,
    compute: Compute,
    memo: OnceLock<Value>,
}

impl SecretCell {
    fn build_value(&self) -> PersonaResult<Value> {
        if let Some(value) = self.memo.get() {
            return Ok(value.clone());
        }
        let value = (self.compute)()?;
        Ok(self.memo.get_or_init(|| value).clone())
    }

    fn env_value(&self) -> PersonaResult<Value> {
        let raw = std::env::var(&self.env_var).map_err(|_| PersonaError::MissingSecret {
            id: self.id.to_string(),
            variable: self.env_var.clone(),
        })?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Typed handle to a declared secret.
pub struct Secret<T> {
    cell: Arc<SecretCell>,
    epoch: EpochHandle,
    _type: PhantomData<fn() -> T>,
}

impl<T> Clone for Secret<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
            epoch: self.epoch.clone(),
            _type: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("id", &self.cell.id)
            .field("env_var", &self.cell.env_var)
            .finish()
    }
}

impl<T: DeserializeOwned> Secret<T> {
    pub fn id(&self) -> &Id {
        &self.cell.id
    }

    pub fn env_var(&self) -> &str {
        &self.cell.env_var
    }

    /// Resolve the value for the current persona.
    pub fn get(&self) -> PersonaResult<T> {
        let persona = self.epoch.assert_not_startup("Secret::get")?;
        let value = match persona.host {
            HostKind::Build => self.cell.build_value()?,
            HostKind::Process | HostKind::Terminal | HostKind::Command
                if self.epoch.is_in_process() =>
            {
                self.cell.build_value()?
            }
            HostKind::Process | HostKind::Terminal | HostKind::Command => {
                self.cell.env_value()?
            }
            HostKind::Placeholder => {
                return Err(PersonaError::SecretUnavailable { host: persona.host })
            }
        };
        Ok(serde_json::from_value(value)?)
    }
}

/// Secrets declared in one context, keyed by environment variable.
#[derive(Default)]
pub struct SecretRegistry {
    by_env: BTreeMap<String, Arc<SecretCell>>,
}

impl SecretRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn declare<T>(
        &mut self,
        id: Id,
        compute: Compute,
        epoch: EpochHandle,
    ) -> PersonaResult<Secret<T>> {
        let env_var = secret_env_var(&id);
        if self.by_env.contains_key(&env_var) {
            return Err(PersonaError::DuplicateSecret(env_var));
        }
        debug!(secret = %id, env = %env_var, "declared secret");
        let cell = Arc::new(SecretCell {
            id,
            env_var: env_var.clone(),
            compute,
            memo: OnceLock::new(),
        });
        self.by_env.insert(env_var, Arc::clone(&cell));
        Ok(Secret {
            cell,
            epoch,
            _type: PhantomData,
        })
    }

    /// Compute every secret and return `env var -> JSON text`.
    pub(crate) fn resolve_all(&self) -> PersonaResult<BTreeMap<String, String>> {
        self.by_env
            .iter()
            .map(|(name, cell)| {
                let value = cell.build_value()?;
                Ok((name.clone(), serde_json::to_string(&value)?))
            })
            .collect()
    }

    pub fn env_vars(&self) -> Vec<String> {
        self.by_env.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.by_env.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_env.is_empty()
    }
}

impl fmt::Debug for SecretRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretRegistry")
            .field("env_vars", &self.by_env.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch::ActivePersona;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn enter(epoch: &EpochHandle, host: HostKind) {
        epoch
            .enter(ActivePersona {
                id: Id::root("app").child("p"),
                key: "p".to_string(),
                host,
            })
            .unwrap();
    }

    fn constant(value: Value) -> Compute {
        Box::new(move || Ok(value.clone()))
    }

    #[test]
    fn env_var_is_upper_safe_name() {
        let id = Id::root("shop").child("db").child("password");
        let name = secret_env_var(&id);
        assert_eq!(name, id.to_safe_name().to_ascii_uppercase());
        assert!(name.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_'));
    }

    #[test]
    fn duplicate_env_var_is_rejected() {
        let epoch = EpochHandle::new();
        let mut registry = SecretRegistry::new();
        let id = Id::root("shop").child("token");
        registry
            .declare::<String>(id.clone(), constant(Value::from("a")), epoch.clone())
            .unwrap();
        let err = registry
            .declare::<String>(id, constant(Value::from("b")), epoch)
            .unwrap_err();
        assert!(matches!(err, PersonaError::DuplicateSecret(_)));
    }

    #[test]
    fn build_persona_computes_once() {
        let epoch = EpochHandle::new();
        let mut registry = SecretRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let secret = registry
            .declare::<u16>(
                Id::root("shop").child("port"),
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::from(5001))
                }),
                epoch.clone(),
            )
            .unwrap();

        assert!(matches!(secret.get(), Err(PersonaError::Epoch { .. })));

        enter(&epoch, HostKind::Build);
        assert_eq!(secret.get().unwrap(), 5001);
        assert_eq!(secret.get().unwrap(), 5001);
        let resolved = registry.resolve_all().unwrap();
        assert_eq!(resolved.get(secret.env_var()).map(String::as_str), Some("5001"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn placeholder_cannot_read_secrets() {
        let epoch = EpochHandle::new();
        let mut registry = SecretRegistry::new();
        let secret = registry
            .declare::<String>(
                Id::root("shop").child("placeholder-secret"),
                constant(Value::from("x")),
                epoch.clone(),
            )
            .unwrap();
        enter(&epoch, HostKind::Placeholder);
        assert!(matches!(
            secret.get(),
            Err(PersonaError::SecretUnavailable {
                host: HostKind::Placeholder
            })
        ));
    }

    #[test]
    fn in_process_run_computes_instead_of_reading_environment() {
        let epoch = EpochHandle::new();
        let mut registry = SecretRegistry::new();
        let secret = registry
            .declare::<u16>(
                Id::root("secret-in-process-test").child("port"),
                constant(Value::from(5007)),
                epoch.clone(),
            )
            .unwrap();
        std::env::remove_var(secret.env_var());

        epoch
            .enter_in_process(ActivePersona {
                id: Id::root("secret-in-process-test").child("in-process"),
                key: "in_process".to_string(),
                host: HostKind::Process,
            })
            .unwrap();
        assert_eq!(secret.get().unwrap(), 5007);
    }

    #[test]
    fn process_reads_environment() {
        let epoch = EpochHandle::new();
        let mut registry = SecretRegistry::new();
        let present = registry
            .declare::<Vec<String>>(
                Id::root("secret-routing-test").child("present"),
                constant(Value::Null),
                epoch.clone(),
            )
            .unwrap();
        let missing = registry
            .declare::<String>(
                Id::root("secret-routing-test").child("missing"),
                constant(Value::Null),
                epoch.clone(),
            )
            .unwrap();
        std::env::set_var(present.env_var(), r#"["a","b"]"#);
        std::env::remove_var(missing.env_var());

        enter(&epoch, HostKind::Process);
        assert_eq!(present.get().unwrap(), vec!["a".to_string(), "b".to_string()]);
        match missing.get() {
            Err(PersonaError::MissingSecret { variable, .. }) => {
                assert_eq!(variable, missing.env_var())
            }
            other => panic!("expected MissingSecret, got {other:?}"),
        }
    }
}
