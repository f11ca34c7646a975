//! Deployment model and manifest sinks.
//!
//! The model is assembled during startup from persona and database
//! declarations. A [`ManifestSink`] turns it into orchestration files during
//! the build phase.

use crate::config::PERSONA_ENV;
use crate::error::{PersonaError, PersonaResult};
use crate::persona::Persona;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// File written by [`JsonManifestSink`] inside the build directory.
pub const MANIFEST_FILE: &str = "deployment.json";

/// Named volume mounted into a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub volume: String,
    pub target: String,
}

/// One deployable service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,

    /// Prebuilt image; `None` means the application's own image
    pub image: Option<String>,

    /// Static environment, merged with the secret environment on emission
    pub environment: BTreeMap<String, String>,

    /// Secret variables holding published port numbers
    pub port_secrets: Vec<String>,

    /// Container variables set to the decoded value of a secret variable
    pub secret_env: BTreeMap<String, String>,

    pub volumes: Vec<VolumeMount>,
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Service running the application image as `persona`.
    pub fn for_persona(persona: &Persona) -> Self {
        Self::new(persona.key.clone()).with_env(PERSONA_ENV, persona.key.clone())
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_secret_env(mut self, key: impl Into<String>, secret_var: impl Into<String>) -> Self {
        self.secret_env.insert(key.into(), secret_var.into());
        self
    }

    pub fn with_volume(mut self, volume: impl Into<String>, target: impl Into<String>) -> Self {
        self.volumes.push(VolumeMount {
            volume: volume.into(),
            target: target.into(),
        });
        self
    }
}

/// Services and volumes of the whole application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentModel {
    services: BTreeMap<String, ServiceSpec>,
    volumes: BTreeSet<String>,
}

impl DeploymentModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_service(&mut self, spec: ServiceSpec) -> PersonaResult<()> {
        if self.services.contains_key(&spec.name) {
            return Err(PersonaError::DuplicateService(spec.name));
        }
        self.services.insert(spec.name.clone(), spec);
        Ok(())
    }

    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.get(name)
    }

    pub fn service_mut(&mut self, name: &str) -> Option<&mut ServiceSpec> {
        self.services.get_mut(name)
    }

    pub fn services(&self) -> impl Iterator<Item = &ServiceSpec> {
        self.services.values()
    }

    pub fn add_volume(&mut self, name: impl Into<String>) {
        self.volumes.insert(name.into());
    }

    pub fn volumes(&self) -> impl Iterator<Item = &str> {
        self.volumes.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// Consumes the deployment model during the build phase.
pub trait ManifestSink: Send + Sync {
    /// Write manifests for `model`. `secrets` maps environment variable names
    /// to JSON-encoded values. Returns every path written.
    fn emit(
        &self,
        model: &DeploymentModel,
        secrets: &BTreeMap<String, String>,
        build_dir: &Path,
    ) -> PersonaResult<Vec<PathBuf>>;
}

#[derive(Debug, Serialize)]
struct ManifestService<'a> {
    image: Option<&'a str>,
    environment: BTreeMap<&'a str, String>,
    ports: Vec<u16>,
    volumes: &'a [VolumeMount],
}

#[derive(Debug, Serialize)]
struct Manifest<'a> {
    services: BTreeMap<&'a str, ManifestService<'a>>,
    volumes: Vec<&'a str>,
}

/// Writes `<build_dir>/deployment.json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonManifestSink;

impl ManifestSink for JsonManifestSink {
    fn emit(
        &self,
        model: &DeploymentModel,
        secrets: &BTreeMap<String, String>,
        build_dir: &Path,
    ) -> PersonaResult<Vec<PathBuf>> {
        let mut services = BTreeMap::new();
        for spec in model.services() {
            let mut environment: BTreeMap<&str, String> = secrets
                .iter()
                .map(|(k, v)| (k.as_str(), v.clone()))
                .collect();
            for (key, secret_var) in &spec.secret_env {
                environment.insert(key.as_str(), decode_secret(secret_var, secrets)?);
            }
            environment.extend(spec.environment.iter().map(|(k, v)| (k.as_str(), v.clone())));

            let ports = spec
                .port_secrets
                .iter()
                .map(|name| resolve_port(name, secrets))
                .collect::<PersonaResult<Vec<_>>>()?;

            services.insert(
                spec.name.as_str(),
                ManifestService {
                    image: spec.image.as_deref(),
                    environment,
                    ports,
                    volumes: &spec.volumes,
                },
            );
        }

        let manifest = Manifest {
            services,
            volumes: model.volumes().collect(),
        };
        std::fs::create_dir_all(build_dir)?;
        let path = build_dir.join(MANIFEST_FILE);
        std::fs::write(&path, serde_json::to_vec_pretty(&manifest)?)?;
        Ok(vec![path])
    }
}

/// Raw text of a secret: strings lose their JSON quoting.
fn decode_secret(name: &str, secrets: &BTreeMap<String, String>) -> PersonaResult<String> {
    let raw = secrets
        .get(name)
        .ok_or_else(|| PersonaError::Config(format!("secret `{name}` was not resolved")))?;
    Ok(match serde_json::from_str::<serde_json::Value>(raw)? {
        serde_json::Value::String(text) => text,
        _ => raw.clone(),
    })
}

fn resolve_port(name: &str, secrets: &BTreeMap<String, String>) -> PersonaResult<u16> {
    let raw = secrets
        .get(name)
        .ok_or_else(|| PersonaError::Config(format!("port secret `{name}` was not resolved")))?;
    Ok(serde_json::from_str(raw)?)
}
