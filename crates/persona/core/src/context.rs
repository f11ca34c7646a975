//! Application context: the component tree declared during startup.
//!
//! One [`AppContext`] owns every registry for one application. The same
//! declaration code runs in every process; [`AppContext::dispatch`] then picks
//! the persona this process plays and moves the context into the runtime
//! epoch.

use crate::config::AppConfig;
use crate::deploy::{DeploymentModel, JsonManifestSink, ManifestSink, ServiceSpec};
use crate::epoch::{ActivePersona, EpochHandle, EpochState, Running, Startup};
use crate::error::{PersonaError, PersonaResult};
use crate::files::{BuildFile, FileRegistry, Producer};
use crate::host::HostKind;
use crate::ledger::{PasswordLedger, PortAllocator};
use crate::persona::{entry_point, Persona, PersonaRegistry};
use crate::secret::{Secret, SecretRegistry};
use crate::store::{PersistentStore, StoreState};
use futures::future::BoxFuture;
use persona_identity::Id;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Registry key of the built-in build persona.
pub const BUILD_PERSONA_KEY: &str = "build";

/// Registry key reported while every persona runs in one process.
pub const IN_PROCESS_KEY: &str = "in_process";

/// How the application is laid out across processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Every persona shares one process; infrastructure is in memory.
    InProcess,
    /// One persona per process, wired from the deployment manifest.
    Distributed,
}

pub(crate) type TeardownFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

pub(crate) struct TeardownHook {
    pub(crate) name: String,
    pub(crate) hook: TeardownFn,
}

pub(crate) type BackgroundSet = Arc<Mutex<JoinSet<(String, anyhow::Result<()>)>>>;

/// What `run` will execute.
#[derive(Clone)]
pub(crate) enum Launch {
    InProcess(ActivePersona),
    Single(Persona),
}

impl Launch {
    pub(crate) fn active(&self) -> ActivePersona {
        match self {
            Launch::InProcess(active) => active.clone(),
            Launch::Single(persona) => ActivePersona {
                id: persona.id.clone(),
                key: persona.key.clone(),
                host: persona.host,
            },
        }
    }
}

pub(crate) struct Inner {
    pub(crate) root: Id,
    pub(crate) config: Arc<AppConfig>,
    pub(crate) mode: ExecutionMode,
    pub(crate) epoch: EpochHandle,
    pub(crate) personas: PersonaRegistry,
    pub(crate) files: FileRegistry,
    pub(crate) secrets: SecretRegistry,
    pub(crate) deployment: DeploymentModel,
    pub(crate) teardown: Vec<TeardownHook>,
    pub(crate) sink: Box<dyn ManifestSink>,
    pub(crate) ports: PortAllocator,
    pub(crate) passwords: PasswordLedger,
    pub(crate) launch: Option<Launch>,
}

/// Application context in epoch `S`.
pub struct AppContext<S: EpochState = Startup> {
    pub(crate) inner: Box<Inner>,
    _state: PhantomData<S>,
}

impl<S: EpochState> AppContext<S> {
    pub fn root(&self) -> &Id {
        &self.inner.root
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn mode(&self) -> ExecutionMode {
        self.inner.mode
    }

    /// Shared epoch marker, for handles that check the epoch themselves.
    pub fn epoch(&self) -> EpochHandle {
        self.inner.epoch.clone()
    }

    pub fn personas(&self) -> &PersonaRegistry {
        &self.inner.personas
    }

    pub fn files(&self) -> &FileRegistry {
        &self.inner.files
    }

    pub fn secrets(&self) -> &SecretRegistry {
        &self.inner.secrets
    }

    pub fn deployment(&self) -> &DeploymentModel {
        &self.inner.deployment
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.inner.ports
    }

    pub fn passwords(&self) -> &PasswordLedger {
        &self.inner.passwords
    }

    pub fn build_dir(&self) -> &Path {
        &self.inner.config.build_dir
    }
}

impl AppContext<Startup> {
    /// Fresh context with the build persona and the port/password ledgers
    /// already declared.
    pub fn new(config: AppConfig) -> PersonaResult<Self> {
        let root = Id::root(&config.app_name);
        let mode = if config.persona.is_some() {
            ExecutionMode::Distributed
        } else {
            ExecutionMode::InProcess
        };
        let epoch = EpochHandle::new();
        let config = Arc::new(config);

        let mut files = FileRegistry::new();
        let ports = PortAllocator::new(new_store(
            &mut files,
            &config.build_dir,
            root.child("ports"),
            &epoch,
        )?);
        let passwords = PasswordLedger::new(new_store(
            &mut files,
            &config.build_dir,
            root.child("passwords"),
            &epoch,
        )?);

        let mut personas = PersonaRegistry::new();
        personas.register(
            Persona::new(root.child("build"), HostKind::Build, None).with_key(BUILD_PERSONA_KEY),
        )?;

        debug!(app = %root, ?mode, "created application context");
        Ok(Self {
            inner: Box::new(Inner {
                root,
                config,
                mode,
                epoch,
                personas,
                files,
                secrets: SecretRegistry::new(),
                deployment: DeploymentModel::new(),
                teardown: Vec::new(),
                sink: Box::new(JsonManifestSink),
                ports,
                passwords,
                launch: None,
            }),
            _state: PhantomData,
        })
    }

    fn guard(&self, operation: &str) -> PersonaResult<()> {
        self.inner.epoch.assert_startup_time(operation)
    }

    /// Register an already built persona. `Process` personas also become a
    /// deployable service.
    pub fn register_persona(&mut self, persona: Persona) -> PersonaResult<Persona> {
        self.guard("register_persona")?;
        let service = persona
            .host
            .is_deployable()
            .then(|| ServiceSpec::for_persona(&persona));
        if let Some(spec) = &service {
            if self.inner.deployment.service(&spec.name).is_some() {
                return Err(PersonaError::DuplicateService(spec.name.clone()));
            }
        }
        self.inner.personas.register(persona.clone())?;
        if let Some(spec) = service {
            self.inner.deployment.add_service(spec)?;
        }
        debug!(persona = %persona.key, host = %persona.host, id = %persona.id, "declared persona");
        Ok(persona)
    }

    pub fn define_persona<F, Fut>(&mut self, id: Id, host: HostKind, entry: F) -> PersonaResult<Persona>
    where
        F: Fn(RuntimeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register_persona(Persona::new(id, host, Some(entry_point(entry))))
    }

    pub fn define_persona_with_key<F, Fut>(
        &mut self,
        id: Id,
        key: impl Into<String>,
        host: HostKind,
        entry: F,
    ) -> PersonaResult<Persona>
    where
        F: Fn(RuntimeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register_persona(Persona::new(id, host, Some(entry_point(entry))).with_key(key))
    }

    /// Long-running background process.
    pub fn define_worker<F, Fut>(&mut self, id: Id, entry: F) -> PersonaResult<Persona>
    where
        F: Fn(RuntimeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.define_persona(id, HostKind::Process, entry)
    }

    /// Infrastructure-only node; dispatching it fails.
    pub fn define_placeholder(&mut self, id: Id) -> PersonaResult<Persona> {
        self.register_persona(Persona::new(id, HostKind::Placeholder, None))
    }

    /// Declare a build file, by default at `<build_dir>/<id as path>`.
    pub fn declare_file(
        &mut self,
        id: Id,
        path: Option<PathBuf>,
        producer: Option<Producer>,
    ) -> PersonaResult<BuildFile> {
        self.guard("declare_file")?;
        let path = path.unwrap_or_else(|| self.inner.config.build_dir.join(id.to_file_path()));
        debug!(file = %id, path = %path.display(), "declared build file");
        self.inner
            .files
            .declare(id, path, producer, self.inner.epoch.clone())
    }

    /// Declare a build-time persistent store at `<build_dir>/<id as path>.json`.
    pub fn declare_store(&mut self, id: Id) -> PersonaResult<PersistentStore> {
        self.guard("declare_store")?;
        new_store(
            &mut self.inner.files,
            &self.inner.config.build_dir,
            id,
            &self.inner.epoch,
        )
    }

    /// Declare a value computed by the build persona and routed to every
    /// other persona through the environment.
    pub fn declare_secret<T, F>(&mut self, id: Id, compute: F) -> PersonaResult<Secret<T>>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> PersonaResult<T> + Send + Sync + 'static,
    {
        self.guard("declare_secret")?;
        let compute = Box::new(move || -> PersonaResult<serde_json::Value> {
            Ok(serde_json::to_value(compute()?)?)
        });
        self.inner
            .secrets
            .declare(id, compute, self.inner.epoch.clone())
    }

    pub fn deployment_mut(&mut self) -> &mut DeploymentModel {
        &mut self.inner.deployment
    }

    pub fn set_manifest_sink(&mut self, sink: impl ManifestSink + 'static) {
        self.inner.sink = Box::new(sink);
    }

    /// Best-effort hook run after the persona's entry point finishes.
    pub fn on_teardown<F, Fut>(&mut self, name: impl Into<String>, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner.teardown.push(TeardownHook {
            name: name.into(),
            hook: Arc::new(move || Box::pin(hook())),
        });
    }

    /// Select the persona this process plays and leave the startup epoch.
    ///
    /// Resolution order: `explicit`, then the configured key, then every
    /// persona together in-process. Non-build personas load the dotenv file
    /// first.
    ///
    /// The execution mode was fixed by [`AppContext::new`] and declarations
    /// already depend on it, so an explicit selection does not change it. To
    /// build or run a distributed deployment, select the persona through
    /// [`AppConfig::with_persona`] (or `PERSONA`) instead.
    pub fn dispatch(mut self, explicit: Option<&Id>) -> PersonaResult<AppContext<Running>> {
        let launch = self.select(explicit)?;
        let active = launch.active();
        if active.host == HostKind::Build && self.inner.mode == ExecutionMode::InProcess {
            warn!("building an in-process context: distributed-only services are not emitted");
        }
        if active.host != HostKind::Build {
            self.load_env_file()?;
        }
        match &launch {
            Launch::InProcess(_) => self.inner.epoch.enter_in_process(active.clone())?,
            Launch::Single(_) => self.inner.epoch.enter(active.clone())?,
        }
        info!(
            persona = %active.key,
            host = %active.host,
            mode = ?self.inner.mode,
            "entering runtime epoch"
        );
        self.inner.launch = Some(launch);
        Ok(AppContext {
            inner: self.inner,
            _state: PhantomData,
        })
    }

    /// `dispatch(None)` followed by `run`.
    pub async fn launch(self) -> PersonaResult<()> {
        self.dispatch(None)?.run().await
    }

    fn select(&self, explicit: Option<&Id>) -> PersonaResult<Launch> {
        let personas = &self.inner.personas;
        if let Some(id) = explicit {
            return personas
                .find_by_id(id)
                .cloned()
                .map(Launch::Single)
                .ok_or_else(|| self.unknown(id.value()));
        }
        if let Some(key) = &self.inner.config.persona {
            return personas
                .get(key)
                .cloned()
                .map(Launch::Single)
                .ok_or_else(|| self.unknown(key));
        }
        Ok(Launch::InProcess(ActivePersona {
            id: self.inner.root.child("in-process"),
            key: IN_PROCESS_KEY.to_string(),
            host: HostKind::Process,
        }))
    }

    fn unknown(&self, selector: &str) -> PersonaError {
        PersonaError::UnknownPersona {
            selector: selector.to_string(),
            available: self.inner.personas.keys(),
        }
    }

    fn load_env_file(&self) -> PersonaResult<()> {
        let path = self.inner.config.env_file_path();
        if !path.exists() {
            return Ok(());
        }
        dotenvy::from_path(&path)
            .map_err(|e| PersonaError::Config(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), "loaded dotenv file");
        Ok(())
    }
}

impl AppContext<Running> {
    /// The persona selected by dispatch.
    pub fn active(&self) -> PersonaResult<&ActivePersona> {
        self.inner.epoch.assert_not_startup("AppContext::active")
    }
}

impl<S: EpochState> fmt::Debug for AppContext<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppContext")
            .field("root", &self.inner.root)
            .field("mode", &self.inner.mode)
            .field("personas", &self.inner.personas.keys())
            .field("files", &self.inner.files.len())
            .field("secrets", &self.inner.secrets.len())
            .field("active", &self.inner.epoch.current())
            .finish()
    }
}

fn new_store(
    files: &mut FileRegistry,
    build_dir: &Path,
    id: Id,
    epoch: &EpochHandle,
) -> PersonaResult<PersistentStore> {
    let mut path = build_dir.join(id.to_file_path()).into_os_string();
    path.push(".json");
    let path = PathBuf::from(path);

    let state = StoreState::new(path.clone());
    let snapshot = Arc::clone(&state);
    let producer: Producer = Arc::new(move || snapshot.snapshot_bytes());
    let file = files.declare(id.clone(), path, Some(producer), epoch.clone())?;
    Ok(PersistentStore::new(id, file, state, epoch.clone()))
}

/// Handed to every entry point.
#[derive(Clone)]
pub struct RuntimeContext {
    pub(crate) persona: ActivePersona,
    pub(crate) mode: ExecutionMode,
    pub(crate) config: Arc<AppConfig>,
    pub(crate) root: Id,
    pub(crate) background: BackgroundSet,
}

impl RuntimeContext {
    pub fn persona(&self) -> &ActivePersona {
        &self.persona
    }

    pub fn host(&self) -> HostKind {
        self.persona.host
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn root(&self) -> &Id {
        &self.root
    }

    /// Run `task` alongside the entry point. A process without a terminal
    /// session waits for these tasks (or Ctrl-C) before tearing down.
    pub fn spawn_background<Fut>(&self, name: impl Into<String>, task: Fut) -> PersonaResult<()>
    where
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let mut set = self
            .background
            .lock()
            .map_err(|_| PersonaError::Backend("background task lock poisoned".to_string()))?;
        debug!(task = %name, "spawning background task");
        set.spawn(async move { (name, task.await) });
        Ok(())
    }
}

impl fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("persona", &self.persona)
            .field("mode", &self.mode)
            .finish()
    }
}
