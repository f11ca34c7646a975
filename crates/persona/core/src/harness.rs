//! Runtime epoch: executing the dispatched persona.

use crate::context::{AppContext, BackgroundSet, Inner, Launch, RuntimeContext, TeardownHook};
use crate::envfile;
use crate::epoch::Running;
use crate::error::{PersonaError, PersonaResult};
use crate::host::HostKind;
use crate::persona::{EntryPoint, Persona};
use futures::future::join_all;
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Whether an interactive session ended the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finish {
    Terminal,
    Detached,
}

impl AppContext<Running> {
    /// Execute the dispatched persona, wait for its background tasks, then
    /// run teardown hooks.
    pub async fn run(self) -> PersonaResult<()> {
        let inner = *self.inner;
        let launch = inner
            .launch
            .clone()
            .ok_or_else(|| PersonaError::Unreachable("running context without a launch".into()))?;
        let active = launch.active();

        let background: BackgroundSet = Arc::new(Mutex::new(JoinSet::new()));
        let rt = RuntimeContext {
            persona: active,
            mode: inner.mode,
            config: Arc::clone(&inner.config),
            root: inner.root.clone(),
            background: Arc::clone(&background),
        };

        let outcome = match &launch {
            Launch::InProcess(_) => run_in_process(&inner, &rt).await,
            Launch::Single(persona) => run_single(&inner, persona, &rt).await,
        };
        drop(rt);

        match outcome {
            Ok(Finish::Detached) => drain_background(&background).await,
            Ok(Finish::Terminal) | Err(_) => abort_background(&background),
        }
        run_teardown(&inner.teardown).await;
        outcome.map(|_| ())
    }
}

async fn run_single(inner: &Inner, persona: &Persona, rt: &RuntimeContext) -> PersonaResult<Finish> {
    match persona.host {
        HostKind::Build => {
            emit_build_artifacts(inner)?;
            if let Some(entry) = &persona.entry {
                invoke(entry, rt.clone(), &persona.key).await?;
            }
            Ok(Finish::Detached)
        }
        HostKind::Process | HostKind::Command => {
            let entry = require_entry(persona)?;
            invoke(entry, rt.clone(), &persona.key).await?;
            Ok(Finish::Detached)
        }
        HostKind::Terminal => {
            let entry = require_entry(persona)?;
            invoke(entry, rt.clone(), &persona.key).await?;
            Ok(Finish::Terminal)
        }
        HostKind::Placeholder => Err(PersonaError::NotRunnable(persona.key.clone())),
    }
}

fn require_entry(persona: &Persona) -> PersonaResult<&EntryPoint> {
    persona
        .entry
        .as_ref()
        .ok_or_else(|| PersonaError::NotRunnable(persona.key.clone()))
}

/// Every process persona concurrently, then the terminal session.
async fn run_in_process(inner: &Inner, rt: &RuntimeContext) -> PersonaResult<Finish> {
    let processes: Vec<&Persona> = inner
        .personas
        .of_kind(HostKind::Process)
        .filter(|p| p.has_entry())
        .collect();
    info!(count = processes.len(), "starting personas in-process");

    let results = join_all(processes.iter().copied().filter_map(|persona| {
        let entry = persona.entry.as_ref()?;
        let rt = rt.clone();
        let key = persona.key.clone();
        Some(async move {
            let result = invoke(entry, rt, &key).await;
            (key, result)
        })
    }))
    .await;
    for (key, result) in results {
        if let Err(err) = result {
            error!(persona = %key, error = %err, "persona failed");
        }
    }

    match inner.personas.terminal() {
        Some(terminal) => {
            let entry = require_entry(terminal)?;
            invoke(entry, rt.clone(), &terminal.key).await?;
            Ok(Finish::Terminal)
        }
        None => Ok(Finish::Detached),
    }
}

async fn invoke(entry: &EntryPoint, rt: RuntimeContext, key: &str) -> PersonaResult<()> {
    debug!(persona = %key, "invoking entry point");
    entry(rt).await.map_err(|err| match err.downcast::<PersonaError>() {
        Ok(inner) => inner,
        Err(err) => PersonaError::EntryPoint {
            key: key.to_string(),
            message: format!("{err:#}"),
        },
    })
}

/// Build persona: resolve secrets, run file producers, write manifests,
/// the dotenv file and the build directory's `.gitignore`.
fn emit_build_artifacts(inner: &Inner) -> PersonaResult<()> {
    let build_dir = &inner.config.build_dir;
    let secrets = inner.secrets.resolve_all()?;

    let mut written = Vec::new();
    for file in inner.files.files() {
        if file.emit()? {
            debug!(file = %file.id(), path = %file.path().display(), "emitted build file");
            written.push(file.path().to_path_buf());
        }
    }
    written.extend(inner.sink.emit(&inner.deployment, &secrets, build_dir)?);

    let env_path = inner.config.env_file_path();
    envfile::write_env_file(&env_path, &secrets)?;
    written.push(env_path);
    written.push(envfile::write_gitignore(build_dir, &written)?);

    info!(
        files = written.len(),
        secrets = secrets.len(),
        dir = %build_dir.display(),
        "build artifacts emitted"
    );
    Ok(())
}

fn take_background(background: &BackgroundSet) -> JoinSet<(String, anyhow::Result<()>)> {
    match background.lock() {
        Ok(mut set) => std::mem::take(&mut *set),
        Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
    }
}

fn abort_background(background: &BackgroundSet) {
    let mut set = take_background(background);
    if !set.is_empty() {
        debug!(tasks = set.len(), "aborting background tasks");
        set.abort_all();
    }
}

/// Wait for background tasks until they finish or Ctrl-C arrives. Tasks
/// spawned while waiting are picked up too.
async fn drain_background(background: &BackgroundSet) {
    loop {
        let mut set = take_background(background);
        if set.is_empty() {
            return;
        }
        info!(tasks = set.len(), "waiting for background tasks");
        loop {
            tokio::select! {
                next = set.join_next() => match next {
                    None => break,
                    Some(Ok((name, Ok(())))) => debug!(task = %name, "background task finished"),
                    Some(Ok((name, Err(err)))) => {
                        error!(task = %name, error = %format!("{err:#}"), "background task failed")
                    }
                    Some(Err(err)) => error!(error = %err, "background task panicked"),
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupted, stopping background tasks");
                    set.abort_all();
                    abort_background(background);
                    return;
                }
            }
        }
    }
}

async fn run_teardown(hooks: &[TeardownHook]) {
    for hook in hooks {
        match (hook.hook)().await {
            Ok(()) => debug!(hook = %hook.name, "teardown hook finished"),
            Err(err) => warn!(hook = %hook.name, error = %format!("{err:#}"), "teardown hook failed"),
        }
    }
}
