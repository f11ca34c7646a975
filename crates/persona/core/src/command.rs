//! Command-line surface: the terminal persona.
//!
//! With arguments the process runs one command and exits; without, it reads
//! commands from stdin until `exit`, `quit`, end of input or Ctrl-C.

use crate::context::{AppContext, RuntimeContext};
use crate::epoch::{EpochHandle, Startup};
use crate::error::{PersonaError, PersonaResult};
use crate::host::HostKind;
use futures::future::BoxFuture;
use persona_identity::Id;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::io::Write as _;
use std::sync::{Arc, RwLock};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

type Handler = Arc<dyn Fn(ParsedArgs) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Command arguments split into named values, flags and positionals.
///
/// `--key=value` is named, `--flag` and `-flag` are flags, anything else
/// (including negative numbers such as `-5`) is positional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedArgs {
    pub named: BTreeMap<String, String>,
    pub flags: BTreeSet<String>,
    pub positional: Vec<String>,
}

impl ParsedArgs {
    pub fn parse<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut args = Self::default();
        for word in words {
            let word = word.as_ref();
            let body = word
                .strip_prefix("--")
                .or_else(|| word.strip_prefix('-'))
                .filter(|rest| !rest.is_empty() && !rest.starts_with(|c: char| c.is_ascii_digit()));
            match body {
                Some(body) => match body.split_once('=') {
                    Some((key, value)) => {
                        args.named.insert(key.to_string(), value.to_string());
                    }
                    None => {
                        args.flags.insert(body.to_string());
                    }
                },
                None => args.positional.push(word.to_string()),
            }
        }
        args
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.named.get(name).map(String::as_str)
    }

    pub fn flag(&self, name: &str) -> bool {
        self.flags.contains(name)
    }

    pub fn positional(&self, index: usize) -> Option<&str> {
        self.positional.get(index).map(String::as_str)
    }
}

struct CommandSpec {
    about: String,
    handler: Handler,
}

/// Commands served by the terminal persona.
#[derive(Clone)]
pub struct CommandSet {
    id: Id,
    epoch: EpochHandle,
    commands: Arc<RwLock<BTreeMap<String, CommandSpec>>>,
}

impl CommandSet {
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Register a command. Only legal during startup.
    pub fn command<F, Fut>(
        &self,
        name: impl Into<String>,
        about: impl Into<String>,
        handler: F,
    ) -> PersonaResult<&Self>
    where
        F: Fn(ParsedArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.epoch.assert_startup_time("CommandSet::command")?;
        let name = name.into();
        let mut commands = self.commands.write().map_err(|_| poisoned())?;
        debug!(command = %name, "declared command");
        commands.insert(
            name,
            CommandSpec {
                about: about.into(),
                handler: Arc::new(move |args| Box::pin(handler(args))),
            },
        );
        Ok(self)
    }

    pub fn names(&self) -> PersonaResult<Vec<String>> {
        Ok(self
            .commands
            .read()
            .map_err(|_| poisoned())?
            .keys()
            .cloned()
            .collect())
    }

    /// Human-readable list of commands.
    pub fn usage(&self) -> PersonaResult<String> {
        let commands = self.commands.read().map_err(|_| poisoned())?;
        let width = commands.keys().map(String::len).max().unwrap_or(0);
        let mut out = String::from("available commands:\n");
        for (name, spec) in commands.iter() {
            out.push_str(&format!("  {name:<width$}  {}\n", spec.about));
        }
        Ok(out)
    }

    /// Run the command named by the first word with the remaining words.
    pub async fn execute<S: AsRef<str>>(&self, words: &[S]) -> anyhow::Result<()> {
        let Some((name, rest)) = words.split_first() else {
            return Ok(());
        };
        let name = name.as_ref();
        let handler = {
            let commands = self.commands.read().map_err(|_| poisoned())?;
            commands.get(name).map(|spec| Arc::clone(&spec.handler))
        };
        match handler {
            Some(handler) => handler(ParsedArgs::parse(rest)).await,
            None => {
                eprintln!("unknown command `{name}`");
                eprint!("{}", self.usage()?);
                Err(PersonaError::UnknownCommand {
                    name: name.to_string(),
                    available: self.names()?,
                }
                .into())
            }
        }
    }

    async fn session(self, rt: RuntimeContext) -> anyhow::Result<()> {
        let args = rt.config().args.clone();
        if !args.is_empty() {
            return self.execute(&args).await;
        }
        self.read_loop().await
    }

    async fn read_loop(&self) -> anyhow::Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        print!("{}", self.usage()?);
        loop {
            print!("> ");
            std::io::stdout().flush()?;
            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = tokio::signal::ctrl_c() => None,
            };
            let Some(line) = line else {
                break;
            };
            let words: Vec<&str> = line.split_whitespace().collect();
            match words.first() {
                None => continue,
                Some(&"exit") | Some(&"quit") => break,
                Some(&"help") => print!("{}", self.usage()?),
                Some(_) => {
                    if let Err(err) = self.execute(&words).await {
                        eprintln!("error: {err:#}");
                    }
                }
            }
        }
        println!();
        Ok(())
    }
}

impl fmt::Debug for CommandSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSet")
            .field("id", &self.id)
            .field("commands", &self.names().unwrap_or_default())
            .finish()
    }
}

fn poisoned() -> PersonaError {
    PersonaError::Backend("command table lock poisoned".to_string())
}

impl AppContext<Startup> {
    /// Declare the terminal persona and return its command set.
    pub fn define_commands(&mut self, id: Id) -> PersonaResult<CommandSet> {
        let set = CommandSet {
            id: id.clone(),
            epoch: self.epoch(),
            commands: Arc::new(RwLock::new(BTreeMap::new())),
        };
        let session = set.clone();
        self.define_persona(id, HostKind::Terminal, move |rt| {
            session.clone().session(rt)
        })?;
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn parses_argument_grammar() {
        let args = ParsedArgs::parse(["add", "--name=widget", "--force", "-v", "-5", "3", "--"]);
        assert_eq!(args.get("name"), Some("widget"));
        assert!(args.flag("force"));
        assert!(args.flag("v"));
        assert_eq!(args.positional, vec!["add", "-5", "3", "--"]);
    }

    #[test]
    fn value_may_contain_equals() {
        let args = ParsedArgs::parse(["--filter=a=b"]);
        assert_eq!(args.get("filter"), Some("a=b"));
    }

    #[tokio::test]
    async fn executes_registered_command() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = AppContext::new(AppConfig::new("shop").with_build_dir(dir.path())).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let commands = ctx.define_commands(ctx.root().child("cli")).unwrap();
        commands
            .command("count", "increment a counter", move |args| {
                let counter = Arc::clone(&counter);
                async move {
                    let by: usize = args.get("by").unwrap_or("1").parse()?;
                    counter.fetch_add(by, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();

        commands.execute(&["count", "--by=3"]).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let err = commands.execute(&["nope"]).await.unwrap_err();
        match err.downcast_ref::<PersonaError>() {
            Some(PersonaError::UnknownCommand { name, available }) => {
                assert_eq!(name, "nope");
                assert_eq!(available, &vec!["count".to_string()]);
            }
            other => panic!("expected UnknownCommand, got {other:?}"),
        }
    }

    #[test]
    fn one_terminal_per_application() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = AppContext::new(AppConfig::new("shop").with_build_dir(dir.path())).unwrap();
        ctx.define_commands(ctx.root().child("cli")).unwrap();
        let err = ctx.define_commands(ctx.root().child("cli2")).unwrap_err();
        assert!(matches!(err, PersonaError::DuplicateTerminal { .. }));
    }
}
