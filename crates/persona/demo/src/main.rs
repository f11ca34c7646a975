#![deny(unsafe_code)]
//! Transfer ledger demo.
//!
//! The same declarations run everywhere:
//! - no `PERSONA` set: every persona in this process, stores in memory
//! - `PERSONA=build`: writes `.env`, `.gitignore` and `deployment.json`
//! - `PERSONA=<key>`: one persona per container, stores on PostgreSQL
//!
//! Run `persona-demo transfer --from=alice --to=bob --amount=5` for a one-shot
//! command, or with no arguments for an interactive session.

mod ledger;

use anyhow::Context as _;
use futures::TryStreamExt;
use ledger::{Ledger, Transfer};
use persona_core::telemetry::init_tracing;
use persona_core::{AppConfig, AppContext, ParsedArgs, PersonaResult, ServerHandle, Startup};
use persona_storage::{Database, DEFAULT_KEY_BATCH};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

const APP_NAME: &str = "ledger";
const AUDIT_INTERVAL: Duration = Duration::from_secs(30);

fn declare(config: AppConfig) -> anyhow::Result<AppContext<Startup>> {
    let mut ctx = AppContext::new(config)?;
    let root = ctx.root().clone();

    let db = Database::declare(&mut ctx, root.child("db"))?;
    let ledger = Ledger::declare(&ctx, &db, root.child("ledger"))?;

    let api = declare_api(&mut ctx, &ledger)?;
    declare_auditor(&mut ctx, &ledger)?;
    declare_commands(&mut ctx, &ledger, api)?;
    Ok(ctx)
}

/// Line protocol: one account name in, its balance out.
fn declare_api(ctx: &mut AppContext<Startup>, ledger: &Ledger) -> PersonaResult<ServerHandle> {
    let ledger = ledger.clone();
    ctx.define_server(ctx.root().child("api"), move |rt, handle| {
        let ledger = ledger.clone();
        async move {
            let listener = TcpListener::bind(handle.bind_addr()?).await?;
            info!(addr = %listener.local_addr()?, "balance server listening");
            rt.spawn_background("api accept loop", accept_loop(listener, ledger))?;
            Ok(())
        }
    })
}

async fn accept_loop(listener: TcpListener, ledger: Ledger) -> anyhow::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        let ledger = ledger.clone();
        tokio::spawn(async move {
            if let Err(e) = serve(socket, &ledger).await {
                warn!(%peer, "connection failed: {e:#}");
            }
        });
    }
}

async fn serve(socket: TcpStream, ledger: &Ledger) -> anyhow::Result<()> {
    let (read, mut write) = socket.into_split();
    let mut lines = BufReader::new(read).lines();
    while let Some(line) = lines.next_line().await? {
        let account = line.trim();
        if account.is_empty() {
            continue;
        }
        let balance = ledger.balance(account).await?;
        write.write_all(format!("{balance}\n").as_bytes()).await?;
    }
    Ok(())
}

fn declare_auditor(ctx: &mut AppContext<Startup>, ledger: &Ledger) -> PersonaResult<()> {
    let ledger = ledger.clone();
    ctx.define_worker(ctx.root().child("auditor"), move |rt| {
        let ledger = ledger.clone();
        async move {
            rt.spawn_background("audit", audit_loop(ledger))?;
            Ok(())
        }
    })?;
    Ok(())
}

async fn audit_loop(ledger: Ledger) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(AUDIT_INTERVAL);
    loop {
        ticker.tick().await;
        let mut count = 0usize;
        let mut pages = ledger.transfers().all_keys(DEFAULT_KEY_BATCH);
        while let Some(page) = pages.try_next().await? {
            count += page.len();
        }
        info!(transfers = count, "audit complete");
    }
}

fn declare_commands(
    ctx: &mut AppContext<Startup>,
    ledger: &Ledger,
    api: ServerHandle,
) -> PersonaResult<()> {
    let commands = ctx.define_commands(ctx.root().child("cli"))?;

    let l = ledger.clone();
    commands.command(
        "transfer",
        "move --amount=<n> from --from=<account> to --to=<account>",
        move |args: ParsedArgs| {
            let ledger = l.clone();
            async move {
                let transfer = Transfer {
                    from: args.get("from").context("missing --from")?.to_string(),
                    to: args.get("to").context("missing --to")?.to_string(),
                    amount: args
                        .get("amount")
                        .context("missing --amount")?
                        .parse()
                        .context("--amount must be an integer")?,
                };
                let key = ledger.record(&transfer).await?;
                println!("recorded {key}");
                Ok(())
            }
        },
    )?;

    let l = ledger.clone();
    commands.command("balance", "print the balance of <account>", move |args: ParsedArgs| {
        let ledger = l.clone();
        async move {
            let account = args.positional(0).context("usage: balance <account>")?;
            println!("{account}: {}", ledger.balance(account).await?);
            Ok(())
        }
    })?;

    let l = ledger.clone();
    commands.command("history", "list transfers touching <account>", move |args: ParsedArgs| {
        let ledger = l.clone();
        async move {
            let account = args.positional(0).context("usage: history <account>")?;
            for (key, t) in ledger.history(account).await? {
                println!("{key}  {} -> {}  {}", t.from, t.to, t.amount);
            }
            Ok(())
        }
    })?;

    let l = ledger.clone();
    commands.command("revert", "delete transfer <key>", move |args: ParsedArgs| {
        let ledger = l.clone();
        async move {
            let key = args.positional(0).context("usage: revert <key>")?;
            if !ledger.revert(key).await? {
                anyhow::bail!("no transfer `{key}`");
            }
            println!("reverted {key}");
            Ok(())
        }
    })?;

    commands.command("ask", "query the balance server for <account>", move |args: ParsedArgs| {
        let api = api.clone();
        async move {
            let account = args.positional(0).context("usage: ask <account>")?.to_string();
            let mut stream = TcpStream::connect(api.address()?).await?;
            stream.write_all(format!("{account}\n").as_bytes()).await?;
            let mut reply = String::new();
            BufReader::new(stream).read_line(&mut reply).await?;
            println!("{account}: {}", reply.trim());
            Ok(())
        }
    })?;

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing(std::env::var_os("PERSONA_VERBOSE").is_some())?;
    let ctx = declare(AppConfig::from_env(APP_NAME))?;
    ctx.launch().await?;
    Ok(())
}
