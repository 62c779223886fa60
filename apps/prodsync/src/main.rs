use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use prodsync_client_core::auth::{AutoExtend, RegisterRequest, SessionDecision, SessionPrompt};
use prodsync_client_core::field::{FlushOutcome, SaveStrategy};
use prodsync_client_core::sync::CanonicalChange;
use prodsync_client_core::telemetry::{self, LogConfig, LogLevel};
use prodsync_client_core::{ClientConfig, ClientContext};
use prodsync_proto::{AnswerKey, CellKey, ClosingState, ProductionSnapshot};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "prodsync", version, about = "Live production form client")]
struct Cli {
    /// REST API base URL
    #[arg(long, env = "PRODSYNC_API_URL")]
    api_url: Option<Url>,

    /// STOMP WebSocket endpoint (derived from the API URL when omitted)
    #[arg(long, env = "PRODSYNC_PUSH_URL")]
    push_url: Option<Url>,

    #[arg(long, env = "PRODSYNC_CREDENTIALS_PATH")]
    credentials: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = LogLevel::Warn)]
    log_level: LogLevel,

    #[arg(long, help = "Write logs to a file instead of stderr")]
    log_file: Option<PathBuf>,

    #[arg(long, help = "Renew expired sessions without asking")]
    auto_extend: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Login {
        #[arg(long)]
        email: String,
        #[arg(long, env = "PRODSYNC_PASSWORD", hide_env_values = true)]
        password: String,
    },
    Register {
        #[arg(long)]
        email: String,
        #[arg(long, env = "PRODSYNC_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long)]
        name: Option<String>,
    },
    Logout,
    Whoami,
    /// Print the current snapshot of a production
    Show { code: String },
    /// Follow a production live until interrupted
    Watch { code: String },
    /// Follow production creation and state changes until interrupted
    Board,
    SetField {
        code: String,
        field_id: u64,
        value: String,
    },
    SetCell {
        code: String,
        table_id: u64,
        row_id: u64,
        col_id: u64,
        value: String,
    },
    Finish { code: String },
    Cancel { code: String },
}

/// Asks on the terminal whether an expired session should be renewed.
struct TerminalPrompt;

#[async_trait]
impl SessionPrompt for TerminalPrompt {
    async fn decide(&self) -> SessionDecision {
        let answer = tokio::task::spawn_blocking(|| {
            let mut stderr = std::io::stderr();
            let _ = write!(stderr, "Session expired. Stay logged in? [Y/n] ");
            let _ = stderr.flush();
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line).map(|_| line)
        })
        .await;
        match answer {
            Ok(Ok(line)) if matches!(line.trim().to_ascii_lowercase().as_str(), "n" | "no") => {
                SessionDecision::LogOut
            }
            Ok(Ok(_)) => SessionDecision::Extend,
            _ => SessionDecision::LogOut,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    telemetry::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })
    .context("failed to initialise logging")?;

    let config = build_config(&cli)?;
    let prompt: Arc<dyn SessionPrompt> = if cli.auto_extend {
        Arc::new(AutoExtend)
    } else {
        Arc::new(TerminalPrompt)
    };
    let mut ctx = ClientContext::open(config, prompt).context("failed to start client")?;

    let result = run(&mut ctx, cli.command).await;
    ctx.close().await;
    result
}

fn build_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = ClientConfig::from_env().context("invalid PRODSYNC_* configuration")?;
    if let Some(api) = &cli.api_url {
        config.api_base = api.clone();
        if cli.push_url.is_none() {
            config.push_url = prodsync_client_core::config::derive_push_url(api)?;
        }
    }
    if let Some(push) = &cli.push_url {
        config.push_url = push.clone();
    }
    if let Some(path) = &cli.credentials {
        config.credentials_path = path.clone();
    }
    Ok(config)
}

async fn run(ctx: &mut ClientContext, command: Commands) -> Result<()> {
    match command {
        Commands::Login { email, password } => {
            let user = ctx.session().login(&email, &password).await?;
            println!("logged in as {}", user.email);
        }
        Commands::Register {
            email,
            password,
            name,
        } => {
            let request = RegisterRequest {
                email,
                password,
                name,
            };
            let user = ctx.session().register(&request).await?;
            println!("registered and logged in as {}", user.email);
        }
        Commands::Logout => {
            ctx.session().logout()?;
            println!("logged out");
        }
        Commands::Whoami => {
            let user = ctx
                .session()
                .current_user()
                .await
                .context("not logged in")?;
            println!("{}", user.email);
            if let Some(name) = user.name {
                println!("name: {name}");
            }
            if let Some(role) = user.role {
                println!("role: {role}");
            }
        }
        Commands::Show { code } => {
            let view = ctx.open_view(&code).await?;
            if let Some(snapshot) = view.snapshot() {
                print_snapshot(&snapshot);
            }
            view.close();
        }
        Commands::Watch { code } => watch(ctx, &code).await?,
        Commands::Board => board(ctx).await?,
        Commands::SetField {
            code,
            field_id,
            value,
        } => set_answer(ctx, &code, AnswerKey::Field(field_id), value).await?,
        Commands::SetCell {
            code,
            table_id,
            row_id,
            col_id,
            value,
        } => {
            let key = AnswerKey::Cell(CellKey::new(table_id, row_id, col_id));
            set_answer(ctx, &code, key, value).await?
        }
        Commands::Finish { code } => close(ctx, &code, ClosingState::Finished).await?,
        Commands::Cancel { code } => close(ctx, &code, ClosingState::Cancelled).await?,
    }
    Ok(())
}

async fn set_answer(ctx: &mut ClientContext, code: &str, key: AnswerKey, value: String) -> Result<()> {
    let view = ctx.open_view(code).await?;
    let kind = view.value_kind(&key);
    let field = view.mount(key, kind, SaveStrategy::Manual);
    field.edit(value);
    let outcome = field.save().await;
    view.close();
    match outcome {
        FlushOutcome::Saved(value) => {
            println!("{key} = {}", value.as_deref().unwrap_or("(cleared)"));
            Ok(())
        }
        FlushOutcome::Unchanged => {
            println!("{key} unchanged");
            Ok(())
        }
        FlushOutcome::AlreadySaving => bail!("{key} is already being saved"),
        FlushOutcome::Failed(err) => Err(err).with_context(|| format!("saving {key} failed")),
    }
}

async fn close(ctx: &mut ClientContext, code: &str, state: ClosingState) -> Result<()> {
    let view = ctx.open_view(code).await?;
    view.change_state(state)
        .await
        .with_context(|| format!("could not close {code}"))?;
    if let Some(snapshot) = view.snapshot() {
        println!("{code}: {:?}", snapshot.metadata.status);
    }
    view.close();
    Ok(())
}

async fn watch(ctx: &mut ClientContext, code: &str) -> Result<()> {
    let view = ctx.open_view(code).await?;
    let mut changes = view.sync().subscribe_changes();
    if let Some(snapshot) = view.snapshot() {
        print_snapshot(&snapshot);
    }
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            change = changes.recv() => match change {
                Ok(change) => print_change(&change, view.snapshot().as_deref()),
                Err(RecvError::Lagged(skipped)) => eprintln!("({skipped} updates skipped)"),
                Err(RecvError::Closed) => break,
            },
        }
    }
    view.close();
    Ok(())
}

async fn board(ctx: &mut ClientContext) -> Result<()> {
    let board = ctx.open_board();
    let mut revisions = board.watch();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = revisions.changed() => {
                if changed.is_err() {
                    break;
                }
                for production in board.list() {
                    println!("{:<20} {:?}", production.code, production.status);
                }
                println!();
            }
        }
    }
    board.close();
    Ok(())
}

fn print_snapshot(snapshot: &ProductionSnapshot) {
    let metadata = &snapshot.metadata;
    println!("{} [{:?}]", metadata.code, metadata.status);
    if let Some(template) = &metadata.template_name {
        println!("template: {template}");
    }
    if let Some(batch) = &metadata.batch_label {
        println!("batch: {batch}");
    }
    let progress = &snapshot.progress;
    println!(
        "progress: {}/{} ({:.1}%)",
        progress.answered_elements, progress.total_elements, progress.percent_complete
    );
    for field in &snapshot.structure.fields {
        let value = snapshot.value(&AnswerKey::Field(field.id)).unwrap_or("");
        println!("  [{}] {}: {}", field.id, field.label, value);
    }
}

fn print_change(change: &CanonicalChange, snapshot: Option<&ProductionSnapshot>) {
    println!(
        "{} = {} ({:?})",
        change.key,
        change.value.as_deref().unwrap_or("(empty)"),
        change.origin
    );
    if let Some(snapshot) = snapshot {
        println!("  progress {:.1}%", snapshot.progress.percent_complete);
    }
}
