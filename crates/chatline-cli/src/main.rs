use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chatline_core::client::{ClientSessionController, LocalBackend, SessionStatus};
use chatline_core::models::{Role, ToolInvocation};
use chatline_core::repositories::{
    DualBackingStore, GuestTranscriptRepository, SqliteTranscriptRepository,
};
use chatline_core::services::{ChatService, ModelCatalog, RigProvider, ScriptedProvider};
use chatline_core::settings::{
    ChatlineSettings, JsonSettingsRepository, ModelConfig, ProviderConfig, ProviderType,
    SettingsRepository,
};
use chatline_core::streams::{InMemoryStreamStore, SqliteStreamStore, StreamStore};
use chatline_core::tools::{
    HttpSearchProvider, LocationDecision, LocationTool, ToolRegistry, WebSearchTool,
};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};

const OFFLINE_MODEL: &str = "echo";
const SEARCH_KEY_VAR: &str = "CHATLINE_SEARCH_API_KEY";

type Input = Lines<BufReader<Stdin>>;

#[derive(Debug, Parser)]
#[command(name = "chatline", about = "Streaming chat in the terminal")]
struct Args {
    /// Keep transcripts locally, without an account (capped)
    #[arg(long)]
    guest: bool,

    /// Model id from the settings file
    #[arg(long)]
    model: Option<String>,

    /// Continue an existing conversation
    #[arg(long)]
    conversation: Option<String>,

    /// Account id for authenticated sessions
    #[arg(long, default_value = "local")]
    user: String,

    /// Use a built-in echo model instead of a real provider
    #[arg(long)]
    offline: bool,

    /// Location shared when a tool asks for it: "lat,lon,timezone"
    #[arg(long)]
    location: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatline=info,chatline_core=info".into()),
        )
        .init();

    let args = Args::parse();
    let settings = JsonSettingsRepository::new()
        .context("failed to locate settings file")?
        .load()
        .await
        .context("failed to load settings")?;

    let (catalog, default_model) = build_catalog(&settings, args.offline);
    if catalog.is_empty() {
        bail!("no models configured; add one to settings.json or pass --offline");
    }
    let available = catalog.model_ids();
    let Some(model_id) = args.model.clone().or(default_model) else {
        bail!("no default model; pass --model");
    };
    if !available.contains(&model_id) {
        bail!("unknown model {model_id:?}; available: {}", available.join(", "));
    }
    let location = args.location.as_deref().map(parse_location).transpose()?;

    let (store, stream_store): (DualBackingStore, Arc<dyn StreamStore>) = if args.guest {
        let guest = GuestTranscriptRepository::in_data_dir(settings.engine.guest_message_cap)
            .context("failed to open guest store")?;
        (
            DualBackingStore::Guest(Arc::new(guest)),
            Arc::new(InMemoryStreamStore::new()),
        )
    } else {
        let repository = SqliteTranscriptRepository::new()
            .await
            .context("failed to init sqlite store")?;
        let stream_store = Arc::new(SqliteStreamStore::new(&repository));
        (
            DualBackingStore::Authenticated {
                user_id: args.user.clone(),
                repository: Arc::new(repository),
            },
            stream_store,
        )
    };

    let service = ChatService::new(
        catalog,
        build_tools(&settings)?,
        stream_store,
        settings.engine.clone(),
    );
    let backend = Arc::new(LocalBackend::new(service, store));

    let conversation_id = args
        .conversation
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    tracing::info!(
        conversation_id = %conversation_id,
        model = %model_id,
        guest = args.guest,
        "Starting session"
    );

    let mut session =
        ClientSessionController::new(backend, conversation_id, model_id, &settings.engine);
    run_repl(&mut session, location).await
}

/// Register every configured model, or the echo model when offline.
/// Returns the catalog and the model to use when none is requested.
fn build_catalog(settings: &ChatlineSettings, offline: bool) -> (ModelCatalog, Option<String>) {
    if offline {
        let model = ModelConfig::new(OFFLINE_MODEL, "Echo", ProviderType::Ollama, OFFLINE_MODEL);
        let catalog = ModelCatalog::new().with(model, Arc::new(ScriptedProvider::default()));
        return (catalog, Some(OFFLINE_MODEL.to_string()));
    }

    let mut catalog = ModelCatalog::new();
    for model in &settings.models {
        let provider = settings.provider(model).cloned().unwrap_or_else(|| {
            ProviderConfig::new(model.provider_type.display_name(), model.provider_type)
        });
        catalog.register(model.clone(), Arc::new(RigProvider::new(provider)));
    }
    let default_model = settings.models.first().map(|m| m.id.clone());
    (catalog, default_model)
}

fn build_tools(settings: &ChatlineSettings) -> Result<ToolRegistry> {
    let mut tools = ToolRegistry::new().with(Arc::new(LocationTool::new()));

    if let Ok(key) = std::env::var(SEARCH_KEY_VAR) {
        let timeout = settings.engine.tool_timeout();
        let search = HttpSearchProvider::new(key, timeout).context("failed to build search client")?;
        tools.register(Arc::new(WebSearchTool::new(Arc::new(search), timeout)));
    }
    Ok(tools)
}

fn parse_location(raw: &str) -> Result<LocationDecision> {
    let mut fields = raw.splitn(3, ',').map(str::trim);
    let (Some(lat), Some(lon), Some(timezone)) = (fields.next(), fields.next(), fields.next())
    else {
        bail!("--location expects \"lat,lon,timezone\", got {raw:?}");
    };

    Ok(LocationDecision::Granted {
        latitude: lat.parse().context("invalid latitude")?,
        longitude: lon.parse().context("invalid longitude")?,
        timezone: timezone.to_string(),
    })
}

async fn run_repl(
    session: &mut ClientSessionController,
    location: Option<LocationDecision>,
) -> Result<()> {
    let mut input: Input = BufReader::new(tokio::io::stdin()).lines();
    let mut printer = Printer::default();

    if session.mount().await {
        println!("(resuming a response in progress)");
    }
    for message in session.messages() {
        let who = match message.role {
            Role::User => "you",
            Role::Assistant => "assistant",
            Role::System => continue,
        };
        println!("{who}> {}", message.content);
    }
    printer.skip_existing(session);

    eprintln!("Commands: /stop /retry /model <id> /dismiss /quit");
    loop {
        if session.is_streaming() {
            if let Some(invocation) = session.awaiting_tools().into_iter().next() {
                let decision = ask_for_decision(&mut input, &invocation, location.as_ref()).await?;
                session.resolve_tool(&invocation.tool_call_id, decision).await;
                report_error(session);
                continue;
            }

            tokio::select! {
                line = input.next_line() => {
                    match line.context("failed to read stdin")?.as_deref().map(str::trim) {
                        Some("/stop") => {
                            session.stop().await;
                            println!();
                        }
                        Some("/quit") | None => return Ok(()),
                        Some(_) => eprintln!("(busy; /stop to interrupt)"),
                    }
                }
                _ = session.poll_stream() => {
                    printer.flush(session).await?;
                    if !session.is_streaming() {
                        println!();
                        report_error(session);
                    }
                }
            }
            continue;
        }

        prompt("you> ").await?;
        let Some(line) = input.next_line().await.context("failed to read stdin")? else {
            return Ok(());
        };
        let accepted = match line.trim() {
            "" => continue,
            "/quit" => return Ok(()),
            "/stop" => continue,
            "/retry" => session.reload().await,
            "/dismiss" => {
                for notice in session.snapshot().notices {
                    session.dismiss_notice(notice.id);
                }
                session.clear_error();
                continue;
            }
            command if command.starts_with("/model ") => {
                let model_id = command.trim_start_matches("/model ").trim();
                session.set_model(model_id);
                eprintln!("(model set to {})", session.model_id());
                continue;
            }
            text => session.submit(text).await,
        };
        if accepted {
            printer.begin();
        } else {
            report_error(session);
        }
    }
}

async fn ask_for_decision(
    input: &mut Input,
    invocation: &ToolInvocation,
    location: Option<&LocationDecision>,
) -> Result<serde_json::Value> {
    if invocation.tool_name != LocationTool::NAME {
        return Ok(serde_json::json!({ "error": "declined by user" }));
    }

    prompt("\nShare your location? [y/N] ").await?;
    let answer = input
        .next_line()
        .await
        .context("failed to read stdin")?
        .unwrap_or_default();

    let decision = match (answer.trim().eq_ignore_ascii_case("y"), location) {
        (true, Some(granted)) => granted.clone(),
        (true, None) => LocationDecision::denied("no location configured"),
        (false, _) => LocationDecision::denied("user declined"),
    };
    Ok(decision.to_value())
}

async fn prompt(text: &str) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(text.as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}

fn report_error(session: &ClientSessionController) {
    if let Some(error) = session.error() {
        eprintln!("! {}: {}", error.title, error.message);
    }
    if session.status() == SessionStatus::Error {
        match session.error() {
            Some(error) if error.kind.is_resumable() => {
                eprintln!("(connection problem; /retry resumes the conversation)")
            }
            _ => eprintln!("(/retry to try again, /dismiss to clear)"),
        }
    }
}

/// Writes the growing assistant reply incrementally.
#[derive(Default)]
struct Printer {
    message_id: Option<String>,
    printed: usize,
    started: bool,
}

impl Printer {
    fn skip_existing(&mut self, session: &ClientSessionController) {
        if let Some(last) = session.messages().last().filter(|m| m.role == Role::Assistant) {
            self.message_id = Some(last.id.clone());
            self.printed = last.content.len();
        }
    }

    fn begin(&mut self) {
        self.started = false;
    }

    async fn flush(&mut self, session: &ClientSessionController) -> Result<()> {
        let Some(reply) = session.messages().last().filter(|m| m.role == Role::Assistant) else {
            return Ok(());
        };
        if self.message_id.as_deref() != Some(reply.id.as_str()) {
            self.message_id = Some(reply.id.clone());
            self.printed = 0;
        }
        // A replayed stream rebuilds the reply from scratch.
        if reply.content.len() < self.printed {
            self.printed = 0;
        }

        let mut out = String::new();
        if !self.started {
            out.push_str("assistant> ");
            self.started = true;
        }
        out.push_str(&reply.content[self.printed..]);
        self.printed = reply.content.len();
        prompt(&out).await
    }
}
