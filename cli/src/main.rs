use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};
use sessionkit::session::unix_now;
use sessionkit::{
    AuthError, AuthEvent, AuthScope, AuthState, ConfigError, ExecutionContext, Factor, MemoryLocalState,
    MemoryProvider, ProviderError, Session, SessionStore, StoreConfig, User,
};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("auth error [{code}]: {source}")]
    Auth { code: &'static str, source: AuthError },
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("scope closed before the script finished")]
    ScopeClosed,
}

impl From<AuthError> for CliError {
    fn from(source: AuthError) -> Self {
        Self::Auth { code: source.error_code(), source }
    }
}

#[derive(Parser, Debug)]
#[command(name = "sessionkit", about = "Drive a session store against an in-memory identity provider")]
struct Cli {
    /// Execution context (`client` or `server`).
    #[arg(long, env = "SESSION_EXECUTION_CONTEXT")]
    context: Option<ExecutionContext>,

    /// Seconds before expiry at which a cached token is no longer served.
    #[arg(long, env = "SESSION_EXPIRY_MARGIN_SECS")]
    expiry_margin_secs: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read a bearer token the way request code does.
    Token(TokenCommand),
    /// Mount a scope and print each state it observes during a scripted session.
    Watch(WatchCommand),
    /// Log out and report which local state keys survived.
    Logout(LogoutCommand),
}

#[derive(Args, Debug)]
struct TokenCommand {
    /// Seconds until the seeded session expires.
    #[arg(long, default_value_t = 300)]
    expires_in: i64,
    /// Seconds until the session the provider hands out on fetch expires.
    #[arg(long, default_value_t = 3600)]
    fresh_expires_in: i64,
    /// Start with no session at all.
    #[arg(long)]
    logged_out: bool,
    /// Make the provider's session lookup fail.
    #[arg(long)]
    fail_fetch: bool,
}

#[derive(Args, Debug)]
struct WatchCommand {
    /// Pin the scope to the placeholder session instead of following the provider.
    #[arg(long)]
    always_logged_in: bool,
    /// Delay between scripted provider events, in milliseconds.
    #[arg(long, default_value_t = 0)]
    step_ms: u64,
}

#[derive(Args, Debug)]
struct LogoutCommand {
    /// Make the provider's sign-out fail.
    #[arg(long)]
    fail_sign_out: bool,
    /// Local state entries to seed before logging out (`key=value`).
    #[arg(long = "local", value_parser = parse_key_value)]
    local: Vec<(String, String)>,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = StoreConfig::from_env()?;
    if let Some(context) = cli.context {
        config.context = context;
    }
    if let Some(secs) = cli.expiry_margin_secs {
        config.expiry_margin = Duration::from_secs(secs);
    }

    match cli.command {
        Command::Token(cmd) => run_token(config, cmd).await,
        Command::Watch(cmd) => run_watch(config, cmd).await,
        Command::Logout(cmd) => run_logout(config, cmd).await,
    }
}

fn build_store(config: StoreConfig, session: Option<Session>) -> (Arc<SessionStore>, MemoryProvider, MemoryLocalState) {
    let provider = MemoryProvider::new(session);
    let local = MemoryLocalState::from_config(&config);
    let store = SessionStore::new(Arc::new(provider.clone()), Arc::new(local.clone()), config);
    (Arc::new(store), provider, local)
}

async fn run_token(config: StoreConfig, cmd: TokenCommand) -> Result<(), CliError> {
    let seeded = (!cmd.logged_out).then(|| demo_session("seeded", cmd.expires_in));
    let (store, provider, _local) = build_store(config, seeded);
    provider.queue_fresh_session(demo_session("fresh", cmd.fresh_expires_in));
    if cmd.fail_fetch {
        provider.fail_next_get_session(ProviderError::Network("simulated outage".into()));
    }

    let token = store.get_access_token().await?;
    print_json(&json!({
        "token": token,
        "provider_calls": provider.calls().get_session,
        "context": format!("{:?}", store.config().context),
        "margin_secs": store.config().expiry_margin_secs(),
    }))
}

async fn run_watch(config: StoreConfig, cmd: WatchCommand) -> Result<(), CliError> {
    let (store, provider, _local) = build_store(config, None);
    let mut scope = if cmd.always_logged_in { store.mount_always_logged_in() } else { store.mount() };
    print_json(&describe(&scope.state()))?;

    let mut session = demo_session("signed-in", 3600);
    let mut script = vec![(AuthEvent::SignedIn, Some(session.clone()))];
    session.access_token = Some("rotated-token".into());
    script.push((AuthEvent::TokenRefreshed, Some(session.clone())));
    session.user.factors.push(Factor { id: Uuid::new_v4(), factor_type: "totp".into(), status: "verified".into() });
    script.push((AuthEvent::UserUpdated, Some(session)));
    script.push((AuthEvent::SignedOut, None));

    for (event, session) in script {
        if cmd.step_ms > 0 {
            tokio::time::sleep(Duration::from_millis(cmd.step_ms)).await;
        }
        tracing::info!(%event, "provider emit");
        provider.emit(event, session);
        if cmd.always_logged_in {
            print_json(&describe(&scope.state()))?;
        } else {
            let state = next_state(&mut scope).await?;
            print_json(&describe(&state))?;
        }
    }

    scope.unmount();
    Ok(())
}

async fn next_state(scope: &mut AuthScope) -> Result<AuthState, CliError> {
    scope.changed().await.ok_or(CliError::ScopeClosed)
}

async fn run_logout(config: StoreConfig, cmd: LogoutCommand) -> Result<(), CliError> {
    let (store, provider, local) = build_store(config, Some(demo_session("seeded", 3600)));
    for (key, value) in cmd.local {
        local.set(key, value);
    }
    if cmd.fail_sign_out {
        provider.fail_next_sign_out(ProviderError::Api { status: 503, message: "simulated outage".into() });
    }

    let result = store.log_out().await;
    print_json(&json!({
        "signed_out": result.is_ok(),
        "remaining_local_keys": local.keys(),
        "session_cached": store.current_session().is_some(),
    }))?;
    result.map_err(CliError::from)
}

fn describe(state: &AuthState) -> Value {
    json!({
        "loading": state.is_loading(),
        "logged_in": state.is_logged_in(),
        "mfa_enabled": state.is_mfa_enabled(),
        "user_id": state.user().map(|u| u.id),
        "expires_at": state.session().and_then(|s| s.expires_at),
    })
}

fn demo_session(token: &str, expires_in: i64) -> Session {
    Session {
        access_token: Some(format!("{token}-token")),
        expires_at: Some(unix_now() + expires_in),
        refresh_token: format!("{token}-refresh"),
        user: User {
            id: Uuid::new_v4(),
            role: "authenticated".into(),
            email: Some("demo@example.com".into()),
            app_metadata: json!({ "provider": "email" }),
            user_metadata: json!({}),
            factors: Vec::new(),
        },
    }
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    let Some((key, value)) = raw.split_once('=') else {
        return Err(format!("expected key=value, got '{raw}'"));
    };
    if key.trim().is_empty() {
        return Err("key must not be empty".to_owned());
    }
    Ok((key.trim().to_owned(), value.to_owned()))
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
