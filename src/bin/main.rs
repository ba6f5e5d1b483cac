use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use hr_console::auth::token;
use hr_console::gateway::ApiRequest;
use hr_console::{Console, ConsoleConfig, GuardDecision, IdentityProvider, TenantId};
use reqwest::Method;
use tracing::{Level, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hr-console")]
#[command(about = "Session client for the HR admin console backend")]
struct Cli {
    #[command(flatten)]
    settings: Settings,
    #[command(subcommand)]
    command: Commands,
}

/// Overrides for `ConsoleConfig`; unset values fall back to its defaults.
#[derive(Args)]
struct Settings {
    /// Base URL of the tenant REST API
    #[arg(long, global = true, env = "HR_CONSOLE_API_URL")]
    api_url: Option<String>,
    /// Where the session is persisted between runs
    #[arg(long, global = true, env = "HR_CONSOLE_SESSION_FILE")]
    session_file: Option<PathBuf>,
    /// Identity toolkit API key
    #[arg(long, global = true, env = "HR_CONSOLE_IDENTITY_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
    /// Safety margin before token expiry, in milliseconds
    #[arg(long, global = true, env = "HR_CONSOLE_EXPIRY_MARGIN_MS")]
    expiry_margin_ms: Option<i64>,
    /// Per-request timeout in seconds
    #[arg(long, global = true, env = "HR_CONSOLE_REQUEST_TIMEOUT_SECS")]
    timeout_secs: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in with email and password and select a tenant
    Login {
        #[arg(long)]
        email: String,
        #[arg(long, env = "HR_CONSOLE_PASSWORD", hide_env_values = true)]
        password: String,
        /// Tenant to use instead of the one derived from the profile
        #[arg(long)]
        tenant: Option<String>,
    },
    /// Sign out and clear the stored session
    Logout,
    /// Show the stored session and whether the tenant area would open
    Status,
    /// Send an authenticated request through the gateway
    Request {
        method: String,
        path: String,
        /// JSON request body
        #[arg(long)]
        data: Option<String>,
    },
    /// Ask the backend whether the current user is a super admin
    VerifySuperadmin,
    /// Watch the session and report when it ends
    Watch {
        /// Renew the token this many seconds before it expires
        #[arg(long)]
        auto_refresh_secs: Option<u64>,
    },
}

impl Settings {
    fn into_config(self) -> ConsoleConfig {
        let mut config = ConsoleConfig::default();
        if let Some(api_url) = self.api_url {
            config.api_url = api_url;
        }
        if let Some(session_file) = self.session_file {
            config.session_file = session_file;
        }
        if let Some(api_key) = self.api_key {
            config.identity_api_key = Some(api_key);
        }
        if let Some(margin) = self.expiry_margin_ms {
            config.expiry_margin_ms = margin;
        }
        if let Some(timeout) = self.timeout_secs {
            config.request_timeout_secs = timeout;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("hr_console=info".parse()?),
        )
        .with_max_level(Level::INFO)
        .init();

    let cli = Cli::parse();
    let console = Console::from_config(cli.settings.into_config())?;

    match cli.command {
        Commands::Login {
            email,
            password,
            tenant,
        } => {
            let user = console
                .sign_in(&email, &password, tenant.map(TenantId::new))
                .await?;
            println!("Signed in as {}", user.uid);
            match console.session().tenant_id() {
                Some(tenant) => println!("Tenant: {}", tenant),
                None => println!("Tenant: (none)"),
            }
        }
        Commands::Logout => {
            if let Err(e) = console.restore().await {
                warn!("Stored session could not be resumed: {}", e);
            }
            console.sign_out().await?;
            println!("Signed out");
        }
        Commands::Status => {
            let restored = console.restore().await;
            let state = console.provider().auth_state();
            match state.user() {
                Some(user) => println!("User: {}", user.uid),
                None => println!("User: (signed out)"),
            }
            if let Err(e) = restored {
                println!("Session could not be resumed: {}", e);
            }

            match console.session().token() {
                Some(token) => {
                    let expires_at = token::expires_at_ms(&token);
                    match chrono::DateTime::from_timestamp_millis(expires_at) {
                        Some(at) if expires_at > 0 => println!("Token expires: {}", at),
                        _ => println!("Token expires: (unknown)"),
                    }
                }
                None => println!("Token: (none)"),
            }
            match console.session().tenant_id() {
                Some(tenant) => println!("Tenant: {}", tenant),
                None => println!("Tenant: (none)"),
            }
            print_decision(&console.tenant_guard().check(&state, "/"));
        }
        Commands::Request { method, path, data } => {
            console.restore().await.context("No usable session; run `login` first")?;

            let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                .with_context(|| format!("Invalid HTTP method `{}`", method))?;
            let mut request = ApiRequest::new(method);
            if let Some(data) = data {
                let body: serde_json::Value =
                    serde_json::from_str(&data).context("--data must be valid JSON")?;
                request = request.with_json(&body)?;
            }

            let response = console.gateway().request(&path, request).await?;
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            println!("{}", status);
            if !body.is_empty() {
                println!("{}", body);
            }
            if let Some(target) = settled_redirect(&console).await {
                println!("Session ended; sign in again ({})", target);
            }
            if !status.is_success() {
                bail!("Request failed with status {}", status);
            }
        }
        Commands::VerifySuperadmin => {
            if let Err(e) = console.restore().await {
                warn!("Stored session could not be resumed: {}", e);
            }
            let decision = console.superadmin_guard().check().await;
            print_decision(&decision);
            if !decision.is_allowed() {
                bail!("Not a verified super admin");
            }
        }
        Commands::Watch { auto_refresh_secs } => {
            if console.restore().await?.is_none() {
                bail!("No stored session; run `login` first");
            }

            let mut signals = console.events().subscribe();
            let _watcher = console.mount_watcher();
            let _refresher = auto_refresh_secs
                .map(|secs| console.spawn_auto_refresh(Duration::from_secs(secs)));
            info!("Watching session; press Ctrl-C to stop");

            loop {
                tokio::select! {
                    signal = signals.recv() => match signal {
                        Ok(signal) => {
                            let target = settled_redirect(&console).await;
                            println!(
                                "Session ended ({}); redirect to {}",
                                signal.reason(),
                                target.as_deref().unwrap_or("/login")
                            );
                            break;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    _ = tokio::signal::ctrl_c() => {
                        info!("Interrupted");
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

/// Give the root signal handler a moment to record its redirect.
async fn settled_redirect(console: &Console) -> Option<String> {
    let mut redirects = console.watch_redirects();
    let waited = tokio::time::timeout(
        Duration::from_millis(200),
        redirects.wait_for(|target| target.is_some()),
    )
    .await;
    let target = match waited {
        Ok(Ok(target)) => target.clone(),
        _ => None,
    };
    target
}

fn print_decision(decision: &GuardDecision) {
    match decision {
        GuardDecision::Allow => println!("Access: allowed"),
        GuardDecision::Loading => println!("Access: pending"),
        GuardDecision::Redirect(target) => println!("Access: redirect to {}", target),
    }
}
