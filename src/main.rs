use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mcp_bridge::config::{self, AppConfig, ProviderConfig};
use mcp_bridge::protocol::PeerInfo;
use mcp_bridge::registry::builtin::register_builtin_tools;
use mcp_bridge::server::http::serve_http;
use mcp_bridge::transport::{self, StdioTransport};
use mcp_bridge::{
    ChatModel, ConversationController, OpenAiChatClient, Session, SessionOptions, ToolDirectory,
    ToolRegistry, ToolServer,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "mcp-bridge")]
#[command(about = "Connect a chat model to MCP tool providers", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file (defaults to ./mcp-bridge.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Override log format (pretty, json)
    #[arg(long, global = true)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the built-in tools over stdin/stdout
    ServeStdio,
    /// Serve the built-in tools over streamable HTTP
    ServeHttp {
        /// Override the listen port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Connect to the provider and print its tools in function-calling form
    Tools {
        /// Connect to a streamable HTTP provider instead of the configured one
        #[arg(long)]
        url: Option<String>,
    },
    /// Run one conversation turn against the provider's tools
    Chat {
        /// The user message
        #[arg(short, long)]
        message: String,

        /// Connect to a streamable HTTP provider instead of the configured one
        #[arg(long)]
        url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let mut config = config::load_config(cli.config.as_deref()).with_context(|| match &cli.config {
        Some(path) => format!("Failed to load configuration from: {}", path.display()),
        None => "Failed to load configuration".to_string(),
    })?;

    if let Some(log_level) = cli.log_level {
        config.logging.level = log_level;
    }
    if let Some(log_format) = cli.log_format {
        config.logging.format = log_format;
    }

    init_logging(&config.logging)?;

    match cli.command {
        Command::ServeStdio => serve_stdio(&config).await,
        Command::ServeHttp { port } => {
            if let Some(port) = port {
                config.http.port = port;
            }
            print_banner(&config);
            run_http(&config).await
        }
        Command::Tools { url } => {
            apply_url_override(&mut config, url);
            list_tools(&config).await
        }
        Command::Chat { message, url } => {
            apply_url_override(&mut config, url);
            chat(&config, &message).await
        }
    }
}

/// Logs always go to stderr: in stdio mode stdout is the protocol channel
fn init_logging(config: &config::LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty().with_writer(std::io::stderr))
                .init();
        }
    }

    Ok(())
}

fn print_banner(config: &AppConfig) {
    let version = env!("CARGO_PKG_VERSION");
    let width = 59usize;
    let border = "═".repeat(width + 2);
    let line = |content: &str| {
        info!("║ {:width$} ║", content, width = width);
    };

    info!("╔{}╗", border);
    line("MCP-BRIDGE");
    line(&format!("Streamable HTTP tool provider v{}", version));
    info!("╚{}╝", border);
    info!("");
    info!("Server Configuration:");
    info!("  → Address: {}:{}", config.http.host, config.http.port);
    info!("  → Provider: {} v{}", config.server.name, config.server.version);
    info!("  → Log Level: {}", config.logging.level);
    info!("  → Log Format: {}", config.logging.format);
    info!("");
}

fn build_tool_server(config: &AppConfig) -> Result<ToolServer> {
    let mut registry = ToolRegistry::new();
    register_builtin_tools(&mut registry)?;

    let mut server = ToolServer::new(registry)
        .with_info(PeerInfo::new(&config.server.name, &config.server.version));
    if let Some(instructions) = &config.server.instructions {
        server = server.with_instructions(instructions.clone());
    }
    if let Some(page_size) = config.server.page_size {
        server = server.with_page_size(page_size);
    }
    Ok(server)
}

async fn serve_stdio(config: &AppConfig) -> Result<()> {
    let server = build_tool_server(config)?;
    info!("MCP provider started on stdio");
    server.serve(Arc::new(StdioTransport::stdio())).await?;
    Ok(())
}

async fn run_http(config: &AppConfig) -> Result<()> {
    let server = build_tool_server(config)?;
    let shutdown = CancellationToken::new();

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    serve_http(server, &config.http, shutdown).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal, shutting down...");
        },
        _ = terminate => {
            info!("Received SIGTERM signal, shutting down...");
        },
    }
}

fn apply_url_override(config: &mut AppConfig, url: Option<String>) {
    if let Some(url) = url {
        config.provider = ProviderConfig::Http { url };
    }
}

async fn connect(config: &AppConfig) -> Result<Arc<Session>> {
    let transport = transport::from_config(&config.provider, &config.session);
    let session = Arc::new(Session::new(
        transport,
        SessionOptions::from(&config.session),
    ));
    session.connect().await?;
    Ok(session)
}

async fn list_tools(config: &AppConfig) -> Result<()> {
    let session = connect(config).await?;
    let tools = ToolDirectory::new(Arc::clone(&session)).function_tools().await;
    session.disconnect().await?;

    println!("{}", serde_json::to_string_pretty(&tools?)?);
    Ok(())
}

async fn chat(config: &AppConfig, message: &str) -> Result<()> {
    // Read once; the client never consults the environment itself
    let api_key = std::env::var(&config.model.api_key_env).ok();
    let model = OpenAiChatClient::from_config(&config.model, api_key);
    if !model.has_credentials() {
        anyhow::bail!(
            "Environment variable {} is not set; cannot query model {}",
            config.model.api_key_env,
            model.model()
        );
    }
    let model: Arc<dyn ChatModel> = Arc::new(model);

    let session = connect(config).await?;
    let mut controller =
        ConversationController::new(model, Arc::clone(&session), config.model.system_prompt.clone());

    let outcome = controller.run_turn(message).await;
    if let Err(e) = session.disconnect().await {
        warn!("Error while disconnecting: {}", e);
    }
    let outcome = outcome?;

    for call in &outcome.tool_calls {
        info!(
            "Tool {} ({}) -> {}{}",
            call.name,
            call.id,
            call.output,
            if call.is_error { " [error]" } else { "" }
        );
    }
    println!("{}", outcome.answer);
    Ok(())
}
