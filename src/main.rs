mod api_client;
mod cli;
mod config;

use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use eyre::Result;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use crate::api_client::ApiClient;
use crate::cli::auth;
use crate::cli::chat::ChatContext;
use crate::cli::chat::prompt::read_field;
use crate::cli::chat::store::KeyValueStore;
use crate::config::Config;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Input to send to the chat
    #[arg(short, long)]
    input: Option<String>,

    /// Base url of the Dr. Chatbot API [env: DR_CHATBOT_API_URL]
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Directory holding the local store [env: DR_CHATBOT_DATA_DIR]
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Keep everything in memory; nothing survives the process
    #[arg(long, global = true)]
    ephemeral: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a chat session
    Chat {
        /// Input to send to the chat
        #[arg(short, long)]
        input: Option<String>,
    },
    /// Log in with an existing account
    Login {
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        password: Option<String>,
    },
    /// Create an account
    Signup {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        password: Option<String>,
    },
    /// Forget the stored credentials (chat history is kept)
    Logout,
    /// Check that the API is reachable
    Status,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load environment variables from .env file
    dotenv().ok();

    let cli = Cli::parse();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    let color = !cli.no_color && io::stdout().is_terminal();
    let config = Config::resolve(cli.api_url, cli.data_dir, cli.ephemeral, color)?;
    info!("Using Dr. Chatbot API at {}", config.api_url);

    let store = config.open_store()?;
    let client = ApiClient::new(config.api_url.clone());

    match cli.command {
        Some(Commands::Chat { input }) => run_chat(config, store, client, input.or(cli.input)).await,
        None => run_chat(config, store, client, cli.input).await,
        Some(Commands::Login { email, password }) => {
            let email = field_or_prompt(email, "Email")?;
            let password = field_or_prompt(password, "Password")?;
            let result = auth::login(&client, store.as_ref(), &email, &password).await;
            report_auth(result.map(|r| r.message.unwrap_or_else(|| "Logged in.".to_string())))
        }
        Some(Commands::Signup {
            name,
            email,
            password,
        }) => {
            let name = field_or_prompt(name, "Full name")?;
            let email = field_or_prompt(email, "Email")?;
            let password = field_or_prompt(password, "Password")?;
            let result = auth::signup(&client, store.as_ref(), &name, &email, &password).await;
            report_auth(result.map(|r| {
                r.message
                    .unwrap_or_else(|| "Account created. You are logged in.".to_string())
            }))
        }
        Some(Commands::Logout) => {
            auth::logout(store.as_ref());
            println!("Logged out. Your conversation history has been kept.");
            Ok(ExitCode::SUCCESS)
        }
        Some(Commands::Status) => match client.health().await {
            Ok(health) => {
                println!("{}: {}", health.status, health.message);
                Ok(ExitCode::SUCCESS)
            }
            Err(e) => {
                eprintln!("{} is not reachable: {}", client.base_url(), e);
                Ok(ExitCode::FAILURE)
            }
        },
    }
}

async fn run_chat(
    config: Config,
    store: Arc<dyn KeyValueStore>,
    client: ApiClient,
    input: Option<String>,
) -> Result<ExitCode> {
    let interactive = input.is_none();
    let mut chat_context = ChatContext::new(
        Box::new(io::stdout()),
        input,
        interactive,
        config.color,
        store,
        Box::new(client),
    )?;
    chat_context.run().await
}

fn field_or_prompt(value: Option<String>, label: &str) -> Result<String> {
    match value {
        Some(value) => Ok(value),
        None => Ok(read_field(label)?),
    }
}

fn report_auth(result: Result<String, auth::AuthError>) -> Result<ExitCode> {
    match result {
        Ok(message) => {
            println!("{}", message);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            let mut stderr = io::stderr();
            writeln!(stderr, "{}", e.user_message())?;
            Ok(ExitCode::FAILURE)
        }
    }
}
