use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use threadline::assistant::{NewAssistant, OpenAiAssistants};
use threadline::channels::WhatsAppChannel;
use threadline::config::{AssistantSettings, ChannelSettings, ConfigError};
use threadline::format::format_for_whatsapp;
use threadline::poller::CompletionPoller;
use threadline::session::SessionManager;
use threadline::store::ThreadStore;

#[derive(Parser)]
#[command(name = "threadline")]
#[command(about = "WhatsApp to assistant relay", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config.json.
    Init {
        /// Config file path (default: THREADLINE_CONFIG_PATH or ~/.threadline/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Run the webhook gateway. Secrets come from the environment or the config file.
    #[command(alias = "gateway")]
    Serve {
        /// Config file path (default: THREADLINE_CONFIG_PATH or ~/.threadline/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// HTTP port (default from config or 8000)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Send one text message through the WhatsApp Cloud API.
    Send {
        /// Config file path (default: THREADLINE_CONFIG_PATH or ~/.threadline/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Recipient WhatsApp id (phone number in international format, digits only).
        #[arg(long, value_name = "WA_ID")]
        to: String,

        /// Message text.
        text: String,
    },

    /// Talk to the assistant as a WhatsApp user without going through WhatsApp.
    /// Uses the same thread store, so the conversation continues on the user's thread.
    /// Without TEXT, reads messages interactively from stdin.
    Ask {
        /// Config file path (default: THREADLINE_CONFIG_PATH or ~/.threadline/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// WhatsApp id the conversation belongs to.
        #[arg(long, value_name = "WA_ID")]
        wa_id: String,

        /// Display name used in logs.
        #[arg(long, default_value = "cli")]
        name: String,

        /// Message text; omit for an interactive session.
        text: Option<String>,
    },

    /// Provision the assistant the relay talks to.
    Assistant {
        #[command(subcommand)]
        command: AssistantCommands,
    },
}

#[derive(Subcommand)]
enum AssistantCommands {
    /// Upload knowledge files and create an assistant; prints the new assistant id
    /// (set it as OPENAI_ASSISTANT_ID or assistant.assistantId).
    Create {
        /// Config file path (default: THREADLINE_CONFIG_PATH or ~/.threadline/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        #[arg(long)]
        name: String,

        #[arg(long, default_value = "gpt-4o")]
        model: String,

        /// System instructions for the assistant.
        #[arg(long)]
        instructions: String,

        /// File to upload and make searchable (repeatable).
        #[arg(long = "file", value_name = "PATH")]
        files: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("threadline {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Serve { config, port }) => {
            if let Err(e) = run_serve(config, port).await {
                log::error!("gateway failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Send { config, to, text }) => {
            if let Err(e) = run_send(config, to, text).await {
                log::error!("send failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Ask {
            config,
            wa_id,
            name,
            text,
        }) => {
            if let Err(e) = run_ask(config, wa_id, name, text).await {
                log::error!("ask failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Assistant {
            command:
                AssistantCommands::Create {
                    config,
                    name,
                    model,
                    instructions,
                    files,
                },
        }) => {
            let assistant = NewAssistant {
                name,
                instructions,
                model,
                file_ids: Vec::new(),
            };
            if let Err(e) = run_assistant_create(config, assistant, files).await {
                log::error!("assistant create failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(threadline::config::default_config_path);
    let dir = threadline::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_serve(config_path: Option<PathBuf>, port: Option<u16>) -> anyhow::Result<()> {
    let (mut config, path) = threadline::config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    log::info!("starting gateway on {}:{}", config.gateway.bind, config.gateway.port);
    threadline::gateway::run_gateway(config, path).await
}

async fn run_send(config_path: Option<PathBuf>, to: String, text: String) -> anyhow::Result<()> {
    let (config, _) = threadline::config::load_config(config_path)?;
    let settings = ChannelSettings::resolve(&config)?;
    let channel = WhatsAppChannel::new(&settings);
    if let Err(e) = channel.send_text(&to, &format_for_whatsapp(&text)).await {
        eprintln!("{}", e.body());
        return Err(e.into());
    }
    println!("sent to {}", to);
    Ok(())
}

async fn run_assistant_create(
    config_path: Option<PathBuf>,
    mut assistant: NewAssistant,
    files: Vec<PathBuf>,
) -> anyhow::Result<()> {
    let (config, _) = threadline::config::load_config(config_path)?;
    let api_key = threadline::config::resolve_api_key(&config).ok_or(ConfigError {
        setting: "assistant API key",
        env: "OPENAI_API_KEY",
        field: "assistant.apiKey",
    })?;
    let client = OpenAiAssistants::new(Some(config.assistant.base_url.clone()), api_key);
    for file in &files {
        assistant.file_ids.push(client.upload_file(file).await?);
    }
    let id = client.create_assistant(&assistant).await?;
    println!("{}", id);
    Ok(())
}

async fn run_ask(
    config_path: Option<PathBuf>,
    wa_id: String,
    name: String,
    text: Option<String>,
) -> anyhow::Result<()> {
    let (config, _) = threadline::config::load_config(config_path)?;
    let settings = AssistantSettings::resolve(&config)?;
    let store = Arc::new(ThreadStore::open(&config.store.path).await?);
    let backend = Arc::new(OpenAiAssistants::new(
        Some(settings.base_url.clone()),
        settings.api_key.clone(),
    ));
    let poller = CompletionPoller::new(
        backend.clone(),
        settings.assistant_id.clone(),
        settings.poll_interval,
        settings.max_poll_attempts,
    );
    let sessions = SessionManager::new(store, backend, poller);

    if let Some(text) = text {
        let reply = sessions.generate_response(&text, &wa_id, &name).await?;
        println!("{}", format_for_whatsapp(&reply));
        return Ok(());
    }

    use std::io::{self, Write};
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        write!(stdout, "> ")?;
        stdout.flush()?;
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("/exit") || input.eq_ignore_ascii_case("/quit") {
            break;
        }
        match sessions.generate_response(input, &wa_id, &name).await {
            Ok(reply) => println!("< {}", format_for_whatsapp(&reply)),
            Err(e) => eprintln!("ask error: {}", e),
        }
    }
    Ok(())
}
