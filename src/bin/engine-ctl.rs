use clap::{Parser, Subcommand, ValueEnum};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Method;
use serde_json::Value;

#[derive(Parser)]
#[command(name = "engine-ctl")]
#[command(about = "Management CLI for the engine service", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://127.0.0.1:9091")]
    url: String,

    /// Admin API key, when the service requires one.
    #[arg(short, long, env = "ENGINE_ADMIN_KEY")]
    key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show engine status, interest and running pollers
    Status,
    /// Start the engine
    Start,
    /// Stop the engine
    Stop,
    /// Re-apply the active profile
    Reload,
    /// Deliver a power state change
    Power {
        #[arg(value_enum)]
        state: Power,
    },
    /// Hold a poll feed open
    Acquire { kind: String },
    /// Drop a hold taken with `acquire`
    Release { kind: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum Power {
    On,
    Off,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let mut headers = HeaderMap::new();
    if let Some(key) = &cli.key {
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {key}"))?);
    }

    let (method, path) = match &cli.command {
        Commands::Status => (Method::GET, "/admin/status".to_string()),
        Commands::Start => (Method::POST, "/admin/engine/start".to_string()),
        Commands::Stop => (Method::POST, "/admin/engine/stop".to_string()),
        Commands::Reload => (Method::POST, "/admin/reload".to_string()),
        Commands::Power { state: Power::On } => (Method::POST, "/admin/power/on".to_string()),
        Commands::Power { state: Power::Off } => (Method::POST, "/admin/power/off".to_string()),
        Commands::Acquire { kind } => (Method::POST, format!("/admin/events/{kind}/acquire")),
        Commands::Release { kind } => (Method::POST, format!("/admin/events/{kind}/release")),
    };

    let res = client
        .request(method, format!("{}{}", cli.url.trim_end_matches('/'), path))
        .headers(headers)
        .send()
        .await?;
    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: Admin API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        return Ok(());
    }

    let text = res.text().await?;
    if text.is_empty() {
        println!("{}", status);
        return Ok(());
    }

    let json: Value = serde_json::from_str(&text)?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
