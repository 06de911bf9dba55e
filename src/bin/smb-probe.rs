//! SMB2/3 connection probe CLI

use clap::{Parser, Subcommand};
use rust_smb_transport::protocol::smb2_constants::{Smb2Command, Smb2Dialect};
use rust_smb_transport::protocol::{OutboundMessage, Smb2Echo};
use rust_smb_transport::{Connection, ConnectionConfig};
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "smb-probe")]
#[command(about = "Probe an SMB2/3 server's negotiation and credit behaviour", long_about = None)]
struct Args {
    /// SMB server address or hostname
    #[arg(short = 'H', long)]
    host: String,

    /// Port to connect to
    #[arg(short = 'p', long, default_value = "445")]
    port: u16,

    /// Highest dialect to offer (202, 210, 300, 302 or 311)
    #[arg(short = 'm', long, default_value = "311")]
    max_dialect: u16,

    /// Seconds to wait for each reply
    #[arg(short = 't', long, default_value = "10")]
    timeout: u64,

    /// Log level
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Negotiate and print what the server agreed to
    Negotiate,

    /// Negotiate, then send ECHO requests and report round trips
    Echo {
        /// Number of echoes to send
        #[arg(short = 'c', long, default_value = "4")]
        count: u32,
    },
}

fn offered_dialects(max: u16) -> Result<Vec<Smb2Dialect>, Box<dyn std::error::Error>> {
    let max = match max {
        202 => Smb2Dialect::Smb202,
        210 => Smb2Dialect::Smb210,
        300 => Smb2Dialect::Smb300,
        302 => Smb2Dialect::Smb302,
        311 => Smb2Dialect::Smb311,
        other => return Err(format!("Unknown dialect {}", other).into()),
    };
    Ok([
        Smb2Dialect::Smb202,
        Smb2Dialect::Smb210,
        Smb2Dialect::Smb300,
        Smb2Dialect::Smb302,
        Smb2Dialect::Smb311,
    ]
    .into_iter()
    .filter(|d| *d <= max)
    .collect())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    let config = ConnectionConfig {
        dialects: offered_dialects(args.max_dialect)?,
        response_timeout: Duration::from_secs(args.timeout),
        ..Default::default()
    };

    let addr = tokio::net::lookup_host((args.host.as_str(), args.port))
        .await?
        .next()
        .ok_or_else(|| format!("Could not resolve {}", args.host))?;
    tracing::info!("Connecting to {}", addr);
    let connection = Connection::connect(addr, config).await?;

    let negotiated = connection.negotiate().await?;
    println!("Dialect:          {:?}", negotiated.dialect);
    println!("Server GUID:      {}", negotiated.server_guid);
    println!("Security mode:    {:?}", negotiated.security_mode);
    println!("Capabilities:     {:?}", negotiated.capabilities);
    println!("Max transact:     {}", negotiated.max_transact_size);
    println!("Max read:         {}", negotiated.max_read_size);
    println!("Max write:        {}", negotiated.max_write_size);
    println!("Multi-credit:     {}", negotiated.supports_multi_credit());
    println!("Encryption:       {}", negotiated.supports_encryption());
    if let Some(cipher) = negotiated.cipher {
        println!("Cipher:           {:?}", cipher);
    }
    println!("Credits:          {}", connection.available_credits());

    match args.command {
        Commands::Negotiate => {}
        Commands::Echo { count } => {
            for i in 0..count {
                let started = Instant::now();
                let message = OutboundMessage::from_message(Smb2Command::Echo, &Smb2Echo)?;
                let response = connection.send_and_receive(message).await?;
                println!(
                    "echo {}: message id {} status {} in {:?} ({} credits)",
                    i,
                    response.message_id(),
                    response.status(),
                    started.elapsed(),
                    connection.available_credits()
                );
            }
        }
    }

    connection.close().await;
    Ok(())
}
