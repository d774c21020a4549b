//! Secnode CLI - talk to SECoP nodes from the command line

use clap::{Parser, ValueEnum};
use secnode_core::core::codec::decode_line;
use secnode_core::core::discovery::{Advertisement, UDP_PORT};
use secnode_core::utils::RecoveryPolicy;
use secnode_core::{ClientEvent, Message, ParamValue, SecopClient};
use serde_json::{json, Value};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

/// CLI output format
#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON format for scripting
    Json,
}

/// Secnode CLI
///
/// Sends each request line to the node and prints the replies. Without
/// requests the identification and descriptive data are shown.
#[derive(Parser, Debug)]
#[command(name = "secnode-cli", version, about = "SECoP client", long_about = None)]
struct Cli {
    /// Node address, host:port
    #[arg(required_unless_present = "discover")]
    node: Option<String>,

    /// Request lines like `read T:value` or `change T:target 10`
    requests: Vec<String>,

    /// Print updates until interrupted
    #[arg(short, long)]
    listen: bool,

    /// Find nodes on the local network instead, waiting this many seconds
    #[arg(long, value_name = "SECONDS", conflicts_with = "node")]
    discover: Option<u64>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::new("debug"))
            .with_writer(std::io::stderr)
            .init();
    }

    if let Some(timeout) = cli.discover {
        return discover(cli.format, timeout).await;
    }
    let Some(node) = cli.node.as_deref() else {
        anyhow::bail!("no node given");
    };

    let client = SecopClient::new(node);
    let events = client.subscribe();
    client.connect().await?;

    if cli.requests.is_empty() && !cli.listen {
        describe(cli.format, &client)?;
    }
    for line in &cli.requests {
        let msg = decode_line(line)?;
        match client.exchange(msg).await {
            Ok(reply) => print_message(cli.format, &reply),
            Err(e) => eprintln!("{line}: {}: {e}", e.kind()),
        }
    }
    if cli.listen {
        let keepalive = client.spawn(RecoveryPolicy::default());
        listen(cli.format, &client, events).await;
        keepalive.abort();
    }
    client.close();
    Ok(())
}

fn describe(format: OutputFormat, client: &SecopClient) -> anyhow::Result<()> {
    let description = client.description().unwrap_or(Value::Null);
    match format {
        OutputFormat::Text => {
            println!("{}", client.identification().unwrap_or_default());
            println!("{}", serde_json::to_string_pretty(&description)?);
        }
        OutputFormat::Json => println!(
            "{}",
            json!({"identification": client.identification(), "description": description})
        ),
    }
    Ok(())
}

fn print_record(format: OutputFormat, module: &str, param: &str, record: &ParamValue) {
    match format {
        OutputFormat::Text => match &record.error {
            Some(err) => println!("{module}:{param} {}: {err}", err.kind()),
            None => println!("{module}:{param} = {}", record.value),
        },
        OutputFormat::Json => println!("{}", json!({"module": module, "param": param, "report": record.report()})),
    }
}

fn print_message(format: OutputFormat, msg: &Message) {
    match format {
        OutputFormat::Text => println!("{msg}"),
        OutputFormat::Json => println!(
            "{}",
            json!({"action": msg.action, "specifier": msg.specifier, "data": msg.data})
        ),
    }
}

async fn listen(format: OutputFormat, client: &SecopClient, mut events: broadcast::Receiver<ClientEvent>) {
    for (module, param, record) in client.cached() {
        print_record(format, &module, &param, &record);
    }
    eprintln!("Listening. Press Ctrl+C to exit.");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(ClientEvent::Update { module, param, record }) => print_record(format, &module, &param, &record),
                Ok(ClientEvent::Disconnected) => eprintln!("Connection lost, reconnecting"),
                Ok(ClientEvent::Connected) => eprintln!("Connected"),
                Ok(ClientEvent::DescriptionChanged) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => eprintln!("{n} updates dropped"),
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

async fn discover(format: OutputFormat, timeout: u64) -> anyhow::Result<()> {
    let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).await?;
    socket.set_broadcast(true)?;
    socket
        .send_to(br#"{"SECoP":"discover"}"#, (Ipv4Addr::BROADCAST, UDP_PORT))
        .await?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout);
    let mut buf = [0u8; 1024];
    while let Ok(received) = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
        let (len, from) = received?;
        let Ok(advert) = serde_json::from_slice::<Advertisement>(&buf[..len]) else {
            continue;
        };
        match format {
            OutputFormat::Text => println!(
                "{}:{}  {}  {}",
                from.ip(),
                advert.port,
                advert.equipment_id,
                advert.description.lines().next().unwrap_or_default()
            ),
            OutputFormat::Json => println!("{}", json!({"host": from.ip().to_string(), "node": advert})),
        }
    }
    Ok(())
}
