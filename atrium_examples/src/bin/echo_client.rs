use std::time::{Duration, Instant};

use atrium_connector::config::ConnectorConfig;
use atrium_connector::connector::Connector;
use atrium_core::Packet;
use bytes::Bytes;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:7777")]
    server: String,

    /// Account name to authenticate as
    #[arg(short, long, default_value = "demo")]
    account: String,

    /// Stage to join
    #[arg(long, default_value_t = 1)]
    stage_id: i64,

    /// Number of echo round-trips
    #[arg(short, long, default_value_t = 10)]
    count: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    println!("🔌 Atrium Echo Client -> {}", args.server);

    let connector = Connector::new(
        ConnectorConfig::builder()
            .request_timeout_ms(5_000)
            .heartbeat_interval_ms(2_000)
            .build(),
    );

    connector.set_on_push(|stage_id, packet| {
        println!("📨 push from stage {}: {}", stage_id, packet.msg_id);
    });
    connector.set_on_disconnected(|reason| {
        println!("⚠️  disconnected: {reason}");
    });

    // The demo drives the action queue off a timer; a game would call
    // main_thread_action once per frame instead.
    let pump = connector.clone();
    tokio::spawn(async move {
        loop {
            pump.main_thread_action();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    });

    connector.connect(&args.server).await?;

    let auth = connector
        .authenticate(args.stage_id, "Auth", Bytes::from(args.account.clone()))
        .await?;
    anyhow::ensure!(auth.is_ok(), "authentication rejected: {:?}", auth.error_code());
    println!("✅ authenticated as {}", args.account);

    for i in 0..args.count {
        let payload = Bytes::from(format!("hello #{i}"));
        let started = Instant::now();
        let reply = connector
            .request_async(args.stage_id, Packet::new("Echo", payload.clone()))
            .await?;
        anyhow::ensure!(reply.payload == payload, "echo mismatch");
        println!(
            "↩️  {} in {:.2?} ({} bytes)",
            reply.msg_id,
            started.elapsed(),
            reply.payload.len()
        );
    }

    println!(
        "📊 timeouts: {}, late replies: {}",
        connector.request_timeouts(),
        connector.late_replies()
    );
    connector.disconnect();
    Ok(())
}
