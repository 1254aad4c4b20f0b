use async_trait::async_trait;
use atrium_core::Packet;
use atrium_server::config::PlayServerConfig;
use atrium_server::server::PlayServer;
use atrium_server::stage::context::StageCtx;
use atrium_server::traits::{Actor, Stage, StageFactory};
use bytes::Bytes;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP port for clients
    #[arg(short, long, default_value_t = 7777)]
    port: u16,

    /// WebSocket port for browser clients (0 = disabled)
    #[arg(short, long, default_value_t = 0)]
    ws_port: u16,
}

#[derive(Default)]
struct EchoStage {
    echoes: u64,
}

#[async_trait]
impl Stage for EchoStage {
    async fn on_dispatch(&mut self, ctx: &mut StageCtx<'_>, actor: &mut dyn Actor, packet: Packet) {
        match packet.msg_id.as_str() {
            "Echo" => {
                self.echoes += 1;
                tracing::info!(
                    account_id = %actor.account_id(),
                    bytes = packet.payload.len(),
                    total = self.echoes,
                    "echo"
                );
                ctx.reply(Packet::new("EchoReply", packet.payload));
            }
            "Shout" => {
                // One-way: fan the payload out to everyone in the room
                ctx.broadcast(Packet::new("Shouted", packet.payload));
            }
            other => {
                tracing::warn!(msg_id = %other, "unknown message");
            }
        }
    }
}

#[derive(Default)]
struct EchoActor {
    account_id: String,
}

#[async_trait]
impl Actor for EchoActor {
    fn account_id(&self) -> &str {
        &self.account_id
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    async fn on_authenticate(&mut self, packet: &Packet) -> bool {
        // The auth payload is the account name; anything non-empty passes.
        match std::str::from_utf8(&packet.payload) {
            Ok(name) if !name.is_empty() => {
                self.account_id = name.to_string();
                true
            }
            _ => false,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    println!("🚀 Atrium Echo Server");
    println!("{}", "=".repeat(50));

    let mut config = PlayServerConfig::builder()
        .nid("play:echo")
        .tcp_port(args.port)
        .default_stage_type("Echo")
        .authenticate_msg_id("Auth")
        .build();
    if args.ws_port != 0 {
        config.web_socket_port = Some(args.ws_port);
    }
    atrium_server::logging::init(&config.logging);

    let server = PlayServer::builder(config)
        .register_stage(StageFactory::new(
            "Echo",
            || Box::new(EchoStage::default()),
            || Box::new(EchoActor::default()),
        ))
        .start()
        .await?;

    if let Some(addr) = server.tcp_addr() {
        println!("📡 TCP listening on {addr}");
    }
    if let Some(addr) = server.ws_addr() {
        println!("📡 WebSocket listening on {addr}");
    }
    println!("Press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    let metrics = server.metrics();
    println!(
        "\n📊 frames in/out: {}/{}, sessions: {}",
        metrics.frames_received, metrics.frames_sent, metrics.sessions_opened
    );
    server.shutdown().await;
    Ok(())
}
