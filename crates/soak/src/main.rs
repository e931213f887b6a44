mod config;
mod events;
mod harness;

use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::{Parser, ValueEnum};

use config::SoakConfig;
use events::SoakEvent;
use harness::{SoakHarness, SoakReport};
use netchan::{
    MAX_PACKETLEN_DEFAULT, PROTOCOL_VERSION_DEFAULT, PROTOCOL_VERSION_Q2PRO, PacketLossSimulation,
    Variant,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum VariantArg {
    Legacy,
    Current,
}

impl From<VariantArg> for Variant {
    fn from(arg: VariantArg) -> Self {
        match arg {
            VariantArg::Legacy => Variant::Legacy,
            VariantArg::Current => Variant::Current,
        }
    }
}

#[derive(Parser)]
#[command(name = "netchan-soak")]
#[command(about = "Soak test for netchan channels over loopback UDP")]
struct Args {
    #[arg(long, value_enum, default_value_t = VariantArg::Current)]
    variant: VariantArg,

    #[arg(long, help = "Protocol version (defaults to 34 for legacy, 36 for current)")]
    protocol: Option<u32>,

    #[arg(long, default_value_t = MAX_PACKETLEN_DEFAULT)]
    max_packet_len: usize,

    #[arg(short, long, default_value_t = 4)]
    clients: usize,

    #[arg(short, long, default_value_t = 50, help = "Reliable messages per direction")]
    messages: u32,

    #[arg(long, default_value_t = 4000)]
    message_size: usize,

    #[arg(long, default_value_t = 200)]
    unreliable_size: usize,

    #[arg(short, long, default_value_t = 100)]
    tick_rate: u32,

    #[arg(long, default_value_t = 1, help = "Copies of every datagram sent")]
    redundancy: usize,

    #[arg(long, default_value_t = 60)]
    max_duration: u64,

    #[arg(long, help = "Enable packet loss simulation on every link")]
    simulate_packet_loss: bool,

    #[arg(long, default_value_t = 0.0, help = "Packet loss percentage (0-100)")]
    loss_percent: f32,

    #[arg(long, default_value_t = 0, help = "Minimum latency in ms")]
    min_latency: u32,

    #[arg(long, default_value_t = 0, help = "Maximum latency in ms")]
    max_latency: u32,

    #[arg(long, default_value_t = 0, help = "Jitter in ms")]
    jitter: u32,
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let packet_loss = if args.simulate_packet_loss {
        Some(PacketLossSimulation {
            enabled: true,
            loss_percent: args.loss_percent,
            min_latency_ms: args.min_latency,
            max_latency_ms: args.max_latency,
            jitter_ms: args.jitter,
        })
    } else {
        None
    };

    let variant = Variant::from(args.variant);
    let protocol = args.protocol.unwrap_or(match variant {
        Variant::Legacy => PROTOCOL_VERSION_DEFAULT,
        Variant::Current => PROTOCOL_VERSION_Q2PRO,
    });

    let config = SoakConfig {
        variant,
        protocol,
        max_packet_len: args.max_packet_len,
        clients: args.clients,
        messages: args.messages,
        message_size: args.message_size,
        unreliable_size: args.unreliable_size,
        tick_rate: args.tick_rate,
        redundancy: args.redundancy,
        max_duration_secs: args.max_duration,
        packet_loss,
    };

    let mut harness = SoakHarness::new(config)?;
    log::info!(
        "Soak server on {} ({:?}, protocol {}, {} clients)",
        harness.local_addr(),
        variant,
        protocol,
        args.clients
    );

    let running = harness.running();
    while running.load(Ordering::SeqCst) {
        harness.tick_once();
        for event in harness.drain_events() {
            log_event(event);
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    let report = harness.report();
    print_report(&report);

    if !report.passed {
        bail!("soak failed");
    }
    Ok(())
}

fn log_event(event: SoakEvent) {
    match event {
        SoakEvent::ChannelOpened {
            client,
            channel,
            addr,
        } => {
            log::info!("Client {} on {} bound to channel {}", client, addr, channel);
        }
        SoakEvent::StreamComplete { client, direction } => {
            log::info!("Client {} {} stream complete", client, direction.as_str());
        }
        SoakEvent::Corrupted {
            client,
            direction,
            expected,
            reason,
        } => {
            log::error!(
                "Client {} {} stream corrupted at message {}: {}",
                client,
                direction.as_str(),
                expected,
                reason
            );
        }
        SoakEvent::ChannelFailed { client, reason } => {
            log::error!("Client {} channel failed: {}", client, reason);
        }
        SoakEvent::ChannelTimedOut { channel } => {
            log::warn!("Channel {} timed out", channel);
        }
        SoakEvent::Finished { elapsed } => {
            log::info!("All streams delivered in {:.2}s", elapsed.as_secs_f32());
        }
        SoakEvent::Error { message } => {
            log::error!("{}", message);
        }
    }
}

fn print_report(report: &SoakReport) {
    log::info!(
        "{} after {} ticks in {:.2}s, {} messages per direction",
        if report.passed { "PASSED" } else { "FAILED" },
        report.ticks,
        report.elapsed.as_secs_f32(),
        report.messages
    );

    for client in &report.clients {
        let stats = &client.client_stats;
        log::info!(
            "client {} ({}): up {}/{} down {}/{}, sent {} recv {} loss {:.1}%, {} unreliable frames",
            client.index,
            client.addr,
            client.delivered_up,
            report.messages,
            client.delivered_down,
            report.messages,
            stats.packets_sent,
            stats.packets_received,
            stats.loss_percent(),
            client.unreliable_received
        );
        if let Some(server) = &client.server_stats {
            log::info!(
                "  server side: sent {} recv {} rejected {} loss {:.1}% dumped {}",
                server.packets_sent,
                server.packets_received,
                server.packets_rejected,
                server.loss_percent(),
                server.unreliable_dumped
            );
        }
        if client.failed {
            log::warn!("  client {} failed", client.index);
        }
    }
}
