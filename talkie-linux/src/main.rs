// JsonTalkie Linux talker: UDP broadcast, serial line, or an in-process dummy network.

mod config;
mod serial;
mod talker;
mod udp;

use std::time::Duration;

use anyhow::Context;
use talkie_core::{JsonTalkie, SimLink, TalkieCore, Transport};

use config::{Config, SocketKind};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("talkie-linux {}", VERSION);
            return Ok(());
        }
    }

    let (cfg, warnings) = config::load();
    let filter = cfg.log_level.clone().unwrap_or_else(|| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();
    for warning in warnings {
        log::warn!("{}", warning);
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> anyhow::Result<()> {
    match cfg.socket {
        SocketKind::Udp => serve(&cfg, udp::UdpTransport::new(cfg.port)).await,
        SocketKind::Serial => {
            let mut line =
                serial::SerialTransport::new(&cfg.serial_path, serial::DEFAULT_BAUD_RATE);
            line.set_baud_rate(cfg.baud_rate)
                .with_context(|| format!("baud rate {}", cfg.baud_rate))?;
            serve(&cfg, line).await
        }
        SocketKind::Dummy => {
            let link = SimLink::new();
            let mut buzzer = JsonTalkie::new(
                talker::manifest("Buzzer", "Dummy buzzer on the simulated link"),
                link.endpoint(),
            );
            buzzer.on().await.context("dummy buzzer")?;
            let result = serve(&cfg, link.endpoint()).await;
            buzzer.off().await;
            result
        }
    }
}

/// Run one talker on `transport` until Ctrl+C or SIGTERM, broadcasting a
/// canned request every `announce_secs`.
async fn serve<T: Transport + 'static>(cfg: &Config, transport: T) -> anyhow::Result<()> {
    let mut core = TalkieCore::new(talker::manifest(&cfg.name, &cfg.description));
    core.set_max_delay(cfg.max_delay);
    let mut talkie = JsonTalkie::with_core(core, transport)
        .with_poll_interval(Duration::from_millis(cfg.poll_interval_ms.max(1)));
    talkie
        .on()
        .await
        .with_context(|| format!("opening {:?} transport", cfg.socket))?;

    let mut announce = tokio::time::interval(Duration::from_secs(cfg.announce_secs.max(1)));
    announce.tick().await;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let result = loop {
        tokio::select! {
            r = &mut shutdown => break r,
            _ = announce.tick() => {
                let message = talker::canned_message(&mut rand::thread_rng());
                if !talkie.talk(message).await {
                    log::debug!("canned message not fully sent");
                }
            }
        }
    };
    talkie.off().await;
    let drops = talkie.core().lock().await.drops();
    log::info!("{} off ({} messages dropped)", cfg.name, drops);
    result
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
