use event_relay::input::Command;
use event_relay::{Config, EventBuffer, HttpTransport, flush_timer};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Exceptional init failure: log and exit.
fn fatal(msg: &str, error: &dyn std::fmt::Display) -> ! {
    error!(%error, "{msg}");
    std::process::exit(1);
}

fn setup_logging() {
    use tracing_subscriber::filter::LevelFilter;
    use tracing_subscriber::prelude::*;

    let level = std::env::var("EVENT_RELAY_LOG_LEVEL")
        .ok()
        .and_then(|val| {
            val.parse::<LevelFilter>().ok().or_else(|| {
                eprintln!("invalid EVENT_RELAY_LOG_LEVEL: {val:?}, defaulting to WARN");
                None
            })
        })
        .unwrap_or(LevelFilter::WARN);

    tracing_subscriber::registry()
        .with(level)
        .with(tracing_microjson::JsonLayer::new(std::io::stderr).with_target(true))
        .init();
}

fn setup_rustls() {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        debug!("rustls crypto provider already installed");
    }
}

#[tokio::main]
async fn main() {
    setup_logging();
    setup_rustls();

    let config = Config::from_env().unwrap_or_else(|e| fatal("config error", &e));
    let transport = HttpTransport::new(config.export_timeout, config.compression)
        .unwrap_or_else(|e| fatal("failed to build HTTP client", &e));

    let buffer = EventBuffer::new(transport, config.buffer);
    match config.destination {
        Some(destination) => buffer.configure(destination),
        None => info!("EVENT_RELAY_ENDPOINT not set, events will be buffered but not sent"),
    }
    buffer.set_actor(config.user_id);

    let cancel = CancellationToken::new();
    let ticker = config
        .flush_interval
        .map(|period| tokio::spawn(flush_timer::run(buffer.clone(), period, cancel.clone())));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "failed to read stdin");
                break;
            }
        };
        match Command::parse_line(&line) {
            Some(Command::Track { event, data }) => buffer.record(event, data),
            Some(Command::Identify { user_id }) => buffer.set_actor(user_id),
            Some(Command::Flush) => match buffer.flush().await {
                Ok(outcome) => debug!(?outcome, "explicit flush"),
                Err(e) => error!(error = %e, "explicit flush failed"),
            },
            None => {}
        }
    }

    cancel.cancel();
    if let Some(ticker) = ticker
        && let Err(e) = ticker.await
    {
        error!(error = %e, "periodic flush task panicked");
    }
    buffer.join_flush_task().await;

    match buffer.drain().await {
        Ok(count) => debug!(count, "final drain delivered events"),
        Err(e) => error!(error = %e, pending = buffer.len(), "final drain failed"),
    }
}
