use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use bridgelet::{BridgeClient, ClientConfig, ServerConfig, SharedSink, TracingSink, VERSION};

const USAGE: &str = "\
Usage: bridgelet [serve] [OPTIONS]
       bridgelet client [OPTIONS]

Serve options:
  --host <addr>            Listen address [default: 0.0.0.0]
  --port <port>            Bridge port [default: 6969]
  --channel-port <port>    Channel port [default: 7979]
  --password <secret>      Shared secret [default: password]
  --auth-timeout-ms <ms>   Authentication deadline [default: 10000]
  --strict-after-auth      Close authenticated bridges on malformed records

Client options:
  --host <addr>            Bridge host [default: 127.0.0.1]
  --port <port>            Bridge port [default: 6969]
  --password <secret>      Shared secret [default: password]
  --retry-ms <ms>          Reconnect interval [default: 3000]
  --no-auto-connect        Exit after the first connection ends

Environment:
  BRIDGELET_HOST, BRIDGELET_BRIDGE_PORT, BRIDGELET_CHANNEL_PORT,
  BRIDGELET_PASSWORD, BRIDGELET_AUTH_TIMEOUT_MS, BRIDGELET_MAX_FRAME_BYTES,
  BRIDGELET_STRICT_AFTER_AUTH, BRIDGELET_CONNECT_HOST, BRIDGELET_AUTO_CONNECT,
  BRIDGELET_RETRY_INTERVAL_MS, BRIDGELET_LOG, LOG_FORMAT=json";

enum Mode {
    Serve(ServerConfig),
    Client(ClientConfig),
    Help,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let mode = match parse_args(&args) {
        Ok(Mode::Help) => {
            println!("bridgelet {VERSION}");
            println!();
            println!("{USAGE}");
            return;
        }
        Ok(mode) => mode,
        Err(msg) => {
            eprintln!("error: {msg}");
            eprintln!();
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    init_tracing();
    info!("bridgelet {}", VERSION);

    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")
        .and_then(|runtime| runtime.block_on(run(mode)));

    if let Err(e) = result {
        tracing::error!("{e:#}");
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

async fn run(mode: Mode) -> anyhow::Result<()> {
    let sink: SharedSink = Arc::new(TracingSink);
    let shutdown = CancellationToken::new();

    match mode {
        Mode::Serve(config) => {
            bridgelet::serve(config, sink, shutdown).await?;
        }
        Mode::Client(config) => {
            let client = BridgeClient::new(config, sink);
            let signal_shutdown = shutdown.clone();
            tokio::spawn(async move {
                bridgelet::shutdown_signal().await;
                signal_shutdown.cancel();
            });
            client
                .run(shutdown)
                .await
                .with_context(|| format!("failed to connect to {}", client.config().target()))?;
        }
        Mode::Help => {}
    }
    Ok(())
}

fn parse_args(args: &[String]) -> Result<Mode, String> {
    let mut rest = args.iter().skip(1).peekable(); // skip argv[0]

    let client = match rest.peek().map(|s| s.as_str()) {
        Some("client") => {
            rest.next();
            true
        }
        Some("serve") => {
            rest.next();
            false
        }
        _ => false,
    };

    let mut server = ServerConfig::from_env().map_err(|e| e.to_string())?;
    let mut peer = ClientConfig::from_env().map_err(|e| e.to_string())?;

    while let Some(arg) = rest.next() {
        let mut value = |flag: &str| -> Result<String, String> {
            rest.next()
                .cloned()
                .ok_or_else(|| format!("{flag} requires a value"))
        };

        match arg.as_str() {
            "--help" | "-h" => return Ok(Mode::Help),
            "--host" => {
                let host = value("--host")?;
                server.host = host.clone();
                peer.host = host;
            }
            "--port" => {
                let port = parse_number::<u16>("--port", &value("--port")?)?;
                server.bridge_port = port;
                peer.port = port;
            }
            "--password" => {
                let password = value("--password")?;
                server.password = password.clone();
                peer.password = password;
            }
            "--channel-port" if !client => {
                server.channel_port = parse_number("--channel-port", &value("--channel-port")?)?;
            }
            "--auth-timeout-ms" if !client => {
                let millis = parse_number("--auth-timeout-ms", &value("--auth-timeout-ms")?)?;
                server.auth_timeout = Duration::from_millis(millis);
            }
            "--strict-after-auth" if !client => server.strict_after_auth = true,
            "--retry-ms" if client => {
                let millis = parse_number("--retry-ms", &value("--retry-ms")?)?;
                peer.retry_interval = Duration::from_millis(millis);
            }
            "--no-auto-connect" if client => peer.auto_connect = false,
            other if other.starts_with('-') => return Err(format!("unknown flag: {other}")),
            other => return Err(format!("unexpected argument: {other}")),
        }
    }

    Ok(if client {
        Mode::Client(peer)
    } else {
        Mode::Serve(server)
    })
}

fn parse_number<T: std::str::FromStr>(flag: &str, raw: &str) -> Result<T, String> {
    raw.parse()
        .map_err(|_| format!("invalid value for {flag}: {raw}"))
}

/// Initialize tracing with BRIDGELET_LOG and LOG_FORMAT support.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("BRIDGELET_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };

        // Per-record codec traces are noise unless explicitly asked for.
        EnvFilter::new(format!(
            "bridgelet={level},bridgelet::bridge::codec=warn",
            level = base_level
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}
