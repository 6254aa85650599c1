use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use std::path::PathBuf;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use wshub::protocol::{self, Envelope, RpcRequest, RpcResponse};

type Ws = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Parser)]
#[command(name = "wshub")]
#[command(about = "wshub CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config file.
    Init {
        /// Config file path (default: WSHUB_CONFIG_PATH or ~/.wshub/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Run the relay (HTTP health + WebSocket channels on one port).
    Relay {
        /// Config file path (default: WSHUB_CONFIG_PATH or ~/.wshub/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Listen port (default: WSHUB_PORT, then config, then 24678)
        #[arg(long, short)]
        port: Option<u16>,

        /// Bind address (default from config or 127.0.0.1)
        #[arg(long, short)]
        bind: Option<String>,
    },

    /// Send one request to a channel as a client and print the response.
    Call {
        /// Config file path (default: WSHUB_CONFIG_PATH or ~/.wshub/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Channel path, e.g. /notes
        #[arg(long)]
        path: String,

        /// Method name
        #[arg(long, short)]
        method: String,

        /// Params as JSON (default: null)
        #[arg(long, value_name = "JSON")]
        params: Option<String>,

        /// Give up after this many seconds
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
    },

    /// Print every notification broadcast on a channel until interrupted.
    Listen {
        /// Config file path (default: WSHUB_CONFIG_PATH or ~/.wshub/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Channel path, e.g. /notes
        #[arg(long)]
        path: String,
    },

    /// Attach a demo backend to a channel (methods: ping, echo, time).
    Serve {
        /// Config file path (default: WSHUB_CONFIG_PATH or ~/.wshub/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Channel path, e.g. /notes
        #[arg(long)]
        path: String,

        /// Broadcast a `tick` notification every N milliseconds
        #[arg(long, value_name = "MS")]
        tick_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = match cli.command {
        Some(Commands::Relay { .. }) | Some(Commands::Serve { .. }) => "info",
        _ => "warn",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    let result = match cli.command {
        Some(Commands::Version) => {
            println!("wshub {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Commands::Init { config }) => run_init(config),
        Some(Commands::Relay { config, port, bind }) => run_relay(config, port, bind).await,
        Some(Commands::Call {
            config,
            path,
            method,
            params,
            timeout_secs,
        }) => run_call(config, path, method, params, timeout_secs).await,
        Some(Commands::Listen { config, path }) => run_listen(config, path).await,
        Some(Commands::Serve {
            config,
            path,
            tick_ms,
        }) => run_serve(config, path, tick_ms).await,
        None => {
            println!("Run with --help for usage");
            Ok(())
        }
    };

    if let Err(e) = result {
        log::error!("{:#}", e);
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(wshub::config::default_config_path);
    let dir = wshub::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_relay(
    config_path: Option<PathBuf>,
    port: Option<u16>,
    bind: Option<String>,
) -> anyhow::Result<()> {
    let (mut config, path) = wshub::config::load_config(config_path)?;
    log::debug!("loaded config from {}", path.display());
    if let Some(b) = bind {
        config.relay.bind = b;
    }
    wshub::relay::run_relay(config, port).await
}

/// WebSocket URL for `path` on the relay described by the config.
fn url_for(config_path: Option<PathBuf>, path: &str, is_server: bool) -> anyhow::Result<(wshub::config::Config, String)> {
    let (config, _) = wshub::config::load_config(config_path)?;
    let port = wshub::config::resolve_relay_port(&config);
    let url = wshub::config::channel_url(&config.relay.bind, port, path, is_server);
    Ok((config, url))
}

async fn run_call(
    config_path: Option<PathBuf>,
    path: String,
    method: String,
    params: Option<String>,
    timeout_secs: u64,
) -> anyhow::Result<()> {
    let params: serde_json::Value = match params {
        Some(p) => serde_json::from_str(&p).map_err(|e| anyhow::anyhow!("invalid --params JSON: {}", e))?,
        None => serde_json::Value::Null,
    };
    let (_, url) = url_for(config_path, &path, false)?;
    let (mut ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .map_err(|e| anyhow::anyhow!("connecting to {}: {}", url, e))?;

    let request = RpcRequest::new(1, method, params);
    let id = protocol::correlation_key(&request.id);
    ws.send(Message::Text(Envelope::Request(request).to_json())).await?;

    let res = tokio::time::timeout(Duration::from_secs(timeout_secs), wait_response(&mut ws, &id))
        .await
        .map_err(|_| anyhow::anyhow!("no response within {}s", timeout_secs))??;
    let _ = ws.close(None).await;

    if let Some(err) = res.error {
        anyhow::bail!("{} (code {})", err.message, err.code);
    }
    println!("{}", serde_json::to_string_pretty(&res.result)?);
    Ok(())
}

/// Read frames until the response correlated with `id` arrives.
async fn wait_response(ws: &mut Ws, id: &str) -> anyhow::Result<RpcResponse> {
    while let Some(msg) = ws.next().await {
        let text = match msg? {
            Message::Text(text) => text,
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(e) => {
                    log::warn!("binary frame is not utf-8: {}", e);
                    continue;
                }
            },
            Message::Close(_) => break,
            _ => continue,
        };
        match protocol::decode(&text) {
            Ok(Envelope::Response(res)) if protocol::correlation_key(&res.id) == id => return Ok(res),
            Ok(other) => log::debug!("ignoring {} while waiting for response", other.kind()),
            Err(e) => log::warn!("undecodable frame: {}", e),
        }
    }
    anyhow::bail!("connection closed before a response arrived")
}

async fn run_listen(config_path: Option<PathBuf>, path: String) -> anyhow::Result<()> {
    let (_, url) = url_for(config_path, &path, false)?;
    let (mut ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .map_err(|e| anyhow::anyhow!("connecting to {}: {}", url, e))?;
    eprintln!("listening on {}", url);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            msg = ws.next() => {
                let Some(msg) = msg else { break };
                let Message::Text(text) = msg? else { continue };
                match protocol::decode(&text) {
                    Ok(Envelope::Notification(n)) => println!("{} {}", n.method, n.data),
                    Ok(other) => log::debug!("ignoring {}", other.kind()),
                    Err(e) => log::warn!("undecodable frame: {}", e),
                }
            }
        }
    }
    let _ = ws.close(None).await;
    Ok(())
}

async fn run_serve(config_path: Option<PathBuf>, path: String, tick_ms: Option<u64>) -> anyhow::Result<()> {
    use wshub::rpc::{HandlerReply, RpcBackend};

    let (config, url) = url_for(config_path, &path, true)?;
    let backend = RpcBackend::connect(url.clone(), (&config.connector).into())?;
    backend
        .add_message_handler("ping", |_req| async { Ok(HandlerReply::Done) })
        .await;
    backend
        .add_message_handler("echo", |req: RpcRequest| async move { Ok(req.params.into()) })
        .await;
    backend
        .add_message_handler("time", |_req| async {
            Ok(serde_json::json!({ "now": protocol::now_ms() }).into())
        })
        .await;
    log::info!("serving {} (methods: {:?})", url, backend.handlers().methods().await);

    let mut ticker = tick_ms.map(|ms| tokio::time::interval(Duration::from_millis(ms.max(1))));
    let mut n: u64 = 0;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = async {
                match ticker.as_mut() {
                    Some(t) => { t.tick().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {
                n += 1;
                if !backend.send_notification("tick", serde_json::json!({ "n": n })) {
                    log::debug!("tick {} not sent, backend is detached", n);
                }
            }
        }
    }
    backend.close();
    log::info!("backend stopped");
    Ok(())
}
