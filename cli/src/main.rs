use std::io::{self, Read};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use rpclink::{ClientConfig, ConfigError, ProcedureKind, Rpc, RpcError, TransportError, TransportKind};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("connect failed: {0}")]
    Connect(#[from] TransportError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("invalid JSON input: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("failed to read input: {0}")]
    Io(#[from] io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "rpclink", about = "Call RPC procedures by name")]
struct Cli {
    /// Server endpoint, e.g. http://localhost:9000/rpc
    #[arg(long, env = "RPC_ENDPOINT")]
    endpoint: String,

    /// `request-response` or `persistent`
    #[arg(long, env = "RPC_TRANSPORT", default_value = "request-response")]
    transport: TransportKind,

    /// Request timeout in seconds; 0 disables it
    #[arg(long, env = "RPC_REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a query and print its output
    Query(CallArgs),
    /// Run a mutation and print its output
    Mutate(CallArgs),
    /// Print subscription events as JSON lines until the stream ends or Ctrl-C
    Subscribe(SubscribeArgs),
}

#[derive(Args, Debug)]
struct CallArgs {
    procedure: String,

    #[arg(long, help = "JSON input, or - for stdin")]
    input: Option<String>,
}

#[derive(Args, Debug)]
struct SubscribeArgs {
    #[command(flatten)]
    call: CallArgs,

    #[arg(long, help = "Stop after this many events")]
    max_events: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let timeout = (cli.timeout_secs > 0).then(|| Duration::from_secs(cli.timeout_secs));
    let config = ClientConfig::new(&cli.endpoint)?.with_transport(cli.transport).with_request_timeout(timeout);
    let rpc = Rpc::connect(&config).await?;

    let result = match cli.command {
        Command::Query(args) => run_call(&rpc, ProcedureKind::Query, args).await,
        Command::Mutate(args) => run_call(&rpc, ProcedureKind::Mutation, args).await,
        Command::Subscribe(args) => run_subscribe(&rpc, args).await,
    };
    rpc.shutdown().await;
    result
}

async fn run_call(rpc: &Rpc, kind: ProcedureKind, args: CallArgs) -> Result<(), CliError> {
    let input = read_input(args.input.as_deref())?;
    let output = rpc.client().call(kind, &args.procedure, input).await?;
    print_json(&output)
}

async fn run_subscribe(rpc: &Rpc, args: SubscribeArgs) -> Result<(), CliError> {
    let input = read_input(args.call.input.as_deref())?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let errors = tx.clone();

    let handle = rpc.client().subscribe_raw(
        &args.call.procedure,
        input,
        move |event| {
            let _ = tx.send(Ok(event));
        },
        move |err| {
            let _ = errors.send(Err(err));
        },
        || {},
    );

    let mut received = 0;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                debug!(id = %handle.id(), "rpc: interrupted");
                handle.cancel();
                return Ok(());
            }
            event = rx.recv() => match event {
                Some(Ok(event)) => {
                    println!("{}", serde_json::to_string(&event)?);
                    received += 1;
                    if args.max_events.is_some_and(|max| received >= max) {
                        handle.cancel();
                        return Ok(());
                    }
                }
                Some(Err(err)) => return Err(err.into()),
                None => return Ok(()),
            },
        }
    }
}

fn read_input(raw: Option<&str>) -> Result<Value, CliError> {
    match raw {
        None => Ok(Value::Null),
        Some("-") => {
            let mut text = String::new();
            io::stdin().read_to_string(&mut text)?;
            Ok(serde_json::from_str(&text)?)
        }
        Some(text) => Ok(serde_json::from_str(text)?),
    }
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}
