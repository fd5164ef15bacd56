//! iproto command-line tool.
//!
//! # Usage
//!
//! ```bash
//! # Check that servers answer
//! iproto ping -a 127.0.0.1:3301 -a 127.0.0.1:3302
//!
//! # Call a stored function, arguments as a JSON array
//! iproto call -a 127.0.0.1:3301 box.info
//! iproto --retries 3 call -a 127.0.0.1:3301 crud.select '["users", [["=", "id", 1]]]'
//!
//! # Ask an entry server for the healthy members of its cluster
//! iproto discover -a 127.0.0.1:3301 get_routers
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use argh::FromArgs;
use tracing::{debug, info};

use iproto_cli::{parse_args, value_to_json};
use iproto_client::{ClientConfig, Connection, RequestDispatcher, TcpConnector};
use iproto_cluster::{
    Client, ClusterAddressProvider, DiscoveryAddressProvider, DiscoveryConfig, ErrorPredicate,
    RetryDelay, RetryPolicy, StaticAddressProvider,
};
use iproto_common::ServerAddress;

#[derive(FromArgs)]
/// iproto - client for servers speaking the iproto binary protocol
struct Cli {
    /// connections opened per server address
    #[argh(option, default = "1")]
    connections: usize,

    /// request timeout in milliseconds
    #[argh(option, long = "request-timeout-ms", default = "2000")]
    request_timeout_ms: u64,

    /// retries of a request failing with a network or no-such-procedure error
    #[argh(option, default = "0")]
    retries: u32,

    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Ping(PingArgs),
    Call(CallArgs),
    Discover(DiscoverArgs),
}

#[derive(FromArgs)]
/// Ping every given server
#[argh(subcommand, name = "ping")]
struct PingArgs {
    /// server address (host:port), repeatable
    #[argh(option, short = 'a', long = "address")]
    addresses: Vec<String>,
}

#[derive(FromArgs)]
/// Call a stored function and print the result as JSON
#[argh(subcommand, name = "call")]
struct CallArgs {
    /// server address (host:port), repeatable
    #[argh(option, short = 'a', long = "address")]
    addresses: Vec<String>,

    /// function name
    #[argh(positional)]
    function: String,

    /// arguments as JSON, an array for several arguments
    #[argh(positional)]
    args: Option<String>,
}

#[derive(FromArgs)]
/// Print the healthy cluster members reported by an entry server
#[argh(subcommand, name = "discover")]
struct DiscoverArgs {
    /// entry server address (host:port)
    #[argh(option, short = 'a', long = "address")]
    address: String,

    /// discovery function name
    #[argh(positional)]
    function: String,
}

impl Cli {
    fn client_config(&self) -> ClientConfig {
        ClientConfig {
            connections: self.connections,
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            ..Default::default()
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        if self.retries == 0 {
            return RetryPolicy::none();
        }
        RetryPolicy::by_attempts(
            self.retries.saturating_add(1),
            ErrorPredicate::network_errors().or(ErrorPredicate::no_such_procedure()),
            RetryDelay::default(),
        )
    }
}

fn parse_addresses(raw: &[String]) -> Result<Vec<ServerAddress>> {
    if raw.is_empty() {
        bail!("at least one --address is required");
    }
    raw.iter()
        .map(|address| {
            address
                .parse::<ServerAddress>()
                .with_context(|| format!("invalid address '{}'", address))
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Keep stdout clean for call, its output is meant to be piped
    if !matches!(cli.command, Commands::Call(_)) {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .with_writer(std::io::stderr)
            .init();
    }

    match &cli.command {
        Commands::Ping(args) => run_ping(&cli, args).await,
        Commands::Call(args) => run_call(&cli, args).await,
        Commands::Discover(args) => run_discover(&cli, args).await,
    }
}

async fn run_ping(cli: &Cli, args: &PingArgs) -> Result<()> {
    let addresses = parse_addresses(&args.addresses)?;
    let config = cli.client_config();

    let mut failed = 0;
    for address in addresses {
        debug!(address = %address, "Pinging");
        let start = Instant::now();
        let outcome = async {
            let connection = Connection::connect(address.clone(), &config, &TcpConnector).await?;
            let result = connection.ping().await;
            connection.close().await?;
            result.map(|_| connection.greeting().server_version.clone())
        }
        .await;

        match outcome {
            Ok(version) => println!(
                "{}: ok ({}, {:.1}ms)",
                address,
                version,
                start.elapsed().as_secs_f64() * 1000.0
            ),
            Err(e) => {
                failed += 1;
                println!("{}: {}", address, e);
            }
        }
    }

    if failed > 0 {
        bail!("{} server(s) did not answer", failed);
    }
    Ok(())
}

async fn run_call(cli: &Cli, args: &CallArgs) -> Result<()> {
    let addresses = parse_addresses(&args.addresses)?;
    let call_args = match &args.args {
        Some(raw) => parse_args(raw)?,
        None => Vec::new(),
    };

    let client = Client::with_provider(
        Arc::new(StaticAddressProvider::new(addresses)),
        cli.client_config(),
        Arc::new(TcpConnector),
        cli.retry_policy(),
    )
    .await?;

    let result = client.call(&args.function, call_args).await;
    client.close().await?;

    let data = result.with_context(|| format!("call to '{}' failed", args.function))?;
    println!("{}", serde_json::to_string(&value_to_json(&data))?);
    Ok(())
}

async fn run_discover(cli: &Cli, args: &DiscoverArgs) -> Result<()> {
    let entry = parse_addresses(std::slice::from_ref(&args.address))?;
    info!(entry = %args.address, function = %args.function, "Running discovery");

    let client = Arc::new(
        Client::with_provider(
            Arc::new(StaticAddressProvider::new(entry)),
            cli.client_config(),
            Arc::new(TcpConnector),
            cli.retry_policy(),
        )
        .await?,
    );

    let discovered =
        DiscoveryAddressProvider::start(client.clone(), DiscoveryConfig::new(&args.function)).await;
    let topology = discovered.map(|provider| {
        let topology = provider.topology();
        provider.close();
        topology
    });
    client.close().await?;

    let topology = topology.context("discovery failed")?;
    let addresses: Vec<String> = topology.addresses.iter().map(ToString::to_string).collect();
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "epoch": topology.epoch,
            "addresses": addresses,
        }))?
    );
    Ok(())
}
