use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tcp_rpc_server::client::{ClientError, RpcClient};

#[derive(Parser)]
#[command(name = "rpc-cli")]
#[command(about = "Command-line client for the TCP JSON-RPC server", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "127.0.0.1:6000")]
    addr: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Call any method with optional JSON params
    Call {
        method: String,
        /// Parameters as a JSON document, e.g. '{"name":"Ada"}'
        params: Option<String>,
    },
    /// Send a notification (no response expected)
    Notify {
        method: String,
        params: Option<String>,
    },
    /// Shortcut for SayHello
    Hello { name: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let mut client = RpcClient::connect(&cli.addr).await?;

    match cli.command {
        Commands::Call { method, params } => {
            let params = parse_params(params.as_deref())?;
            print_result(client.call(&method, params).await)?;
        }
        Commands::Notify { method, params } => {
            let params = parse_params(params.as_deref())?;
            client.notify(&method, params).await?;
        }
        Commands::Hello { name } => {
            print_result(client.call("SayHello", Some(json!({ "name": name }))).await)?;
        }
    }

    Ok(())
}

fn parse_params(raw: Option<&str>) -> Result<Option<Value>, serde_json::Error> {
    raw.map(serde_json::from_str).transpose()
}

fn print_result(result: Result<Value, ClientError>) -> Result<(), Box<dyn std::error::Error>> {
    match result {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        Err(ClientError::Rpc(err)) => {
            eprintln!("Error: server returned {} ({})", err.code, err.message);
            if let Some(data) = err.data {
                eprintln!("Details: {data}");
            }
        }
        Err(other) => return Err(other.into()),
    }
    Ok(())
}
