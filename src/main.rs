use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use url::Url;
use vanopticon_bifrost::{config, rpc::HttpPrimaryClient, run};

#[derive(Parser)]
#[command(name = "bifrost", about = "Bifrost - cross-datacenter ACL and federation state replication")]
struct Cli {
	#[command(subcommand)]
	command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
	/// Run the server (default)
	Run {
		/// Extra configuration file layered over the standard locations
		#[arg(long = "config")]
		config_path: Option<PathBuf>,
	},
	/// Print a node's ACL replication status
	Status {
		/// HTTP address of the node to query
		#[arg(long, default_value = "http://127.0.0.1:8500")]
		addr: Url,
		/// Token sent with the request
		#[arg(long)]
		token: Option<String>,
	},
}

#[tokio::main]
async fn main() {
	let cli = Cli::parse();

	match cli.command.unwrap_or(Commands::Run { config_path: None }) {
		Commands::Run { config_path } => {
			let settings = match config::load_with(config_path.as_deref()) {
				Ok(settings) => settings,
				Err(e) => {
					eprintln!("Failed to load config: {}", e);
					std::process::exit(1);
				}
			};
			if let Err(e) = run(settings).await {
				eprintln!("bifrost exited with error: {:#}", e);
				std::process::exit(1);
			}
		}
		Commands::Status { addr, token } => {
			let client = match HttpPrimaryClient::new(addr, token, Duration::ZERO) {
				Ok(client) => client,
				Err(e) => {
					eprintln!("Failed to build HTTP client: {}", e);
					std::process::exit(1);
				}
			};
			match client.replication_status().await {
				Ok(status) => match serde_json::to_string_pretty(&status) {
					Ok(json) => println!("{}", json),
					Err(e) => eprintln!("Failed to encode status: {}", e),
				},
				Err(e) => {
					eprintln!("Failed to fetch replication status: {}", e);
					std::process::exit(1);
				}
			}
		}
	}
}
