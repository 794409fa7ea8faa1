//! HarborKV CLI Client
//!
//! Command-line interface for interacting with a HarborKV node.

use std::net::TcpStream;
use std::process;
use std::time::Duration;

use clap::{Parser, Subcommand};
use harborkv::protocol::{round_trip, Command, Response, Status};

/// HarborKV CLI
#[derive(Parser, Debug)]
#[command(name = "harborkv-cli")]
#[command(about = "CLI for HarborKV key-value store")]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:7001")]
    server: String,

    /// Socket timeout in milliseconds
    #[arg(long, default_value = "5000")]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Get a value by key
    Get {
        /// The key to get
        key: String,
    },

    /// Set a key-value pair
    Set {
        /// The key to set
        key: String,

        /// The value to set
        value: String,
    },

    /// Delete a key
    Del {
        /// The key to delete
        key: String,
    },

    /// Atomically set several KEY=VALUE pairs
    Bulk {
        #[arg(required = true, value_parser = parse_pair)]
        pairs: Vec<(String, String)>,
    },

    /// Delete every key in [START, END)
    DeleteRange { start: String, end: String },

    /// Ping the server
    Ping,

    /// Show node role, term and counters
    Status,
}

fn parse_pair(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))
}

fn main() {
    let args = Args::parse();

    let command = match args.command {
        Commands::Get { key } => Command::Get {
            key: key.into_bytes(),
        },
        Commands::Set { key, value } => Command::Set {
            key: key.into_bytes(),
            value: value.into_bytes(),
        },
        Commands::Del { key } => Command::Delete {
            key: key.into_bytes(),
        },
        Commands::Bulk { pairs } => Command::BulkSet {
            pairs: pairs
                .into_iter()
                .map(|(k, v)| (k.into_bytes(), v.into_bytes()))
                .collect(),
        },
        Commands::DeleteRange { start, end } => Command::DeleteRange {
            start: start.into_bytes(),
            end: end.into_bytes(),
        },
        Commands::Ping => Command::Ping,
        Commands::Status => Command::Status,
    };

    let timeout = Duration::from_millis(args.timeout_ms);
    let result = TcpStream::connect(&args.server).and_then(|stream| {
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        Ok(stream)
    });
    let mut stream = match result {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("Failed to connect to {}: {}", args.server, e);
            process::exit(1);
        }
    };

    match round_trip(&mut stream, command) {
        Ok(response) => process::exit(print_response(&response)),
        Err(e) => {
            eprintln!("Request failed: {}", e);
            process::exit(1);
        }
    }
}

fn print_response(response: &Response) -> i32 {
    match response.status {
        Status::Ok => {
            match &response.payload {
                Some(_) => println!("{}", response.text()),
                None => println!("OK"),
            }
            0
        }
        Status::NotFound => {
            println!("(nil)");
            1
        }
        Status::NotLeader => {
            match response.leader_hint() {
                Some(leader) => eprintln!("Not the leader; try node {}", leader),
                None => eprintln!("Not the leader; no leader known"),
            }
            2
        }
        Status::Conflict => {
            match response.siblings() {
                Ok(siblings) => {
                    eprintln!("{} concurrent versions:", siblings.len());
                    for sibling in siblings {
                        let value = sibling
                            .value
                            .as_deref()
                            .map(|v| String::from_utf8_lossy(v).into_owned())
                            .unwrap_or_else(|| "<deleted>".to_string());
                        eprintln!(
                            "  {} (node {}, ts {})",
                            value, sibling.version.origin, sibling.version.timestamp
                        );
                    }
                }
                Err(e) => eprintln!("Conflict (unreadable siblings: {})", e),
            }
            3
        }
        Status::Error => {
            eprintln!("Error: {}", response.text());
            1
        }
    }
}
