//! CLI module for Shardbus
//!
//! - `serve`: run a service instance until Ctrl+C
//! - `publish`: publish one message and exit

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::Value;
use shardbus_core::{Headers, PublishOptions};

use crate::server;

/// Shardbus CLI
#[derive(Parser, Debug)]
#[command(name = "shardbus")]
#[command(about = "Sharded event bus over Redis streams")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a service instance (default)
    Serve,
    /// Publish a message on a channel
    Publish {
        /// Channel name
        channel: String,
        /// JSON payload
        payload: String,
        /// Partition key; messages with the same key are consumed in order
        #[arg(long)]
        key: Option<String>,
        /// Header as `name=value`; repeatable
        #[arg(long = "header", value_name = "NAME=VALUE")]
        headers: Vec<String>,
    },
}

/// Run the CLI command
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Some(Commands::Serve) | None => {
            let config = server::load_config()?;
            server::run(config).await
        }
        Some(Commands::Publish {
            channel,
            payload,
            key,
            headers,
        }) => {
            let content: Value =
                serde_json::from_str(&payload).context("Payload is not valid JSON")?;
            let mut options = PublishOptions::new().with_headers(parse_headers(&headers)?);
            if let Some(key) = key {
                options = options.with_key(key);
            }

            let config = server::load_config()?;
            let id = server::publish(&config, &channel, content, options).await?;
            println!("{}", id);
            Ok(())
        }
    }
}

fn parse_headers(raw: &[String]) -> anyhow::Result<Headers> {
    let mut headers = Headers::new();
    for entry in raw {
        let Some((name, value)) = entry.split_once('=') else {
            bail!("Invalid header `{}`: expected NAME=VALUE", entry);
        };
        headers.insert(name.trim().to_string(), value.to_string());
    }
    Ok(headers)
}
