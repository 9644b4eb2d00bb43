//! Ticket triage CLI
//!
//! A command-line tool for submitting tickets, following their
//! classification and working the human review queue.

mod client;
mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{review, tickets};
use output::{print_error, OutputFormat};
use std::process::ExitCode;

/// Ticket triage CLI
#[derive(Parser)]
#[command(name = "triage")]
#[command(author, version, about = "CLI for the ticket triage service", long_about = None)]
pub struct Cli {
    /// Worker API URL (can also be set via TRIAGE_API_URL env var)
    #[arg(long, env = "TRIAGE_API_URL")]
    pub api_url: Option<String>,

    /// Output format
    #[arg(long, short)]
    pub format: Option<OutputFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Submit a ticket for classification
    Submit {
        /// Ticket subject
        #[arg(long, short)]
        subject: String,

        /// Ticket body
        #[arg(long, short, default_value = "")]
        description: String,
    },

    /// Show the classification result of a ticket
    Status {
        /// Ticket ID
        ticket_id: String,
    },

    /// List the most recent tickets
    Recent {
        /// Maximum number of tickets to show
        #[arg(long, short, default_value_t = 20)]
        limit: usize,
    },

    /// List tickets waiting for human review
    ReviewQueue {
        /// Maximum number of tickets to show
        #[arg(long, short, default_value_t = 50)]
        limit: usize,
    },

    /// Complete a pending ticket with final labels
    Review {
        /// Ticket ID
        ticket_id: String,

        /// Final category
        #[arg(long, short)]
        category: String,

        /// Final priority
        #[arg(long, short)]
        priority: String,
    },

    /// Show ticket statistics
    Stats,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            print_error(&format!("{e:#}"));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = config::Config::load()?;
    let format = cli
        .format
        .or_else(|| config.default_format.as_deref()?.parse().ok())
        .unwrap_or_default();

    // Initialize client
    let client = client::ApiClient::new(&config.resolve_api_url(cli.api_url))?;

    // Execute command
    match cli.command {
        Commands::Submit { subject, description } => {
            tickets::submit(&client, &subject, &description, format).await?;
        }
        Commands::Status { ticket_id } => {
            tickets::status(&client, &ticket_id, format).await?;
        }
        Commands::Recent { limit } => {
            tickets::recent(&client, limit, format).await?;
        }
        Commands::ReviewQueue { limit } => {
            review::review_queue(&client, limit, format).await?;
        }
        Commands::Review {
            ticket_id,
            category,
            priority,
        } => {
            review::review(&client, &ticket_id, &category, &priority, format).await?;
        }
        Commands::Stats => {
            tickets::stats(&client, format).await?;
        }
    }

    Ok(())
}
