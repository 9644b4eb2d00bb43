//! Human review commands

use anyhow::Result;

use super::tickets::print_tickets;
use crate::client::ApiClient;
use crate::output::{color_status, or_dash, print_json, print_success, OutputFormat};

/// List tickets waiting for review, oldest first
pub async fn review_queue(client: &ApiClient, limit: usize, format: OutputFormat) -> Result<()> {
    let tickets = client.review_queue(limit).await?;

    match format {
        OutputFormat::Json => print_json(&tickets)?,
        OutputFormat::Table => print_tickets(&tickets, "Review queue is empty"),
    }

    Ok(())
}

/// Complete a pending ticket with reviewer labels
pub async fn review(
    client: &ApiClient,
    ticket_id: &str,
    category: &str,
    priority: &str,
    format: OutputFormat,
) -> Result<()> {
    let ticket = client.submit_review(ticket_id, category, priority).await?;

    match format {
        OutputFormat::Json => print_json(&ticket)?,
        OutputFormat::Table => {
            print_success(&format!("Ticket {} reviewed", ticket.ticket_id));
            println!("Status:   {}", color_status(&ticket.status));
            println!(
                "Final:    {} / {}",
                or_dash(ticket.final_category.as_deref()),
                or_dash(ticket.final_priority.as_deref())
            );
            println!(
                "Model:    {} / {}",
                or_dash(ticket.predicted_category.as_deref()),
                or_dash(ticket.predicted_priority.as_deref())
            );
        }
    }

    Ok(())
}
