//! Ticket submission, status and dashboard commands

use anyhow::Result;
use colored::Colorize;
use tabled::Tabled;

use crate::client::{ApiClient, TicketView};
use crate::output::{
    color_confidence, color_status, format_timestamp, or_dash, print_info, print_json,
    print_success, print_warning, truncate_id, truncate_text, OutputFormat,
};

/// Row for ticket listings
#[derive(Tabled)]
pub(crate) struct TicketRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Subject")]
    subject: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Category")]
    category: String,
    #[tabled(rename = "Cat. Conf")]
    category_confidence: String,
    #[tabled(rename = "Priority")]
    priority: String,
    #[tabled(rename = "Pri. Conf")]
    priority_confidence: String,
    #[tabled(rename = "Created")]
    created_at: String,
}

impl From<&TicketView> for TicketRow {
    fn from(t: &TicketView) -> Self {
        // Final labels win once a ticket is completed
        let category = t.final_category.as_deref().or(t.predicted_category.as_deref());
        let priority = t.final_priority.as_deref().or(t.predicted_priority.as_deref());
        Self {
            id: truncate_id(&t.ticket_id),
            subject: truncate_text(&t.subject, 40),
            status: color_status(&t.status),
            category: or_dash(category),
            category_confidence: color_confidence(t.prediction_confidence_category),
            priority: or_dash(priority),
            priority_confidence: color_confidence(t.prediction_confidence_priority),
            created_at: format_timestamp(&t.created_at),
        }
    }
}

pub(crate) fn print_tickets(tickets: &[TicketView], empty_message: &str) {
    if tickets.is_empty() {
        print_warning(empty_message);
        return;
    }

    let rows: Vec<TicketRow> = tickets.iter().map(TicketRow::from).collect();
    let table = tabled::Table::new(rows)
        .with(tabled::settings::Style::rounded())
        .to_string();
    println!("{}", table);
    println!("\nTotal: {} tickets", tickets.len());
}

/// Submit a ticket for classification
pub async fn submit(
    client: &ApiClient,
    subject: &str,
    description: &str,
    format: OutputFormat,
) -> Result<()> {
    let accepted = client.submit_ticket(subject, description).await?;

    match format {
        OutputFormat::Json => print_json(&accepted)?,
        OutputFormat::Table => {
            print_success(&accepted.message);
            println!("Ticket ID: {}", accepted.ticket_id.bold());
            print_info(&format!("Check progress with `triage status {}`", accepted.ticket_id));
        }
    }

    Ok(())
}

/// Show the classification result of one ticket
pub async fn status(client: &ApiClient, ticket_id: &str, format: OutputFormat) -> Result<()> {
    let result = client.ticket_status(ticket_id).await?;

    match format {
        OutputFormat::Json => print_json(&result)?,
        OutputFormat::Table => {
            println!("Ticket:    {}", result.ticket_id);
            println!("Status:    {}", color_status(&result.status));
            println!(
                "Predicted: {} / {}",
                or_dash(result.predicted_category.as_deref()),
                or_dash(result.predicted_priority.as_deref())
            );
            println!(
                "Final:     {} / {}",
                or_dash(result.final_category.as_deref()),
                or_dash(result.final_priority.as_deref())
            );
            if result.status == "PENDING_REVIEW" {
                print_warning("Waiting for a reviewer");
            }
        }
    }

    Ok(())
}

/// List the most recent tickets
pub async fn recent(client: &ApiClient, limit: usize, format: OutputFormat) -> Result<()> {
    let tickets = client.recent_tickets(limit).await?;

    match format {
        OutputFormat::Json => print_json(&tickets)?,
        OutputFormat::Table => print_tickets(&tickets, "No tickets found"),
    }

    Ok(())
}

/// Show status and category breakdowns
pub async fn stats(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let stats = client.stats().await?;

    match format {
        OutputFormat::Json => print_json(&stats)?,
        OutputFormat::Table => {
            println!("{}", "Status".bold());
            println!("  {:<16} {}", color_status("COMPLETED"), stats.status_breakdown.completed);
            println!(
                "  {:<16} {}",
                color_status("PENDING_REVIEW"),
                stats.status_breakdown.pending_review
            );
            println!("  {:<16} {}", color_status("PROCESSING"), stats.status_breakdown.processing);

            if !stats.category_breakdown.is_empty() {
                println!("\n{}", "Category".bold());
                let mut categories: Vec<_> = stats.category_breakdown.iter().collect();
                categories.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
                for (category, count) in categories {
                    println!("  {:<16} {}", category, count);
                }
            }

            println!("\nTotal: {} tickets", stats.total);
        }
    }

    Ok(())
}
