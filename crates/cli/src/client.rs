//! API client for the triage worker's HTTP surface

use anyhow::{Context, Result};
use reqwest::{Client, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use url::Url;

/// Non-success response from the API
#[derive(Debug, Error)]
#[error("API error ({status}): {detail}")]
pub struct ApiError {
    pub status: StatusCode,
    pub detail: String,
}

/// API client for the triage worker
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        // Relative joins replace the last path segment unless it ends in a slash
        let base_url = if base_url.ends_with('/') {
            Url::parse(base_url)
        } else {
            Url::parse(&format!("{base_url}/"))
        }
        .context("Invalid API URL")?;

        Ok(Self { client, base_url })
    }

    /// Make a GET request
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send request")?;

        Self::parse(response).await
    }

    /// Make a POST request with JSON body
    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .context("Failed to send request")?;

        Self::parse(response).await
    }

    async fn parse<T: DeserializeOwned>(response: Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // The worker answers errors with {"detail": "..."}
            let detail = serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| e.detail)
                .unwrap_or(body);
            return Err(ApiError { status, detail }.into());
        }

        response.json().await.context("Failed to parse response")
    }

    pub async fn submit_ticket(&self, subject: &str, description: &str) -> Result<TicketAccepted> {
        let request = CreateTicketRequest {
            subject: subject.to_string(),
            description: description.to_string(),
        };
        self.post("tickets", &request).await
    }

    pub async fn ticket_status(&self, ticket_id: &str) -> Result<TicketResult> {
        self.get(&format!("tickets/{ticket_id}")).await
    }

    pub async fn recent_tickets(&self, limit: usize) -> Result<Vec<TicketView>> {
        self.get(&format!("tickets/recent?limit={limit}")).await
    }

    pub async fn review_queue(&self, limit: usize) -> Result<Vec<TicketView>> {
        self.get(&format!("review-queue?limit={limit}")).await
    }

    pub async fn submit_review(
        &self,
        ticket_id: &str,
        final_category: &str,
        final_priority: &str,
    ) -> Result<TicketView> {
        let request = ReviewRequest {
            final_category: final_category.to_string(),
            final_priority: final_priority.to_string(),
        };
        self.post(&format!("review/{ticket_id}"), &request).await
    }

    pub async fn stats(&self) -> Result<Stats> {
        self.get("stats").await
    }
}

// API request and response types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTicketRequest {
    pub subject: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketAccepted {
    pub message: String,
    pub ticket_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketResult {
    pub ticket_id: String,
    pub status: String,
    pub predicted_category: Option<String>,
    pub predicted_priority: Option<String>,
    pub final_category: Option<String>,
    pub final_priority: Option<String>,
}

/// A full ticket row as listed by the API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketView {
    pub ticket_id: String,
    pub subject: String,
    pub description: String,
    pub status: String,
    pub predicted_category: Option<String>,
    pub predicted_priority: Option<String>,
    pub prediction_confidence_category: Option<f64>,
    pub prediction_confidence_priority: Option<f64>,
    pub final_category: Option<String>,
    pub final_priority: Option<String>,
    pub created_at: String,
    pub reviewed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub final_category: String,
    pub final_priority: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusBreakdown {
    pub completed: u64,
    pub pending_review: u64,
    pub processing: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stats {
    pub status_breakdown: StatusBreakdown,
    pub category_breakdown: BTreeMap<String, u64>,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub detail: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use tokio_test::{assert_err, assert_ok};

    const TICKET_ID: &str = "7f1f7f3e-2c1b-4d8e-9a4c-0b6c2d1e5f00";

    #[tokio::test]
    async fn test_submit_ticket_posts_json() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/tickets")
            .match_body(Matcher::Json(serde_json::json!({
                "subject": "Cannot connect to VPN",
                "description": "timeout error"
            })))
            .with_status(202)
            .with_body(format!(
                r#"{{"message":"Ticket received for processing","ticket_id":"{TICKET_ID}"}}"#
            ))
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let accepted = client
            .submit_ticket("Cannot connect to VPN", "timeout error")
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(accepted.ticket_id, TICKET_ID);
    }

    #[tokio::test]
    async fn test_not_found_carries_detail() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", format!("/tickets/{TICKET_ID}").as_str())
            .with_status(404)
            .with_body(r#"{"detail":"Ticket not found"}"#)
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let err = client.ticket_status(TICKET_ID).await.unwrap_err();

        let api_error = err.downcast_ref::<ApiError>().unwrap();
        assert_eq!(api_error.status, StatusCode::NOT_FOUND);
        assert_eq!(api_error.detail, "Ticket not found");
    }

    #[tokio::test]
    async fn test_recent_passes_limit() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/tickets/recent")
            .match_query(Matcher::UrlEncoded("limit".into(), "5".into()))
            .with_status(200)
            .with_body(format!(
                r#"[{{"ticket_id":"{TICKET_ID}","subject":"VPN","description":"down",
                    "status":"PENDING_REVIEW","predicted_category":"Network",
                    "predicted_priority":"High","prediction_confidence_category":0.6,
                    "prediction_confidence_priority":0.88,"category_model_id":1,
                    "priority_model_id":2,"final_category":null,"final_priority":null,
                    "created_at":"2024-05-01T10:00:00Z","reviewed_at":null,
                    "used_for_retraining":false}}]"#
            ))
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let tickets = client.recent_tickets(5).await.unwrap();

        mock.assert_async().await;
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].status, "PENDING_REVIEW");
        assert_eq!(tickets[0].prediction_confidence_category, Some(0.6));
    }

    #[tokio::test]
    async fn test_review_conflict() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", format!("/review/{TICKET_ID}").as_str())
            .with_status(409)
            .with_body(r#"{"detail":"ticket is COMPLETED, not pending review"}"#)
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let err = assert_err!(client.submit_review(TICKET_ID, "Network", "High").await);

        assert_eq!(
            err.downcast_ref::<ApiError>().unwrap().status,
            StatusCode::CONFLICT
        );
    }

    #[tokio::test]
    async fn test_stats_parses_breakdowns() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/stats")
            .with_status(200)
            .with_body(
                r#"{"status_breakdown":{"completed":3,"pending_review":1,"processing":0},
                    "category_breakdown":{"Network":2,"Billing":2},"total":4}"#,
            )
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let stats = assert_ok!(client.stats().await);

        assert_eq!(stats.total, 4);
        assert_eq!(stats.status_breakdown.completed, 3);
        assert_eq!(stats.category_breakdown["Billing"], 2);
    }
}
