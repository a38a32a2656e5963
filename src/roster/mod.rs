use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ProctorError, Result};

const REQUEST_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterResponse {
    pub student_list: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenRequest<'a> {
    #[serde(rename = "ID")]
    pub id: &'a str,
    #[serde(rename = "studentList")]
    pub student_list: &'a [String],
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub token: String,
}

/// Client for the exam backend: roster lookup and managed-routing tokens.
pub struct BackendClient {
    base_url: String,
    client: reqwest::Client,
}

impl BackendClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| ProctorError::Backend(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Participant identities allowed in the coordinator's room
    pub async fn fetch_roster(&self, coordinator_id: &str) -> Result<Vec<String>> {
        let url = format!(
            "{}/teachers/getStudentList/{}",
            self.base_url,
            urlencoding::encode(coordinator_id)
        );

        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(ProctorError::Backend(format!(
                "Roster request failed with status {}: {}",
                status, error_text
            )));
        }

        let roster: RosterResponse = response
            .json()
            .await
            .map_err(|e| ProctorError::Backend(format!("Failed to parse roster: {}", e)))?;

        tracing::info!(
            coordinator_id = %coordinator_id,
            count = roster.student_list.len(),
            "Fetched participant roster"
        );
        Ok(roster.student_list)
    }

    /// Session token for the managed media-routing deployment mode
    pub async fn issue_session_token(&self, coordinator_id: &str, roster: &[String]) -> Result<String> {
        let url = format!("{}/createToken", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(&TokenRequest {
                id: coordinator_id,
                student_list: roster,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(ProctorError::Backend(format!(
                "Token request failed with status {}: {}",
                status, error_text
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ProctorError::Backend(format!("Failed to parse token: {}", e)))?;

        tracing::info!(coordinator_id = %coordinator_id, "Issued session token");
        Ok(token.token)
    }
}
