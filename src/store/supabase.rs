//! Supabase REST API client using service_role key

use reqwest::Client;
use serde::{de::DeserializeOwned, Serialize};

/// Supabase client for server-side database operations
/// Uses service_role key which bypasses RLS - handle with care!
#[derive(Clone)]
pub struct SupabaseClient {
    client: Client,
    base_url: String,
    service_role_key: String,
}

impl SupabaseClient {
    pub fn new(base_url: &str, service_role_key: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            service_role_key: service_role_key.to_string(),
        }
    }

    /// Get the REST API URL for a table
    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("apikey", &self.service_role_key)
            .header("Authorization", format!("Bearer {}", self.service_role_key))
            .header("Content-Type", "application/json")
    }

    /// Authenticated GET with PostgREST filters as query pairs
    fn select(&self, table: &str, query: &[(&str, &str)]) -> reqwest::RequestBuilder {
        self.authed(self.client.get(self.rest_url(table)).query(query))
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, SupabaseError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(SupabaseError::Api {
            status: status.as_u16(),
            body,
        })
    }

    /// Make an authenticated GET request
    pub async fn get<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, &str)],
    ) -> Result<Vec<T>, SupabaseError> {
        let response = self
            .select(table, query)
            .send()
            .await
            .map_err(SupabaseError::Request)?;

        Self::check(response)
            .await?
            .json()
            .await
            .map_err(SupabaseError::Parse)
    }

    /// Make an authenticated GET request expecting a single row
    pub async fn get_one<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, &str)],
    ) -> Result<Option<T>, SupabaseError> {
        let response = self
            .select(table, query)
            .header("Accept", "application/vnd.pgrst.object+json")
            .send()
            .await
            .map_err(SupabaseError::Request)?;

        if response.status() == reqwest::StatusCode::NOT_ACCEPTABLE {
            // No rows found
            return Ok(None);
        }

        Self::check(response)
            .await?
            .json()
            .await
            .map(Some)
            .map_err(SupabaseError::Parse)
    }

    /// Insert a row without reading it back
    pub async fn insert<T: Serialize>(&self, table: &str, data: &T) -> Result<(), SupabaseError> {
        let response = self
            .authed(self.client.post(self.rest_url(table)))
            .header("Prefer", "return=minimal")
            .json(data)
            .send()
            .await
            .map_err(SupabaseError::Request)?;

        Self::check(response).await?;
        Ok(())
    }
}

/// Supabase errors
#[derive(Debug, thiserror::Error)]
pub enum SupabaseError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API error (status {status}): {body}")]
    Api { status: u16, body: String },

    #[error("Failed to parse response: {0}")]
    Parse(reqwest::Error),
}
