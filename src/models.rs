//! Payloads returned by the hackathon backend.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A hackathon document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hackathon {
    #[serde(alias = "$id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tagline: Option<String>,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub organizer_id: Option<String>,
    #[serde(default)]
    pub prize_pool: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub min_team_size: Option<u32>,
    #[serde(default)]
    pub max_team_size: Option<u32>,
}

/// A team document. `members` holds user ids, the leader included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Team {
    #[serde(alias = "$id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub hackathon_id: Option<String>,
    #[serde(default)]
    pub leader_id: Option<String>,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default)]
    pub looking_for: Vec<String>,
    #[serde(default)]
    pub tech_stack: Vec<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub project_repo: Option<String>,
}

impl Team {
    pub fn has_member(&self, user_id: &str) -> bool {
        self.members.iter().any(|m| m == user_id)
    }
}

/// `{ "documents": [...] }`, as returned by `GET /hackathons` and `GET /teams`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentList<T> {
    #[serde(default = "Vec::new")]
    pub documents: Vec<T>,
}

/// `{ "hackathons": [...] }`, as returned by `GET /users/{id}/hackathons`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserHackathons {
    #[serde(default)]
    pub hackathons: Vec<Hackathon>,
}

/// Decode a response body, reporting shape mismatches as `DecodeError`.
pub fn decode<T: DeserializeOwned>(path: &str, body: Value) -> Result<T> {
    serde_json::from_value(body)
        .map_err(|e| Error::DecodeError(format!("Unexpected body from {}: {}", path, e)))
}
