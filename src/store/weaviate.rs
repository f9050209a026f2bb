//! Weaviate-backed evidence store (REST v1 + GraphQL).
//!
//! Collections map to Weaviate classes (`research_ab12cd34` →
//! `ResearchAb12cd34` — class names must be UpperCamelCase). Object ids are
//! UUIDs derived from the evidence fingerprint, so duplicate-id inserts are
//! rejected by the server itself; duplicate content is checked with a
//! `content_hash` equality query before insert.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use sha2::{Digest, Sha256};

use crate::error::ResearchError;
use crate::evidence::{Evidence, EvidenceSource};

/// Single request ceiling for store operations.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct WeaviateStore {
    client: Client,
    base_url: String,
}

impl WeaviateStore {
    pub fn new(host: impl Into<String>, connect_timeout: Duration) -> Self {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(REQUEST_TIMEOUT)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: host.into().trim_end_matches('/').to_string(),
        }
    }

    /// `GET /v1/.well-known/ready`. Returns false on any failure.
    pub async fn health(&self) -> bool {
        self.client
            .get(format!("{}/v1/.well-known/ready", self.base_url))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    pub async fn ensure(&self, collection: &str) -> Result<(), ResearchError> {
        let class = class_name(collection);

        let existing = self
            .client
            .get(format!("{}/v1/schema/{class}", self.base_url))
            .send()
            .await
            .map_err(store_err)?;
        if existing.status().is_success() {
            return Ok(());
        }

        let definition = serde_json::json!({
            "class": class,
            "description": format!("Evidence collection {collection}"),
            "properties": [
                {"name": "evidence_id", "dataType": ["text"]},
                {"name": "excerpt", "dataType": ["text"]},
                {"name": "source_url", "dataType": ["text"]},
                {"name": "source_title", "dataType": ["text"]},
                {"name": "fetched_at", "dataType": ["text"]},
                {"name": "content_hash", "dataType": ["text"]},
                {"name": "produced_by", "dataType": ["text"]},
                {"name": "score", "dataType": ["number"]},
                {"name": "tags", "dataType": ["text[]"]},
                {"name": "cit_key", "dataType": ["text"]},
            ],
        });

        let resp = self
            .client
            .post(format!("{}/v1/schema", self.base_url))
            .json(&definition)
            .send()
            .await
            .map_err(store_err)?;

        // Lost creation race with a concurrent worker is fine — ensure is
        // idempotent by contract.
        if resp.status().is_success() || resp.status().as_u16() == 422 {
            Ok(())
        } else {
            Err(ResearchError::Store(format!(
                "schema creation failed: HTTP {}",
                resp.status()
            )))
        }
    }

    pub async fn insert(
        &self,
        collection: &str,
        evidence: &Evidence,
    ) -> Result<bool, ResearchError> {
        let class = class_name(collection);

        // Content dedupe first: same text under a different id.
        if let Some(hash) = &evidence.content_hash
            && self.content_hash_exists(&class, hash).await?
        {
            return Ok(false);
        }

        let object = serde_json::json!({
            "class": class,
            "id": uuid_for(&evidence.id),
            "properties": {
                "evidence_id": evidence.id,
                "excerpt": evidence.excerpt,
                "source_url": evidence.source.url,
                "source_title": evidence.source.title,
                "fetched_at": evidence.source.fetched_at.to_rfc3339(),
                "content_hash": evidence.content_hash.clone().unwrap_or_default(),
                "produced_by": evidence.produced_by,
                "score": evidence.score.unwrap_or(0.0),
                "tags": evidence.tags,
                "cit_key": evidence.cit_key.clone().unwrap_or_default(),
            },
        });

        let resp = self
            .client
            .post(format!("{}/v1/objects", self.base_url))
            .json(&object)
            .send()
            .await
            .map_err(store_err)?;

        let status = resp.status();
        if status.is_success() {
            return Ok(true);
        }
        // Duplicate object id — already stored.
        if status.as_u16() == 422 {
            return Ok(false);
        }
        Err(ResearchError::Store(format!(
            "object insert failed: HTTP {status}"
        )))
    }

    async fn content_hash_exists(
        &self,
        class: &str,
        hash: &str,
    ) -> Result<bool, ResearchError> {
        let query = format!(
            "{{ Get {{ {class}(limit: 1, where: {{path: [\"content_hash\"], \
             operator: Equal, valueText: \"{hash}\"}}) {{ evidence_id }} }} }}"
        );
        let objects = self.graphql(&query, class).await?;
        Ok(!objects.is_empty())
    }

    pub async fn similar(
        &self,
        collection: &str,
        text: &str,
        k: usize,
    ) -> Result<Vec<Evidence>, ResearchError> {
        let class = class_name(collection);
        let escaped = text.replace('\\', "\\\\").replace('"', "\\\"");
        let query = format!(
            "{{ Get {{ {class}(limit: {k}, nearText: {{concepts: [\"{escaped}\"]}}) {{ \
             evidence_id excerpt source_url source_title fetched_at content_hash \
             produced_by score tags cit_key _additional {{ certainty }} }} }} }}"
        );

        let objects = self.graphql(&query, &class).await?;
        Ok(objects.iter().filter_map(parse_object).collect())
    }

    pub async fn drop_collection(&self, collection: &str) -> Result<(), ResearchError> {
        let class = class_name(collection);
        let resp = self
            .client
            .delete(format!("{}/v1/schema/{class}", self.base_url))
            .send()
            .await
            .map_err(store_err)?;

        if resp.status().is_success() || resp.status().as_u16() == 404 {
            Ok(())
        } else {
            Err(ResearchError::Store(format!(
                "schema delete failed: HTTP {}",
                resp.status()
            )))
        }
    }

    /// POST a GraphQL query and return `data.Get.<class>` as an array.
    async fn graphql(
        &self,
        query: &str,
        class: &str,
    ) -> Result<Vec<serde_json::Value>, ResearchError> {
        let resp = self
            .client
            .post(format!("{}/v1/graphql", self.base_url))
            .json(&serde_json::json!({ "query": query }))
            .send()
            .await
            .map_err(store_err)?;

        if !resp.status().is_success() {
            return Err(ResearchError::Store(format!(
                "graphql query failed: HTTP {}",
                resp.status()
            )));
        }

        let body: serde_json::Value = resp.json().await.map_err(store_err)?;
        Ok(body["data"]["Get"][class]
            .as_array()
            .cloned()
            .unwrap_or_default())
    }
}

impl std::fmt::Debug for WeaviateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeaviateStore")
            .field("base_url", &self.base_url)
            .finish()
    }
}

fn store_err(e: reqwest::Error) -> ResearchError {
    ResearchError::Store(e.to_string())
}

/// Weaviate class names must be UpperCamelCase alphanumerics.
fn class_name(collection: &str) -> String {
    let mut out = String::with_capacity(collection.len());
    let mut upper_next = true;
    for c in collection.chars() {
        if c.is_ascii_alphanumeric() {
            if upper_next {
                out.push(c.to_ascii_uppercase());
                upper_next = false;
            } else {
                out.push(c);
            }
        } else {
            upper_next = true;
        }
    }
    if out.is_empty() {
        out.push_str("Default");
    }
    out
}

/// Derive a stable UUID from an evidence id (Weaviate object ids must be
/// UUID-shaped). Same evidence id, same UUID — server-side id dedupe.
fn uuid_for(evidence_id: &str) -> String {
    let digest = Sha256::digest(evidence_id.as_bytes());
    let h = hex::encode(digest);
    format!(
        "{}-{}-{}-{}-{}",
        &h[0..8],
        &h[8..12],
        &h[12..16],
        &h[16..20],
        &h[20..32]
    )
}

/// Convert one GraphQL result object back into evidence.
fn parse_object(obj: &serde_json::Value) -> Option<Evidence> {
    let id = obj["evidence_id"].as_str()?.to_string();
    let fetched_at = obj["fetched_at"]
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    let certainty = obj["_additional"]["certainty"].as_f64();
    let stored_score = obj["score"].as_f64();

    Some(Evidence {
        id,
        source: EvidenceSource {
            url: obj["source_url"].as_str().unwrap_or_default().to_string(),
            title: obj["source_title"].as_str().unwrap_or_default().to_string(),
            fetched_at,
        },
        excerpt: obj["excerpt"].as_str().unwrap_or_default().to_string(),
        content_hash: obj["content_hash"]
            .as_str()
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string()),
        score: certainty.or(stored_score),
        tags: obj["tags"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|t| t.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default(),
        cit_key: obj["cit_key"]
            .as_str()
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string()),
        produced_by: obj["produced_by"].as_str().unwrap_or_default().to_string(),
    })
}
