//! Backend REST API: trait seam, wire types and the reqwest client.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;

use fieldsync_common::{
    CounterSnapshot, Error, QueuedRecord, Reference, Result, TransactionType,
};

/// Answer to `GET /devices/fingerprint/{fp}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    #[serde(default)]
    pub authorized: bool,
    #[serde(default)]
    pub company_name: Option<String>,
    #[serde(default)]
    pub uniquedevcode: Option<String>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub last_trnid: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub last_milk_id: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub last_store_id: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub last_ai_id: Option<u64>,
}

impl DeviceStatus {
    /// Counters reported by the backend, keyed the way the device keeps them.
    pub fn counters(&self) -> CounterSnapshot {
        let mut snapshot = CounterSnapshot {
            last_trn_id: self.last_trnid,
            ..CounterSnapshot::default()
        };
        for (kind, value) in [
            (TransactionType::Collection, self.last_milk_id),
            (TransactionType::Sale, self.last_store_id),
            (TransactionType::Service, self.last_ai_id),
        ] {
            if let Some(value) = value {
                snapshot.type_counters.insert(kind, value);
            }
        }
        snapshot
    }
}

/// Body of `POST /transactions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub reference_no: String,
    pub upload_ref: Option<String>,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub payload: serde_json::Value,
    pub device_fingerprint: String,
}

impl From<&QueuedRecord> for Submission {
    fn from(record: &QueuedRecord) -> Self {
        Self {
            reference_no: record.reference.to_string(),
            upload_ref: record.upload_reference.as_ref().map(|r| r.to_string()),
            kind: record.kind,
            payload: record.payload.clone(),
            device_fingerprint: record.device_fingerprint.clone(),
        }
    }
}

/// Successful answer to `POST /transactions`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    /// Backend-side record id.
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: Option<String>,
    /// Canonical reference, when the backend reports one.
    #[serde(default)]
    pub reference_no: Option<String>,
    /// Backend's last-used global counter for this device.
    #[serde(default, deserialize_with = "lenient_u64")]
    pub last_trnid: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct NextReferenceResponse {
    reference_no: String,
}

#[derive(Debug, Deserialize)]
struct ConflictResponse {
    existing_reference: String,
}

/// Backend operations consumed by the sync subsystem.
///
/// Implementations map transport failures to `NetworkUnavailable`, `409`
/// answers to `BackendConflict` and schema mismatches to `BackendOutdated`.
#[async_trait]
pub trait BackendApi: Send + Sync {
    /// Ask the backend to mint a reference (online allocation path).
    async fn next_reference(&self, device_fingerprint: &str) -> Result<Reference>;

    /// Fetch authorization state and last-used counters for a device.
    async fn device_status(&self, device_fingerprint: &str) -> Result<DeviceStatus>;

    /// Deliver one captured record.
    async fn submit(&self, submission: &Submission) -> Result<SubmitReceipt>;
}

/// Whether a `500` body describes a schema the client cannot talk to.
pub fn looks_outdated(body: &str) -> bool {
    let lower = body.to_lowercase();
    [
        "schema",
        "outdated",
        "no such column",
        "unknown column",
        "does not exist",
        "migration",
    ]
    .iter()
    .any(|marker| lower.contains(marker))
}

/// Map a non-success HTTP answer to the error taxonomy.
pub fn classify_failure(status: StatusCode, body: &str) -> Error {
    match status {
        StatusCode::CONFLICT => match serde_json::from_str::<ConflictResponse>(body) {
            Ok(conflict) => Error::BackendConflict {
                existing_reference: conflict.existing_reference,
            },
            Err(_) => Error::Backend {
                status: status.as_u16(),
                message: truncate(body),
            },
        },
        StatusCode::INTERNAL_SERVER_ERROR if looks_outdated(body) => {
            Error::BackendOutdated(truncate(body))
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::Unauthorized(truncate(body)),
        _ => Error::Backend {
            status: status.as_u16(),
            message: truncate(body),
        },
    }
}

fn truncate(body: &str) -> String {
    const LIMIT: usize = 512;
    match body.char_indices().nth(LIMIT) {
        Some((cut, _)) => format!("{}...", &body[..cut]),
        None => body.to_string(),
    }
}

fn transport_error(context: &str, err: reqwest::Error) -> Error {
    if err.is_decode() {
        Error::Serialization(format!("{}: {}", context, err))
    } else {
        Error::NetworkUnavailable(format!("{}: {}", context, err))
    }
}

/// reqwest-based client for the backend REST API.
pub struct HttpBackend {
    http: Client,
    base_url: Url,
}

impl HttpBackend {
    /// Create a client for the API rooted at `base_url`.
    ///
    /// # Errors
    /// - `InvalidInput` if the URL does not parse or cannot carry paths
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| Error::InvalidInput(format!("invalid backend url {}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::InvalidInput(format!(
                "backend url cannot carry paths: {}",
                base_url
            )));
        }
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let http = Client::builder()
            .user_agent(concat!("fieldsync/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| Error::InvalidInput(format!("http client: {}", e)))?;

        Ok(Self { http, base_url })
    }

    /// Build an endpoint URL from path segments, percent-encoding each one.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| Error::InvalidInput("backend url cannot carry paths".to_string()))?;
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();

        if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| Error::Serialization(format!("Failed to parse response: {}", e)))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(classify_failure(status, &body))
        }
    }
}

#[async_trait]
impl BackendApi for HttpBackend {
    async fn next_reference(&self, device_fingerprint: &str) -> Result<Reference> {
        let url = self.endpoint(&["devices", "next-reference"])?;
        let response = self
            .http
            .post(url)
            .json(&serde_json::json!({ "device_fingerprint": device_fingerprint }))
            .send()
            .await
            .map_err(|e| transport_error("next reference", e))?;

        let body: NextReferenceResponse = self.handle_response(response).await?;
        Reference::from_backend(body.reference_no)
    }

    async fn device_status(&self, device_fingerprint: &str) -> Result<DeviceStatus> {
        let url = self.endpoint(&["devices", "fingerprint", device_fingerprint])?;
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| transport_error("device status", e))?;

        self.handle_response(response).await
    }

    async fn submit(&self, submission: &Submission) -> Result<SubmitReceipt> {
        let url = self.endpoint(&["transactions"])?;
        debug!("Submitting {} {}", submission.kind, submission.reference_no);
        let response = self
            .http
            .post(url)
            .json(submission)
            .send()
            .await
            .map_err(|e| transport_error("submit", e))?;

        self.handle_response(response).await
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(u64),
    Text(String),
}

/// Backend used when no URL is configured: every call reports the device
/// as offline, so captures queue locally until a backend is set up.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineBackend;

#[async_trait]
impl BackendApi for OfflineBackend {
    async fn next_reference(&self, _device_fingerprint: &str) -> Result<Reference> {
        Err(Error::NetworkUnavailable("no backend configured".to_string()))
    }

    async fn device_status(&self, _device_fingerprint: &str) -> Result<DeviceStatus> {
        Err(Error::NetworkUnavailable("no backend configured".to_string()))
    }

    async fn submit(&self, _submission: &Submission) -> Result<SubmitReceipt> {
        Err(Error::NetworkUnavailable("no backend configured".to_string()))
    }
}

fn lenient_u64<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<NumberOrString>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumberOrString::Number(n)) => Ok(Some(n)),
        Some(NumberOrString::Text(s)) if s.trim().is_empty() => Ok(None),
        Some(NumberOrString::Text(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

fn lenient_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(
        Option::<NumberOrString>::deserialize(deserializer)?.map(|value| match value {
            NumberOrString::Number(n) => n.to_string(),
            NumberOrString::Text(s) => s,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_status_counters() {
        let status: DeviceStatus = serde_json::from_str(
            r#"{
                "authorized": true,
                "company_name": "Green Valley Dairy",
                "uniquedevcode": "AG05",
                "last_trnid": "43",
                "last_milk_id": 12,
                "last_store_id": null
            }"#,
        )
        .unwrap();

        let counters = status.counters();
        assert_eq!(counters.last_trn_id, Some(43));
        assert_eq!(counters.type_counters.get(&TransactionType::Collection), Some(&12));
        assert!(!counters.type_counters.contains_key(&TransactionType::Sale));
        assert!(!counters.type_counters.contains_key(&TransactionType::Service));
    }

    #[test]
    fn test_receipt_accepts_numeric_id() {
        let receipt: SubmitReceipt = serde_json::from_str(r#"{"id": 981, "last_trnid": 50}"#).unwrap();
        assert_eq!(receipt.id.as_deref(), Some("981"));
        assert_eq!(receipt.last_trnid, Some(50));
        assert!(receipt.reference_no.is_none());
    }

    #[test]
    fn test_classify_conflict() {
        let err = classify_failure(
            StatusCode::CONFLICT,
            r#"{"existing_reference":"AG0500000099"}"#,
        );
        match err {
            Error::BackendConflict { existing_reference } => {
                assert_eq!(existing_reference, "AG0500000099")
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_classify_conflict_without_body_is_transient() {
        let err = classify_failure(StatusCode::CONFLICT, "duplicate");
        assert!(err.is_transient());
    }

    #[test]
    fn test_classify_outdated_schema() {
        let err = classify_failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            "SQLSTATE[42S22]: Unknown column 'upload_ref' in 'field list'",
        );
        assert!(matches!(err, Error::BackendOutdated(_)));

        let err = classify_failure(StatusCode::INTERNAL_SERVER_ERROR, "worker crashed");
        assert!(matches!(err, Error::Backend { status: 500, .. }));
    }

    #[test]
    fn test_classify_unauthorized() {
        assert!(matches!(
            classify_failure(StatusCode::FORBIDDEN, "terminal not authorized"),
            Error::Unauthorized(_)
        ));
    }

    #[test]
    fn test_truncate_long_bodies() {
        let body = "x".repeat(2_000);
        assert!(truncate(&body).len() < 600);
    }

    #[test]
    fn test_endpoint_encoding() {
        let backend = HttpBackend::new("https://api.example.com/v1", Duration::from_secs(5)).unwrap();
        let url = backend
            .endpoint(&["devices", "fingerprint", "ab/cd ef"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.example.com/v1/devices/fingerprint/ab%2Fcd%20ef"
        );
    }

    #[test]
    fn test_rejects_bad_base_url() {
        assert!(HttpBackend::new("not a url", Duration::from_secs(5)).is_err());
        assert!(HttpBackend::new("mailto:ops@example.com", Duration::from_secs(5)).is_err());
    }

    #[test]
    fn test_submission_wire_shape() {
        let submission = Submission {
            reference_no: "AG0500000042".to_string(),
            upload_ref: Some("AG0500000003".to_string()),
            kind: TransactionType::Sale,
            payload: serde_json::json!({"amount": 10}),
            device_fingerprint: "fp".to_string(),
        };
        let json = serde_json::to_value(&submission).unwrap();
        assert_eq!(json["type"], "sale");
        assert_eq!(json["upload_ref"], "AG0500000003");
    }

    #[tokio::test]
    async fn test_offline_backend_reports_no_network() {
        let backend = OfflineBackend;
        assert!(matches!(
            backend.device_status("fp").await,
            Err(Error::NetworkUnavailable(_))
        ));
        assert!(matches!(
            backend.next_reference("fp").await,
            Err(Error::NetworkUnavailable(_))
        ));
    }
}
