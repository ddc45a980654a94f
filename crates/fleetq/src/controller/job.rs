use serde::{Deserialize, Serialize};

use crate::controller::FleetResult;

pub type JobId = String;
pub type ReceiptToken = String;

/// Single unit of work received from the request queue.
///
/// The job only references its input artifact, the artifact itself is downloaded by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: JobId,
    /// URL (or key) of the input artifact.
    pub payload_ref: String,
    /// Handle required to acknowledge the message.
    pub receipt: ReceiptToken,
}

impl Job {
    pub fn new(payload_ref: String, receipt: ReceiptToken) -> Self {
        Self {
            id: job_id_from_url(&payload_ref),
            payload_ref,
            receipt,
        }
    }

    /// Creates a job out of the body of a queue message.
    pub fn from_message_body(body: &str, receipt: ReceiptToken) -> FleetResult<Self> {
        let message: JobMessage = serde_json::from_str(body)
            .map_err(|e| anyhow::anyhow!("Invalid job message `{body}`: {e}"))?;
        if message.s3_url.trim().is_empty() {
            anyhow::bail!("Job message `{body}` has an empty artifact URL");
        }
        Ok(Self::new(message.s3_url, receipt))
    }
}

/// Uses the object key (last path segment) of the artifact URL as the job id.
fn job_id_from_url(url: &str) -> JobId {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|key| !key.is_empty())
        .unwrap_or(path)
        .to_string()
}

/// Body of a message in the request queue, also sent to the job intake endpoint of workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    #[serde(rename = "s3Url")]
    pub s3_url: String,
}

/// Successful response of the job intake endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntakeResponse {
    pub message: String,
    pub result: String,
}

/// Error response of the job intake endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeError {
    pub error: String,
}

/// Message published by workers into the response queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultMessage {
    #[serde(rename = "outputKey")]
    pub output_key: String,
    pub prediction: String,
}

#[cfg(test)]
mod tests {
    use super::{Job, ResultMessage};

    #[test]
    fn job_id_is_object_key() {
        let job = Job::new(
            "https://in-bucket.s3.amazonaws.com/1700000000_test_00.jpg".to_string(),
            "r1".to_string(),
        );
        assert_eq!(job.id, "1700000000_test_00.jpg");
    }

    #[test]
    fn job_id_ignores_query() {
        let job = Job::new(
            "https://bucket.s3.amazonaws.com/dir/img.png?versionId=3".to_string(),
            "r1".to_string(),
        );
        assert_eq!(job.id, "img.png");
    }

    #[test]
    fn job_id_of_plain_key() {
        let job = Job::new("img.png".to_string(), "r1".to_string());
        assert_eq!(job.id, "img.png");
    }

    #[test]
    fn parse_message_body() {
        let job = Job::from_message_body(
            r#"{"s3Url": "https://bucket.s3.amazonaws.com/a.jpg"}"#,
            "receipt".to_string(),
        )
        .unwrap();
        assert_eq!(job.payload_ref, "https://bucket.s3.amazonaws.com/a.jpg");
        assert_eq!(job.id, "a.jpg");
        assert_eq!(job.receipt, "receipt");
    }

    #[test]
    fn reject_invalid_body() {
        for body in ["not json", r#"{"url": "x"}"#, r#"{"s3Url": " "}"#] {
            assert!(Job::from_message_body(body, "r".to_string()).is_err());
        }
    }

    #[test]
    fn result_message_wire_format() {
        let body = r#"{"outputKey": "a.jpg", "prediction": "Paul"}"#;
        let message: ResultMessage = serde_json::from_str(body).unwrap();
        assert_eq!(message.output_key, "a.jpg");
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            serde_json::json!({"outputKey": "a.jpg", "prediction": "Paul"})
        );
    }
}
