use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::controller::FleetResult;
use crate::controller::aws::{AwsCli, is_provider_error};
use crate::controller::job::{Job, ReceiptToken};
use crate::controller::queue::{AckOutcome, JobQueue};

/// Error codes of SQS signalling that a receipt handle cannot be used anymore.
const EXPIRED_RECEIPT_CODES: [&str; 2] = ["ReceiptHandleIsInvalid", "InvalidParameterValue"];

/// Request queue backed by Amazon SQS, accessed through the `aws` CLI.
#[derive(Clone)]
pub struct SqsQueue {
    cli: AwsCli,
    url: String,
    visibility_timeout: Option<Duration>,
}

impl SqsQueue {
    pub fn new(cli: AwsCli, url: String, visibility_timeout: Option<Duration>) -> Self {
        Self {
            cli,
            url,
            visibility_timeout,
        }
    }

    /// Checks that the queue exists and that its attributes can be read.
    pub async fn check_access(&self) -> FleetResult<u64> {
        self.approximate_depth()
            .await
            .with_context(|| format!("Cannot access queue {}", self.url))
    }
}

impl JobQueue for SqsQueue {
    fn receive(
        &self,
        wait: Duration,
        max_messages: u32,
    ) -> Pin<Box<dyn Future<Output = FleetResult<Vec<Job>>>>> {
        let queue = self.clone();

        Box::pin(async move {
            let mut args = vec![
                "--queue-url".to_string(),
                queue.url.clone(),
                "--max-number-of-messages".to_string(),
                max_messages.to_string(),
                "--wait-time-seconds".to_string(),
                wait.as_secs().to_string(),
            ];
            if let Some(timeout) = queue.visibility_timeout {
                args.extend([
                    "--visibility-timeout".to_string(),
                    timeout.as_secs().to_string(),
                ]);
            }
            let output: ReceiveOutput = queue.cli.run_json("sqs", "receive-message", args).await?;

            let mut jobs = Vec::with_capacity(output.messages.len());
            for message in output.messages {
                match Job::from_message_body(&message.body, message.receipt_handle.clone()) {
                    Ok(job) => jobs.push(job),
                    Err(error) => {
                        // It can never be dispatched and would only block its message group
                        log::error!(
                            "Dropping malformed message {}: {error:?}",
                            message.message_id
                        );
                        if let Err(error) = queue.acknowledge(&message.receipt_handle).await {
                            log::error!(
                                "Cannot delete malformed message {}: {error:?}",
                                message.message_id
                            );
                        }
                    }
                }
            }
            Ok(jobs)
        })
    }

    fn acknowledge(
        &self,
        receipt: &ReceiptToken,
    ) -> Pin<Box<dyn Future<Output = FleetResult<AckOutcome>>>> {
        let cli = self.cli.clone();
        let args = vec![
            "--queue-url".to_string(),
            self.url.clone(),
            "--receipt-handle".to_string(),
            receipt.clone(),
        ];

        Box::pin(async move {
            match cli.run("sqs", "delete-message", args).await {
                Ok(_) => Ok(AckOutcome::Deleted),
                Err(error)
                    if EXPIRED_RECEIPT_CODES
                        .iter()
                        .any(|code| is_provider_error(&error, code)) =>
                {
                    log::debug!("Receipt handle was rejected by SQS: {error:?}");
                    Ok(AckOutcome::Expired)
                }
                Err(error) => Err(error.context("Cannot delete message")),
            }
        })
    }

    fn approximate_depth(&self) -> Pin<Box<dyn Future<Output = FleetResult<u64>>>> {
        let cli = self.cli.clone();
        let args = vec![
            "--queue-url".to_string(),
            self.url.clone(),
            "--attribute-names".to_string(),
            "ApproximateNumberOfMessages".to_string(),
        ];

        Box::pin(async move {
            let output: AttributesOutput = cli.run_json("sqs", "get-queue-attributes", args).await?;
            parse_queue_depth(&output)
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ReceiveOutput {
    #[serde(default)]
    messages: Vec<SqsMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SqsMessage {
    message_id: String,
    receipt_handle: String,
    body: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AttributesOutput {
    #[serde(default)]
    attributes: crate::Map<String, String>,
}

fn parse_queue_depth(output: &AttributesOutput) -> FleetResult<u64> {
    let value = output
        .attributes
        .get("ApproximateNumberOfMessages")
        .ok_or_else(|| anyhow::anyhow!("Queue attribute ApproximateNumberOfMessages not found"))?;
    value
        .parse::<u64>()
        .with_context(|| format!("Invalid queue depth `{value}`"))
}

#[cfg(test)]
mod tests {
    use super::{AttributesOutput, ReceiveOutput, parse_queue_depth};
    use crate::controller::aws::parse_json_output;
    use crate::controller::job::Job;

    #[test]
    fn parse_receive_output() {
        let output: ReceiveOutput = parse_json_output(
            r#"{
    "Messages": [
        {
            "MessageId": "5fea7756-0ea4-451a-a703-a558b933e274",
            "ReceiptHandle": "AQEBzWwaftRI0KuVm4tP+/7q1rGgNqicHq",
            "MD5OfBody": "fafb00f5732ab283681e124bf8747ed1",
            "Body": "{\"s3Url\":\"https://in-bucket.s3.amazonaws.com/17_test_00.jpg\"}"
        }
    ]
}"#,
        )
        .unwrap();
        assert_eq!(output.messages.len(), 1);
        let message = &output.messages[0];
        let receipt = message.receipt_handle.clone();
        let job = Job::from_message_body(&message.body, receipt).unwrap();
        assert_eq!(job.id, "17_test_00.jpg");
        assert_eq!(job.receipt, "AQEBzWwaftRI0KuVm4tP+/7q1rGgNqicHq");
    }

    #[test]
    fn parse_empty_receive_output() {
        let output: ReceiveOutput = parse_json_output("").unwrap();
        assert!(output.messages.is_empty());
    }

    #[test]
    fn parse_depth() {
        let output: AttributesOutput = parse_json_output(
            r#"{"Attributes": {"ApproximateNumberOfMessages": "12"}}"#,
        )
        .unwrap();
        assert_eq!(parse_queue_depth(&output).unwrap(), 12);
    }

    #[test]
    fn parse_missing_depth() {
        let output: AttributesOutput = parse_json_output("{}").unwrap();
        assert!(parse_queue_depth(&output).is_err());

        let output: AttributesOutput = parse_json_output(
            r#"{"Attributes": {"ApproximateNumberOfMessages": "many"}}"#,
        )
        .unwrap();
        assert!(parse_queue_depth(&output).is_err());
    }
}
