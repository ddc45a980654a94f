//! Thin wrapper over the `aws` command line program, used by the SQS and EC2 backends.
use anyhow::Context;
use bstr::ByteSlice;
use serde::de::DeserializeOwned;

use crate::common::command::{CommandError, check_command_output, create_command};
use crate::controller::FleetResult;
use crate::controller::config::AwsConfig;

/// Error code returned by EC2 when a `--dry-run` request would have succeeded.
pub const DRY_RUN_SUCCESS_CODE: &str = "DryRunOperation";

#[derive(Debug, Clone)]
pub struct AwsCli {
    program: String,
    region: Option<String>,
    profile: Option<String>,
}

impl AwsCli {
    pub fn new(config: &AwsConfig) -> Self {
        Self {
            program: config.program.clone(),
            region: config.region.clone(),
            profile: config.profile.clone(),
        }
    }

    /// Builds the full argument list of an `aws <service> <operation>` invocation.
    pub fn arguments(&self, service: &str, operation: &str, args: Vec<String>) -> Vec<String> {
        let mut arguments = vec![
            self.program.clone(),
            service.to_string(),
            operation.to_string(),
        ];
        arguments.extend(args);
        if let Some(region) = &self.region {
            arguments.extend(["--region".to_string(), region.clone()]);
        }
        if let Some(profile) = &self.profile {
            arguments.extend(["--profile".to_string(), profile.clone()]);
        }
        arguments.extend(["--output".to_string(), "json".to_string()]);
        arguments
    }

    /// Runs the given operation and returns its (trimmed) standard output.
    ///
    /// A non-zero exit code is returned as a [`CommandError`] that can be downcast from the
    /// returned error.
    pub async fn run(
        &self,
        service: &str,
        operation: &str,
        args: Vec<String>,
    ) -> FleetResult<String> {
        let arguments = self.arguments(service, operation, args);
        log::debug!("Running AWS command `{}`", arguments.join(" "));

        let output = create_command(&arguments)
            .output()
            .await
            .with_context(|| format!("{} start failed", self.program))?;
        let output = check_command_output(&self.program, output)?;

        log::trace!(
            "AWS {service} {operation} output\nStdout\n{}Stderr\n{}",
            output.stdout.to_str_lossy(),
            output.stderr.to_str_lossy()
        );

        let stdout = output
            .stdout
            .to_str()
            .map_err(|e| anyhow::anyhow!("Invalid UTF-8 {} output: {:?}", self.program, e))?;
        Ok(stdout.trim().to_string())
    }

    /// Runs the given operation and parses its JSON output.
    pub async fn run_json<T: DeserializeOwned>(
        &self,
        service: &str,
        operation: &str,
        args: Vec<String>,
    ) -> FleetResult<T> {
        let output = self.run(service, operation, args).await?;
        parse_json_output(&output)
            .with_context(|| format!("Cannot parse {service} {operation} output"))
    }
}

/// Parses JSON output of the CLI. Operations without a result print nothing, which is parsed
/// as an empty JSON object.
pub fn parse_json_output<T: DeserializeOwned>(output: &str) -> FleetResult<T> {
    let output = if output.is_empty() { "{}" } else { output };
    Ok(serde_json::from_str(output)?)
}

/// Checks if the error was produced by the CLI and mentions the given provider error code.
pub fn is_provider_error(error: &anyhow::Error, error_code: &str) -> bool {
    error
        .downcast_ref::<CommandError>()
        .is_some_and(|e| e.mentions(error_code))
}

#[cfg(test)]
mod tests {
    use super::{AwsCli, is_provider_error, parse_json_output};
    use crate::common::command::CommandError;
    use crate::controller::config::AwsConfig;

    const DELETE_ERROR: &str = "An error occurred (ReceiptHandleIsInvalid) when calling the \
                                DeleteMessage operation";

    #[test]
    fn arguments_with_region_and_profile() {
        let cli = AwsCli::new(&AwsConfig {
            program: "aws".to_string(),
            region: Some("us-east-1".to_string()),
            profile: Some("ops".to_string()),
        });
        let args = cli.arguments(
            "sqs",
            "delete-message",
            vec!["--receipt-handle".to_string(), "r".to_string()],
        );
        assert_eq!(
            args,
            vec![
                "aws",
                "sqs",
                "delete-message",
                "--receipt-handle",
                "r",
                "--region",
                "us-east-1",
                "--profile",
                "ops",
                "--output",
                "json"
            ]
        );
    }

    #[test]
    fn empty_output_is_empty_object() {
        let value: serde_json::Value = parse_json_output("").unwrap();
        assert_eq!(value, serde_json::json!({}));
    }

    #[test]
    fn detect_provider_error() {
        let error: anyhow::Error = CommandError {
            program: "aws".to_string(),
            code: 254,
            stderr: DELETE_ERROR.to_string(),
            stdout: String::new(),
        }
        .into();
        assert!(is_provider_error(&error, "ReceiptHandleIsInvalid"));
        assert!(!is_provider_error(&error, "DryRunOperation"));
        assert!(!is_provider_error(
            &anyhow::anyhow!("ReceiptHandleIsInvalid"),
            "ReceiptHandleIsInvalid"
        ));
    }

    #[tokio::test]
    async fn run_program_with_json_output() {
        let cli = AwsCli::new(&AwsConfig {
            program: "echo".to_string(),
            region: None,
            profile: None,
        });
        // `echo` prints its arguments, which is not JSON
        assert!(
            cli.run_json::<serde_json::Value>("sqs", "list-queues", vec![])
                .await
                .is_err()
        );
        let output = cli.run("sqs", "list-queues", vec![]).await.unwrap();
        assert_eq!(output, "sqs list-queues --output json");
    }
}
