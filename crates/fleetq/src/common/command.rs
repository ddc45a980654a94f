use bstr::ByteSlice;
use std::process::Output;
use thiserror::Error;
use tokio::process::Command;

/// An external program has exited with a non-zero exit code.
#[derive(Debug, Error)]
#[error("`{program}` failed with exit code {code}\nStderr: {stderr}\nStdout: {stdout}")]
pub struct CommandError {
    pub program: String,
    pub code: i32,
    pub stderr: String,
    pub stdout: String,
}

impl CommandError {
    /// Checks if the error output of the program mentions the given (provider) error code.
    pub fn mentions(&self, error_code: &str) -> bool {
        self.stderr.contains(error_code)
    }
}

pub fn create_command<S: AsRef<str>>(arguments: &[S]) -> Command {
    let mut command = Command::new(arguments[0].as_ref());
    command.args(arguments[1..].iter().map(|arg| arg.as_ref()));
    command.kill_on_drop(true);
    command
}

pub fn check_command_output(program: &str, output: Output) -> Result<Output, CommandError> {
    let status = output.status;
    if !status.success() {
        return Err(CommandError {
            program: program.to_string(),
            code: status.code().unwrap_or(-1),
            stderr: output.stderr.to_str_lossy().trim().to_string(),
            stdout: output.stdout.to_str_lossy().trim().to_string(),
        });
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::{check_command_output, create_command};

    #[tokio::test]
    async fn successful_command() {
        let output = create_command(&["sh", "-c", "echo hello"])
            .output()
            .await
            .unwrap();
        let output = check_command_output("sh", output).unwrap();
        assert_eq!(output.stdout, b"hello\n");
    }

    #[tokio::test]
    async fn failed_command_keeps_stderr() {
        let output = create_command(&["sh", "-c", "echo 'InvalidParameter: bad' >&2; exit 3"])
            .output()
            .await
            .unwrap();
        let error = check_command_output("sh", output).unwrap_err();
        assert_eq!(error.code, 3);
        assert!(error.mentions("InvalidParameter"));
        assert!(!error.mentions("DryRunOperation"));
    }
}
