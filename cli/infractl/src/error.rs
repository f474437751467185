//! Error handling and display for the CLI.

use colored::Colorize;
use thiserror::Error;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("API error ({status}): {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl CliError {
    /// Create an API error from response details.
    pub fn api(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {}", "Error:".red().bold(), err);

    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        match cli_err {
            CliError::Api { code, .. } if code == "still_managed" => {
                eprintln!(
                    "\n{}",
                    "Hint: Run `infractl detach <ID>` first, or use `infractl delete`.".yellow()
                );
            }
            CliError::Api { code, .. } if code == "already_managed" => {
                eprintln!(
                    "\n{}",
                    "Hint: The infrastructure is already being maintained.".yellow()
                );
            }
            CliError::Network(_) => {
                eprintln!(
                    "\n{}",
                    "Hint: Check that infra-manager is running and --url is correct.".yellow()
                );
            }
            _ => {}
        }
    }
}
