//! Output formatting for CLI commands.

use colored::Colorize;
use serde::Serialize;
use tabled::{Table, Tabled};

/// Output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable table format.
    #[default]
    Table,
    /// JSON format.
    Json,
}

impl OutputFormat {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "json" => Self::Json,
            _ => Self::Table,
        }
    }
}

/// Print rows as a table, or the raw value as JSON.
pub fn print_output<T: Tabled, V: Serialize>(rows: &[T], raw: &V, format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if rows.is_empty() {
                println!("{}", "No items found.".dimmed());
            } else {
                println!("{}", Table::new(rows));
            }
        }
        OutputFormat::Json => print_json(raw),
    }
}

/// Print a value as pretty JSON.
pub fn print_json<T: Serialize + ?Sized>(data: &T) {
    let json = serde_json::to_string_pretty(data).unwrap_or_else(|_| "{}".to_string());
    println!("{}", json);
}

/// Print a success message, or the raw value as JSON.
pub fn print_success<V: Serialize>(message: &str, raw: &V, format: OutputFormat) {
    match format {
        OutputFormat::Table => println!("{} {}", "Success:".green().bold(), message),
        OutputFormat::Json => print_json(raw),
    }
}
