//! Output formatting utilities

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Print a table from a list of items
pub fn print_table<T: Tabled + Serialize>(items: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if items.is_empty() {
                println!("{}", "No items found".yellow());
                return;
            }
            let table = Table::new(items).with(Style::rounded()).to_string();
            println!("{}", table);
        }
        OutputFormat::Json => {
            if let Ok(json) = serde_json::to_string_pretty(&items) {
                println!("{}", json);
            }
        }
    }
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Coarse stage progress on stderr; `total == 0` marks an
/// indeterminate-length stage.
pub fn report_progress(stage: &str, completed: usize, total: usize) {
    if total == 0 {
        eprintln!("{} {}...", "→".blue(), stage);
    } else if completed == 0 {
        eprintln!("{} {} ({} items)", "→".blue(), stage, total);
    } else if completed == total {
        eprintln!("{} {} done", "→".blue(), stage);
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2}Ti", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2}Gi", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2}Mi", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2}Ki", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

/// Parse a byte quantity with an optional K/M/G/T suffix
pub fn parse_bytes(value: &str) -> anyhow::Result<u64> {
    const KB: f64 = 1024.0;
    let value = value.trim();
    if value.is_empty() {
        anyhow::bail!("empty size");
    }
    let (number, multiplier) = match value.chars().last().unwrap() {
        'K' | 'k' => (&value[..value.len() - 1], KB),
        'M' | 'm' => (&value[..value.len() - 1], KB * KB),
        'G' | 'g' => (&value[..value.len() - 1], KB * KB * KB),
        'T' | 't' => (&value[..value.len() - 1], KB * KB * KB * KB),
        _ => (value, 1.0),
    };
    let number: f64 = number
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid size: {value}"))?;
    if number < 0.0 {
        anyhow::bail!("size must not be negative: {value}");
    }
    Ok((number * multiplier) as u64)
}

/// Format a percentage with one decimal
pub fn format_percent(value: f64) -> String {
    format!("{:.1}%", value)
}

/// Color a node/VM state by value
pub fn color_state(state: &str) -> String {
    match state.to_lowercase().as_str() {
        "online" | "running" => state.green().to_string(),
        "offline" | "stopped" => state.red().to_string(),
        _ => state.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_formatting() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(2048), "2.00Ki");
        assert_eq!(format_bytes(32 << 30), "32.00Gi");
    }

    #[test]
    fn bytes_parsing() {
        assert_eq!(parse_bytes("1024").unwrap(), 1024);
        assert_eq!(parse_bytes("16G").unwrap(), 16 << 30);
        assert_eq!(parse_bytes("1.5g").unwrap(), 3 << 29);
        assert_eq!(parse_bytes("2T").unwrap(), 2 << 40);
        assert!(parse_bytes("").is_err());
        assert!(parse_bytes("abc").is_err());
    }

    #[test]
    fn percent_formatting() {
        assert_eq!(format_percent(42.345), "42.3%");
    }
}
