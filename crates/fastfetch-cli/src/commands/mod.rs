//! CLI command implementations.

pub mod fetch;
pub mod metadata;
pub mod verify;

use serde::Serialize;

/// Output format shared by every command.
pub const FORMATS: [&str; 2] = ["text", "json"];

/// Prints `value` as pretty JSON.
pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
