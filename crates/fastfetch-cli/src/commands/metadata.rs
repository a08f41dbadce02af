//! `fastfetch metadata`: inspect a signed creative offline.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use fastfetch_core::metadata::extract_metadata_from_bytes;

use super::{FORMATS, print_json};

/// Arguments for `fastfetch metadata`.
#[derive(Args, Debug)]
pub struct MetadataArgs {
    /// Creative file
    pub creative: PathBuf,

    /// Apply the single-page story ad rules
    #[arg(long)]
    pub spsa: bool,

    /// Output format (`text` or `json`)
    #[arg(long, default_value = "json", value_parser = FORMATS)]
    pub format: String,
}

/// Runs the command.
pub fn run(args: &MetadataArgs) -> Result<()> {
    let bytes = std::fs::read(&args.creative)
        .with_context(|| format!("failed to read {}", args.creative.display()))?;
    let metadata = extract_metadata_from_bytes(&bytes, args.spsa)
        .with_context(|| format!("invalid creative {}", args.creative.display()))?;

    if args.format == "json" {
        return print_json(&metadata);
    }
    println!("minified creative: {} bytes", metadata.minified_creative.len());
    println!("extensions:        {}", metadata.extension_ids().join(", "));
    println!("stylesheets:       {}", metadata.font_urls().join(", "));
    if let Some(images) = &metadata.images {
        println!("images:            {}", images.join(", "));
    }
    if let Some(cta_type) = &metadata.cta_type {
        println!("cta type:          {cta_type}");
    }
    Ok(())
}
