//! `fastfetch fetch`: run one slot against a live ad server.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Args;
use fastfetch_core::config::{EngineConfig, SlotConfig};
use fastfetch_core::head::AllowlistHeadSanitizer;
use fastfetch_core::render::{EmbedInstaller, EmbedSpec, RenderOutcome, SlotHost};
use fastfetch_core::signature::SignatureVerifier;
use fastfetch_core::state::SlotSnapshot;
use fastfetch_core::{AdSlot, DefaultNetworkAdapter, SlotServices};
use serde::Serialize;
use tracing::{info, warn};
use url::Url;

use super::{FORMATS, print_json};
use crate::headless::{HeadlessDocument, HeadlessHost, HeadlessInstaller, HostRecord};
use crate::http_client::{HttpKeysetFetcher, ReqwestTransport};

/// Arguments for `fastfetch fetch`.
#[derive(Args, Debug)]
pub struct FetchArgs {
    /// Ad request URL; defaults to `ad_url` from the slot configuration
    #[arg(long)]
    pub url: Option<String>,

    /// Slot configuration file; overrides --network, --width and --height
    #[arg(long)]
    pub slot: Option<PathBuf>,

    /// Ad network type
    #[arg(long, default_value = "custom")]
    pub network: String,

    /// Slot width in pixels
    #[arg(long, default_value_t = 300)]
    pub width: u32,

    /// Slot height in pixels
    #[arg(long, default_value_t = 250)]
    pub height: u32,

    /// URL of the page hosting the slot
    #[arg(long, default_value = "https://localhost/")]
    pub page_url: String,

    /// Request timeout in milliseconds
    #[arg(long, default_value_t = 10_000)]
    pub timeout_ms: u64,

    /// Output format (`text` or `json`)
    #[arg(long, default_value = "text", value_parser = FORMATS)]
    pub format: String,
}

/// Everything one run produced.
#[derive(Debug, Serialize)]
pub struct FetchReport {
    pub network_type: String,
    pub generation: u64,
    pub outcome: RenderOutcome,
    pub state: SlotSnapshot,
    pub host: HostRecord,
    pub embeds: Vec<EmbedSpec>,
}

fn load_engine(path: &Path) -> Result<EngineConfig> {
    if path.exists() {
        EngineConfig::from_file(path)
            .with_context(|| format!("failed to load engine config {}", path.display()))
    } else {
        info!(path = %path.display(), "no engine config, using defaults");
        Ok(EngineConfig::default())
    }
}

fn load_slot(args: &FetchArgs) -> Result<SlotConfig> {
    match &args.slot {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read slot config {}", path.display()))?;
            SlotConfig::from_toml(&content)
                .with_context(|| format!("failed to parse slot config {}", path.display()))
        },
        None => Ok(SlotConfig::new(&args.network, args.width, args.height)),
    }
}

/// Picks `--url` over the slot's configured `ad_url`.
fn resolve_ad_url(args: &FetchArgs, slot: &SlotConfig) -> Result<String> {
    let url = args
        .url
        .clone()
        .or_else(|| slot.ad_url.clone())
        .ok_or_else(|| anyhow!("no ad URL: pass --url or set ad_url in the slot config"))?;
    Url::parse(&url).with_context(|| format!("invalid ad URL {url}"))?;
    Ok(url)
}

/// Runs the command.
pub async fn run(config_path: &Path, args: &FetchArgs) -> Result<()> {
    let engine = load_engine(config_path)?;
    let slot_config = load_slot(args)?;
    let page_url = Url::parse(&args.page_url).context("invalid --page-url")?;
    let ad_url = resolve_ad_url(args, &slot_config)?;
    let timeout = Duration::from_millis(args.timeout_ms);

    let host = Arc::new(HeadlessHost::default());
    let installer = Arc::new(HeadlessInstaller::default());
    let document = Arc::new(HeadlessDocument::new(&page_url, slot_config.size()));
    let adapter = Arc::new(DefaultNetworkAdapter::new(
        slot_config.network_type.clone(),
        Some(ad_url),
    ));
    let mut services = SlotServices::new(
        adapter,
        Arc::new(ReqwestTransport::new(timeout)?),
        Arc::clone(&host) as Arc<dyn SlotHost>,
        document,
        Arc::clone(&installer) as Arc<dyn EmbedInstaller>,
    )
    .with_sanitizer(Arc::new(AllowlistHeadSanitizer));
    if engine.verifier.signing_services.is_empty() {
        warn!("no signing services configured, signed creatives cannot verify");
    } else {
        let fetcher = Arc::new(HttpKeysetFetcher::new(timeout)?);
        services = services.with_verifier(Arc::new(SignatureVerifier::new(
            engine.verifier.clone(),
            fetcher,
        )));
    }

    let network_type = slot_config.network_type.clone();
    let slot = AdSlot::new(engine, slot_config, services);
    let outcome = slot.layout().await;

    let report = FetchReport {
        network_type,
        generation: slot.generation(),
        outcome,
        state: slot.snapshot(),
        host: host.record(),
        embeds: installer.installed(),
    };
    if args.format == "json" {
        print_json(&report)
    } else {
        print_text(&report);
        Ok(())
    }
}

fn print_text(report: &FetchReport) {
    println!("network:    {}", report.network_type);
    println!("generation: {}", report.generation);
    println!("outcome:    {:?}", report.outcome);
    if let Some(size) = report.state.creative_size {
        println!("size:       {size}");
    }
    if let Some(mode) = report.state.render_mode {
        println!("mode:       {mode}");
    }
    if report.host.collapsed {
        println!("slot collapsed");
    }
    for frame in &report.host.frames {
        println!(
            "frame {}: {:?} {}x{}{}",
            frame.id,
            frame.kind,
            frame.width.as_deref().unwrap_or("?"),
            frame.height.as_deref().unwrap_or("?"),
            frame
                .src
                .as_deref()
                .map(|src| format!(" src={src}"))
                .unwrap_or_default(),
        );
    }
    for embed in &report.embeds {
        println!(
            "embed: {} bytes, extensions {:?}",
            embed.html.len(),
            embed.extensions
        );
    }
}
