//! event_gif - render a finished event's boxes as an annotated looping GIF
//!
//! Input is a JSON array of boxes in canvas coordinates, ordered by start:
//! `[{"start_ms":0,"x":1,"y":1,"width":2,"height":2,"color":[255,0,0]}, ...]`

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use motion_watch::render::{render_to_file, RenderBox, CANVAS_HEIGHT, CANVAS_WIDTH};

#[derive(Parser, Debug)]
#[command(author, version, about = "Render event predictions to an annotated GIF")]
struct Args {
    /// JSON file with the event's boxes.
    #[arg(long)]
    predictions: PathBuf,

    /// Total event duration in milliseconds.
    #[arg(long)]
    duration_ms: u64,

    /// Output GIF path.
    #[arg(long)]
    output: PathBuf,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let raw = std::fs::read_to_string(&args.predictions)
        .with_context(|| format!("read {}", args.predictions.display()))?;
    let mut boxes: Vec<RenderBox> = serde_json::from_str(&raw)
        .with_context(|| format!("parse {}", args.predictions.display()))?;
    boxes.sort_by_key(|b| b.start_ms);

    render_to_file(&boxes, args.duration_ms, &args.output)?;
    log::info!(
        "wrote {} ({} boxes, {}x{}, {} ms)",
        args.output.display(),
        boxes.len(),
        CANVAS_WIDTH,
        CANVAS_HEIGHT,
        args.duration_ms
    );
    Ok(())
}
