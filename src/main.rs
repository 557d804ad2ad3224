//! Stamp Annotator - command line front end
//!
//! Imports stamp page photos, runs region detection and looks up info for
//! individual stamps.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use stamp_annotator::config::{self, AppConfig};
use stamp_annotator::geometry::Size;
use stamp_annotator::session::{AnnotationSession, DetectionStatus};
use stamp_annotator::storage::{self, ImageId};

/// Stamp Annotator - detect and annotate stamps in photos
#[derive(Parser, Debug)]
#[command(name = "stamp-annotator")]
#[command(about = "Detect stamps in photos of stamp pages and look up info about them")]
struct Args {
    /// Configuration file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory holding the collection and stored rasters
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import an image file into the collection
    Import {
        path: PathBuf,
        /// Display name (defaults to the file name)
        #[arg(long)]
        name: Option<String>,
    },
    /// List imported images
    List,
    /// Rename an image
    Rename { id: ImageId, name: String },
    /// Delete an image and its stored raster
    Delete { id: ImageId },
    /// Detect stamp regions in an image
    Detect { id: ImageId },
    /// Print display rectangles of detected regions for a viewport
    Show {
        id: ImageId,
        /// Viewport size as WIDTHxHEIGHT
        #[arg(long, value_parser = parse_viewport)]
        viewport: Size,
    },
    /// Look up info for a detected region (1-based index)
    Lookup { id: ImageId, index: usize },
    /// Export detected regions as PNG crops
    Export { id: ImageId, dir: PathBuf },
}

fn parse_viewport(value: &str) -> Result<Size, String> {
    let (width, height) = value
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {value:?}"))?;
    let width: f64 = width
        .trim()
        .parse()
        .map_err(|e| format!("invalid width {width:?}: {e}"))?;
    let height: f64 = height
        .trim()
        .parse()
        .map_err(|e| format!("invalid height {height:?}: {e}"))?;
    Ok(Size::new(width, height))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();

    let config = load_config(args.config.as_ref())?;
    let data_dir_override = args.data_dir.as_ref().or(config.storage.data_dir.as_ref());
    let data_dir = storage::resolve_data_dir(data_dir_override.map(PathBuf::as_path))
        .context("Failed to prepare data directory")?;
    info!("Using data directory {:?}", data_dir);

    let mut session =
        AnnotationSession::from_config(&config, &data_dir).context("Failed to open collection")?;

    run(&mut session, args.command).await
}

/// Load the configuration from an explicit path or the default location
fn load_config(path: Option<&PathBuf>) -> Result<AppConfig> {
    match path {
        Some(path) => config::load_config(path),
        None => match config::default_config_path() {
            Ok(path) => config::load_or_default(&path),
            Err(e) => {
                info!("No config directory available ({}), using defaults", e);
                Ok(AppConfig::default())
            }
        },
    }
}

async fn run(session: &mut AnnotationSession, command: Command) -> Result<()> {
    match command {
        Command::Import { path, name } => {
            let id = session
                .import_file(&path, name.as_deref())
                .with_context(|| format!("Failed to import {:?}", path))?;
            println!("{id}");
        }
        Command::List => {
            for image in session.images() {
                let status = match session.detection_status(image.id())? {
                    DetectionStatus::Unprocessed => "not processed".to_string(),
                    DetectionStatus::Detected(regions) => format!("{} regions", regions.len()),
                    DetectionStatus::Detecting => "detecting".to_string(),
                    DetectionStatus::Failed(e) => format!("failed: {e}"),
                };
                println!(
                    "{}  {}  {}  ({})",
                    image.id(),
                    image.imported_at().to_rfc3339(),
                    image.name,
                    status
                );
            }
        }
        Command::Rename { id, name } => {
            session.rename(id, name)?;
        }
        Command::Delete { id } => {
            let report = session.delete(id)?;
            if let Some(e) = report.raster_error {
                eprintln!("Image removed, but its raster could not be deleted: {e}");
            }
        }
        Command::Detect { id } => {
            let regions = session.detect(id).await?;
            println!("Detected {} regions", regions.len());
            for (n, region) in regions.iter().enumerate() {
                println!(
                    "  [{}] x={:.4} y={:.4} w={:.4} h={:.4}",
                    n + 1,
                    region.x,
                    region.y,
                    region.width,
                    region.height
                );
            }
        }
        Command::Show { id, viewport } => {
            for (n, display) in session.display_regions(id, viewport)?.iter().enumerate() {
                let rect = display.rect;
                println!(
                    "  [{}] x={:.1} y={:.1} w={:.1} h={:.1}",
                    n + 1,
                    rect.x,
                    rect.y,
                    rect.width,
                    rect.height
                );
            }
        }
        Command::Lookup { id, index } => {
            let image = session
                .image(id)
                .with_context(|| format!("Image {id} not found"))?;
            let regions = image.regions().regions();
            if index == 0 || index > regions.len() {
                bail!("Region index {} out of range (1-{})", index, regions.len());
            }
            let region = regions[index - 1];

            let record = session.region_info(id, region).await?;
            println!("{}", record.title);
            let fields = [
                ("Origin", &record.origin),
                ("Issued", &record.issue_date),
                ("Rarity", &record.rarity),
                ("Nominal value", &record.nominal_value),
                ("Estimated value", &record.estimated_value),
            ];
            for (label, value) in fields {
                if let Some(value) = value {
                    println!("  {label}: {value}");
                }
            }
            if !record.narrative.is_empty() {
                println!("  {}", record.narrative);
            }
            for url in &record.source_urls {
                println!("  Source: {url}");
            }
        }
        Command::Export { id, dir } => {
            let written = session.export_region_crops(id, &dir)?;
            for path in written {
                println!("{}", path.display());
            }
        }
    }
    Ok(())
}
