//! Labelpivot: image-annotation conversion through a shared IR.
//!
//! Labelpivot converts computer-vision image annotations between CVAT XML,
//! YOLO label text and Label Studio task JSON. Every conversion passes
//! through an intermediate representation (IR), so each format only needs
//! a decoder and an encoder rather than a converter per format pair.
//!
//! # Modules
//!
//! - [`ir`]: IR types plus the per-format codecs
//! - [`conversion`]: cross-format drivers used by the CLI
//! - [`error`]: error types for labelpivot operations

pub mod conversion;
pub mod error;
pub mod ir;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use error::LabelpivotError;

use ir::io_yolo::AnnotationKind;

/// The labelpivot CLI application.
#[derive(Parser)]
#[command(name = "labelpivot")]
#[command(version, author, about)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

/// Available subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Convert annotations between formats.
    Convert(ConvertArgs),
}

/// Arguments for the convert subcommand.
#[derive(clap::Args)]
struct ConvertArgs {
    /// Input: a CVAT XML file, a YOLO dataset YAML, or a Label Studio task
    /// JSON file.
    input: PathBuf,

    /// Output directory.
    output: PathBuf,

    /// Input format ('cvat', 'yolo', or 'label-studio').
    #[arg(long)]
    from: String,

    /// Output format ('yolo' or 'label-studio').
    #[arg(long)]
    to: String,

    /// YOLO annotation type ('bbox', 'segmentation', or 'pose').
    #[arg(long, default_value = "bbox")]
    annotation_type: String,
}

/// Run the labelpivot CLI.
///
/// This is the main entry point for the CLI, called from `main.rs`.
pub fn run() -> Result<(), LabelpivotError> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Convert(args)) => run_convert(args),
        None => {
            println!("labelpivot {}", env!("CARGO_PKG_VERSION"));
            println!();
            println!("Convert image annotations between CVAT, YOLO and Label Studio.");
            println!();
            println!("Run 'labelpivot --help' for usage information.");
            Ok(())
        }
    }
}

/// Execute the convert subcommand.
fn run_convert(args: ConvertArgs) -> Result<(), LabelpivotError> {
    let kind: AnnotationKind = args.annotation_type.parse()?;

    match (args.from.as_str(), args.to.as_str()) {
        ("cvat", "yolo") => {
            let yaml = conversion::cvat_to_yolo(&args.input, &args.output, kind)?;
            println!("Wrote YOLO dataset YAML to {}", yaml.display());
        }
        ("cvat", "label-studio") => {
            let tasks = conversion::cvat_to_label_studio(&args.input, &args.output)?;
            println!("Wrote {} Label Studio task file(s)", tasks.len());
        }
        ("yolo", "label-studio") => {
            let tasks = conversion::yolo_to_label_studio(&args.input, kind, &args.output)?;
            println!("Wrote {} Label Studio task file(s)", tasks.len());
        }
        ("label-studio", "yolo") => {
            let yaml = conversion::label_studio_to_yolo(&args.input, &args.output, kind)?;
            println!("Wrote YOLO dataset YAML to {}", yaml.display());
        }
        (from, to) => {
            return Err(LabelpivotError::UnsupportedFormat(format!(
                "'{from}' -> '{to}' (supported: cvat->yolo, cvat->label-studio, \
                 yolo->label-studio, label-studio->yolo)"
            )));
        }
    }

    Ok(())
}
