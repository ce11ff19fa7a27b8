use clap::{Parser, Subcommand, ValueEnum};
use dicom_nifti::{
    ConversionJob, ConversionReport, ConvertConfig, ConvertError, Converter, GeometryPolicy,
    Orientation, ScanConfig, SeriesSelector,
};
use log::info;
use std::path::PathBuf;
use std::process;

/// Convert DICOM series to NIfTI volumes
#[derive(Parser, Debug)]
#[command(name = "dicom2nifti")]
#[command(about = "Convert single-series DICOM directories to NIfTI-1 (float32) volumes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Abort a series on inconsistent pixel spacing or skewed geometry
    #[arg(long, global = true)]
    strict: bool,

    /// Also write a PNG of the centre slice next to each volume
    #[arg(long, global = true, value_name = "AXIS")]
    preview: Option<PreviewAxis>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert one series
    Convert {
        /// Directory with the slices of one series, or a single file
        #[arg(short, long, value_name = "INPUT")]
        input: PathBuf,

        /// Output file, use .nii.gz for compression
        #[arg(short, long, value_name = "OUTPUT")]
        output: PathBuf,
    },
    /// Convert selected series of a dataset laid out as ROOT/PATIENT/STUDY/SERIES
    Batch {
        /// Dataset root
        #[arg(short, long, value_name = "ROOT")]
        root_path: PathBuf,

        /// Output folder for the NIfTI volumes
        #[arg(short, long, value_name = "DIR")]
        output: PathBuf,

        /// Series to convert as PATIENT_INDEX (INDEX-th study of PATIENT)
        #[arg(short, long = "series", value_name = "PATIENT_INDEX", required = true)]
        series: Vec<SeriesSelector>,

        /// Suffixes tried in order when looking for slice files
        #[arg(long, value_delimiter = ',', default_value = "dcm,DCM,dc,DC,IMG")]
        extensions: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PreviewAxis {
    Axial,
    Coronal,
    Sagittal,
}

impl From<PreviewAxis> for Orientation {
    fn from(axis: PreviewAxis) -> Self {
        match axis {
            PreviewAxis::Axial => Orientation::Axial,
            PreviewAxis::Coronal => Orientation::Coronal,
            PreviewAxis::Sagittal => Orientation::Sagittal,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let mut config = ConvertConfig {
        policy: if cli.strict {
            GeometryPolicy::Strict
        } else {
            GeometryPolicy::BestEffort
        },
        preview: cli.preview.map(Orientation::from),
        ..ConvertConfig::default()
    };

    match cli.command {
        Command::Convert { input, output } => {
            info!("Converting DICOM to NIfTI");
            info!("DICOM: {}", input.display());
            info!("NIfTI: {}", output.display());

            let job = ConversionJob {
                series: input.display().to_string(),
                input,
                output,
            };
            match Converter::new(config).convert(&job) {
                Ok(report) => print_report(&report),
                Err(e) => {
                    eprintln!("Error: {e}");
                    process::exit(1);
                }
            }
        }
        Command::Batch {
            root_path,
            output,
            series,
            extensions,
        } => {
            if !root_path.is_dir() {
                eprintln!("Error: {} is not a directory", root_path.display());
                process::exit(1);
            }
            config.scan = ScanConfig { extensions };

            let converter = Converter::new(config);
            let results = converter.convert_selection(&root_path, &series, &output);
            let failed: Vec<&ConvertError> =
                results.iter().filter_map(|r| r.as_ref().err()).collect();

            for report in results.iter().filter_map(|r| r.as_ref().ok()) {
                print_report(report);
            }
            for e in &failed {
                eprintln!("Failed: {e}");
            }

            info!(
                "Converted {} of {} series",
                results.len() - failed.len(),
                results.len()
            );
            if !failed.is_empty() {
                process::exit(1);
            }
        }
    }
}

fn setup_logging(verbose: bool) {
    logger_builder(verbose, env_logger::DEFAULT_FILTER_ENV).init();
}

/// Info (Debug with `verbose`) unless `filter_var` names a filter.
fn logger_builder(verbose: bool, filter_var: &str) -> env_logger::Builder {
    let default_filter = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().filter_or(filter_var, default_filter))
}

fn print_report(report: &ConversionReport) {
    let (slices, rows, columns) = report.dim;
    println!(
        "{}: {} ({} x {} x {}, spacing {} x {} x {} mm, qfac {})",
        report.series,
        report.output.display(),
        columns,
        rows,
        slices,
        report.pixdim[1],
        report.pixdim[2],
        report.pixdim[3],
        report.pixdim[0]
    );
    if let Some(preview) = &report.preview {
        println!("  preview: {}", preview.display());
    }
    for warning in &report.warnings {
        println!("  warning: {warning}");
    }
}
