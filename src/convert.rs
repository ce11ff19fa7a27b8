//! The conversion pipeline: slice sources in, one NIfTI file out.
//!
//! Slices are loaded and ordered, stacked into a volume with its native
//! DICOM affine, switched to the NIfTI convention and written. Every series
//! is independent, so a batch runs its series in parallel and a failure in
//! one never stops the others.

use crate::coords::CoordinateNormalizer;
use crate::dicom_reader::DicomSliceReader;
use crate::enums::{GeometryPolicy, Orientation};
use crate::nifti_writer::{NiftiWriter, VolumeWriter, WriteError};
use crate::reconstruct::{GeometryWarning, ReconstructError, Reconstruction, VolumeReconstructor};
use crate::selection::{SelectionError, SeriesSelector};
use crate::series_loader::{ScanConfig, Series, SeriesLoader, SeriesLoaderError};
use crate::slice::SliceMetadataReader;
use crate::volume::Volume;

use log::{error, info};
use rayon::prelude::*;
use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use web_time::Instant;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("Series {series}: {source}")]
    Selection {
        series: String,
        #[source]
        source: SelectionError,
    },

    #[error("Series {series}: {source}")]
    Load {
        series: String,
        #[source]
        source: SeriesLoaderError,
    },

    #[error("Series {series}: {source}")]
    Reconstruct {
        series: String,
        #[source]
        source: ReconstructError,
    },

    #[error("Series {series}: {source}")]
    Write {
        series: String,
        #[source]
        source: WriteError,
    },

    #[error("Series {series}: preview failed: {source}")]
    Preview {
        series: String,
        #[source]
        source: image::ImageError,
    },
}

impl ConvertError {
    /// Identifier of the series that failed.
    pub fn series(&self) -> &str {
        match self {
            ConvertError::Selection { series, .. }
            | ConvertError::Load { series, .. }
            | ConvertError::Reconstruct { series, .. }
            | ConvertError::Write { series, .. }
            | ConvertError::Preview { series, .. } => series,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ConvertConfig {
    pub scan: ScanConfig,
    pub policy: GeometryPolicy,
    /// Also write a PNG of the centre slice along this axis
    pub preview: Option<Orientation>,
}

/// One series to convert.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConversionJob {
    pub series: String,
    /// Directory or single file with the slices
    pub input: PathBuf,
    pub output: PathBuf,
}

#[derive(Clone, Debug)]
pub struct ConversionReport {
    pub series: String,
    pub output: PathBuf,
    pub preview: Option<PathBuf>,
    /// (slices, rows, columns)
    pub dim: (usize, usize, usize),
    pub pixdim: [f64; 4],
    pub warnings: Vec<GeometryWarning>,
    pub elapsed: Duration,
}

pub struct Converter<R = DicomSliceReader, W = NiftiWriter> {
    reader: R,
    writer: W,
    config: ConvertConfig,
}

impl Converter {
    pub fn new(config: ConvertConfig) -> Self {
        Self::with_io(DicomSliceReader, NiftiWriter, config)
    }
}

impl<R: SliceMetadataReader, W: VolumeWriter> Converter<R, W> {
    pub fn with_io(reader: R, writer: W, config: ConvertConfig) -> Self {
        Self {
            reader,
            writer,
            config,
        }
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    /// Reconstruct `series` and move it to NIfTI (RAS) coordinates.
    pub fn volume_from_series(&self, series: &Series) -> Result<Reconstruction, ReconstructError> {
        let Reconstruction { volume, warnings } =
            VolumeReconstructor::reconstruct(series, self.config.policy)?;
        Ok(Reconstruction {
            volume: CoordinateNormalizer::convert(volume),
            warnings,
        })
    }

    /// Convert explicitly listed slice files.
    pub fn convert_paths(
        &self,
        name: &str,
        paths: &[PathBuf],
        output: &Path,
    ) -> Result<ConversionReport, ConvertError> {
        let start = Instant::now();
        let series =
            SeriesLoader::load_from_file_paths(paths, &self.reader).map_err(|source| {
                ConvertError::Load {
                    series: name.to_string(),
                    source,
                }
            })?;
        self.finish(name, &series, output, start)
    }

    /// Convert the series found at `job.input`.
    pub fn convert(&self, job: &ConversionJob) -> Result<ConversionReport, ConvertError> {
        let start = Instant::now();
        let series = SeriesLoader::load_from_directory(&job.input, &self.config.scan, &self.reader)
            .map_err(|source| ConvertError::Load {
                series: job.series.clone(),
                source,
            })?;
        self.finish(&job.series, &series, &job.output, start)
    }

    /// Convert every job in parallel. Results are in job order.
    pub fn convert_batch(
        &self,
        jobs: &[ConversionJob],
    ) -> Vec<Result<ConversionReport, ConvertError>> {
        jobs.par_iter()
            .map(|job| {
                let result = self.convert(job);
                match &result {
                    Ok(report) => info!(
                        "Converted {} -> {} in {:?}",
                        report.series,
                        report.output.display(),
                        report.elapsed
                    ),
                    Err(e) => error!("Skipping series: {e}"),
                }
                result
            })
            .collect()
    }

    /// Resolve `selectors` under `root` and convert them into `output_dir`
    /// as `PATIENT_INDEX.nii.gz`.
    ///
    /// One result per distinct selector, in first-seen order. Repeated
    /// selectors are converted once.
    pub fn convert_selection(
        &self,
        root: &Path,
        selectors: &[SeriesSelector],
        output_dir: &Path,
    ) -> Vec<Result<ConversionReport, ConvertError>> {
        let mut results: Vec<Option<Result<ConversionReport, ConvertError>>> =
            Vec::with_capacity(selectors.len());
        let mut jobs = Vec::new();
        let mut slots = Vec::new();

        let mut seen = HashSet::new();
        for selector in selectors.iter().filter(|s| seen.insert(*s)) {
            match selector.resolve(root) {
                Ok(input) => {
                    slots.push(results.len());
                    results.push(None);
                    jobs.push(ConversionJob {
                        series: selector.to_string(),
                        input,
                        output: output_dir.join(selector.output_file_name()),
                    });
                }
                Err(source) => {
                    error!("Cannot resolve {selector}: {source}");
                    results.push(Some(Err(ConvertError::Selection {
                        series: selector.to_string(),
                        source,
                    })));
                }
            }
        }

        for (slot, result) in slots.into_iter().zip(self.convert_batch(&jobs)) {
            results[slot] = Some(result);
        }
        results.into_iter().flatten().collect()
    }

    fn finish(
        &self,
        name: &str,
        series: &Series,
        output: &Path,
        start: Instant,
    ) -> Result<ConversionReport, ConvertError> {
        info!("Reconstructing {name} from {} slices", series.len());
        let Reconstruction { volume, warnings } =
            self.volume_from_series(series)
                .map_err(|source| ConvertError::Reconstruct {
                    series: name.to_string(),
                    source,
                })?;

        self.write(name, &volume, output)?;
        let preview = self.write_preview(name, &volume, output)?;

        Ok(ConversionReport {
            series: name.to_string(),
            output: output.to_path_buf(),
            preview,
            dim: volume.dim(),
            pixdim: volume.pixdim,
            warnings,
            elapsed: start.elapsed(),
        })
    }

    fn write(&self, name: &str, volume: &Volume, output: &Path) -> Result<(), ConvertError> {
        let write_error = |source| ConvertError::Write {
            series: name.to_string(),
            source,
        };
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| write_error(WriteError::Io(e)))?;
        }
        self.writer.write_volume(volume, output).map_err(write_error)
    }

    fn write_preview(
        &self,
        name: &str,
        volume: &Volume,
        output: &Path,
    ) -> Result<Option<PathBuf>, ConvertError> {
        let Some(orientation) = self.config.preview else {
            return Ok(None);
        };
        let Some(image) = volume.preview_image(orientation) else {
            return Ok(None);
        };
        let path = preview_path(output);
        image.save(&path).map_err(|source| ConvertError::Preview {
            series: name.to_string(),
            source,
        })?;
        Ok(Some(path))
    }
}

/// `out/scan.nii.gz` -> `out/scan.png`
pub fn preview_path(output: &Path) -> PathBuf {
    let file_name = output
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = file_name
        .strip_suffix(".nii.gz")
        .or_else(|| file_name.strip_suffix(".nii"))
        .unwrap_or(&file_name);
    output.with_file_name(format!("{stem}.png"))
}
