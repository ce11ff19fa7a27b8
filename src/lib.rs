//! # DICOM-to-NIfTI library
//!
//! This crate converts a directory of single-series DICOM slices into one
//! NIfTI-1 volume whose affine places every voxel correctly in patient
//! space.

//!
//! The conversion runs in three steps:
//!  - Loading: every slice is read into a [`SliceRecord`] and the series is
//!    ordered by InstanceNumber (slices without one sort first).
//!  - Reconstruction: slices are stacked into a volume. The slice step is a
//!    least-squares fit over all ImagePositionPatient values and the slice
//!    plane the average ImageOrientationPatient, so small metadata noise is
//!    smoothed out. Inconsistent pixel spacing and skewed stacks only warn
//!    unless [`GeometryPolicy::Strict`] is selected.
//!  - Normalisation: the affine is moved from DICOM (LPS) to NIfTI (RAS)
//!    coordinates and the voxels are reordered so the dominant in-plane
//!    directions are positive. Voxels are never resampled.
//!
//! DICOM files are assumed to have the following attributes:
//!   - Images from the same series (Series Instance UID)
//!   - No multiframe (always the first frame is used)
//!
//! Reading and writing go through the [`SliceMetadataReader`] and
//! [`VolumeWriter`] traits, so the reconstruction itself does not depend
//! on either file format.
//!
//! # Examples
//!
//! ## Converting a directory
//!
//! ```no_run
//! # use dicom_nifti::{ConversionJob, ConvertConfig, Converter};
//! # use std::path::PathBuf;
//! let converter = Converter::new(ConvertConfig::default());
//! let report = converter
//!     .convert(&ConversionJob {
//!         series: "scan".into(),
//!         input: PathBuf::from("dicom"),
//!         output: PathBuf::from("scan.nii.gz"),
//!     })
//!     .expect("should have converted the series");
//! println!("{:?} voxels, spacing {:?}", report.dim, &report.pixdim[1..]);
//! ```
//!
//! ## Reconstructing without writing
//!
//! ```no_run
//! # use dicom_nifti::{
//! #     CoordinateNormalizer, DicomSliceReader, GeometryPolicy, ScanConfig, SeriesLoader,
//! #     VolumeReconstructor,
//! # };
//! let series =
//!     SeriesLoader::load_from_directory("dicom", &ScanConfig::default(), &DicomSliceReader)
//!         .expect("should have loaded files from directory");
//! let reconstruction = VolumeReconstructor::reconstruct(&series, GeometryPolicy::BestEffort)
//!     .expect("slices should share one shape");
//! let volume = CoordinateNormalizer::convert(reconstruction.volume);
//! println!("{}", volume.affine);
//! ```

pub mod convert;
pub mod coords;
pub mod dicom_reader;
pub mod enums;
pub mod nifti_writer;
pub mod reconstruct;
pub mod selection;
pub mod series_loader;
pub mod slice;
pub mod volume;

pub use convert::{ConversionJob, ConversionReport, ConvertConfig, ConvertError, Converter};
pub use coords::CoordinateNormalizer;
pub use dicom_reader::DicomSliceReader;
pub use enums::{Convention, GeometryPolicy, Orientation};
pub use nifti_writer::{NiftiWriter, VolumeWriter, WriteError};
pub use reconstruct::{
    AffineFit, GeometryWarning, ReconstructError, Reconstruction, VolumeReconstructor,
    create_affine,
};
pub use selection::{SelectionError, SeriesSelector};
pub use series_loader::{ScanConfig, Series, SeriesLoader, SeriesLoaderError, find_slice_files};
pub use slice::{SliceMetadataReader, SliceReadError, SliceRecord};
pub use volume::Volume;
