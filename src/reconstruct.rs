//! Fuses an ordered series of slices into one volume and a single affine
//! describing the geometry of the whole stack.
//!
//! The slice step is a least-squares fit over every slice position and the
//! slice plane is the average of all orientations.

use crate::enums::GeometryPolicy;
use crate::series_loader::Series;
use crate::slice::SliceRecord;
use crate::volume::Volume;

use log::{debug, warn};
use nalgebra::{Matrix4, Vector3};
use ndarray::{Array3, s};
use std::fmt;
use thiserror::Error;

/// Components below this magnitude are treated as exactly zero.
pub const SNAP_TOLERANCE: f64 = 1e-6;

/// Allowed mismatch between the fitted slice step and the plane normal.
pub const ORTHOGONALITY_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Error)]
pub enum ReconstructError {
    #[error("No slices to reconstruct")]
    NoSlices,

    #[error("Slice {index} has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        index: usize,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("Pixel spacing is inconsistent (total deviation {deviation})")]
    InconsistentSpacing { deviation: f64 },

    #[error("Non-orthogonal volume (deviation {deviation})")]
    NonOrthogonalVolume { deviation: f64 },
}

/// Geometry problems that do not stop a best-effort reconstruction.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum GeometryWarning {
    /// Summed absolute deviation of the pixel spacings from the first slice
    InconsistentSpacing { deviation: f64 },
    /// Difference between the slice spacing and the step along the normal
    NonOrthogonalVolume { deviation: f64 },
}

impl fmt::Display for GeometryWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeometryWarning::InconsistentSpacing { deviation } => {
                write!(f, "Pixel spacing is inconsistent (total deviation {deviation})")
            }
            GeometryWarning::NonOrthogonalVolume { deviation } => {
                write!(f, "Non-orthogonal volume (deviation {deviation})")
            }
        }
    }
}

impl From<GeometryWarning> for ReconstructError {
    fn from(warning: GeometryWarning) -> Self {
        match warning {
            GeometryWarning::InconsistentSpacing { deviation } => {
                ReconstructError::InconsistentSpacing { deviation }
            }
            GeometryWarning::NonOrthogonalVolume { deviation } => {
                ReconstructError::NonOrthogonalVolume { deviation }
            }
        }
    }
}

/// Affine and pixdim fitted to a stack of slices, still in DICOM (LPS)
/// patient coordinates.
#[derive(Clone, Debug, PartialEq)]
pub struct AffineFit {
    pub affine: Matrix4<f64>,
    /// (qfac, column spacing, row spacing, slice spacing)
    pub pixdim: [f64; 4],
    pub warnings: Vec<GeometryWarning>,
}

#[derive(Clone, Debug)]
pub struct Reconstruction {
    pub volume: Volume,
    pub warnings: Vec<GeometryWarning>,
}

pub struct VolumeReconstructor;

impl VolumeReconstructor {
    /// Stack a series into a volume with its native affine
    ///
    /// # Errors
    ///
    /// `ShapeMismatch` when the slices differ in pixel shape. Under
    /// [`GeometryPolicy::Strict`] the first geometry warning is returned
    /// as an error instead.
    pub fn reconstruct(
        series: &Series,
        policy: GeometryPolicy,
    ) -> Result<Reconstruction, ReconstructError> {
        let slices = series.slices();
        Self::validate_dimensions(slices)?;

        let data = Self::build_volume_array(slices);
        let fit = create_affine(slices)?;

        for warning in &fit.warnings {
            warn!("{warning}");
        }
        if policy == GeometryPolicy::Strict {
            if let Some(&warning) = fit.warnings.first() {
                return Err(warning.into());
            }
        }

        debug!("Native affine: {}", fit.affine);
        Ok(Reconstruction {
            volume: Volume::new(data, fit.affine, fit.pixdim),
            warnings: fit.warnings,
        })
    }

    fn validate_dimensions(slices: &[SliceRecord]) -> Result<(), ReconstructError> {
        let first_dim = slices.first().ok_or(ReconstructError::NoSlices)?.dim();
        match slices
            .iter()
            .enumerate()
            .find(|(_, slice)| slice.dim() != first_dim)
        {
            Some((index, slice)) => Err(ReconstructError::ShapeMismatch {
                index,
                expected: first_dim,
                found: slice.dim(),
            }),
            None => Ok(()),
        }
    }

    fn build_volume_array(slices: &[SliceRecord]) -> Array3<f32> {
        let (height, width) = slices[0].dim();
        let depth = slices.len();
        let mut volume = Array3::<f32>::zeros((depth, height, width));

        for (i, slice) in slices.iter().enumerate() {
            volume.slice_mut(s![i, .., ..]).assign(&slice.calibrated());
        }

        volume
    }
}

/// Fit the affine of a slice stack from positions, orientations and pixel
/// spacings.
///
/// The slice step (`vec`) and origin (`pos`) are the slope and intercept of
/// a linear regression of the slice positions against the slice index.
/// Column 0 of the result is the row direction scaled by the column
/// spacing, column 1 the column direction scaled by the row spacing,
/// column 2 the slice step and column 3 the origin.
pub fn create_affine(slices: &[SliceRecord]) -> Result<AffineFit, ReconstructError> {
    let first = slices.first().ok_or(ReconstructError::NoSlices)?;
    let mut warnings = Vec::new();

    let (vec, pos) = fit_positions(slices);
    let vec = snap(vec);
    let pos = snap(pos);

    // PixelSpacing is (row spacing, column spacing)
    let [row_spacing, col_spacing] = first.pixel_spacing;
    let deviation: f64 = slices
        .iter()
        .map(|slice| {
            (slice.pixel_spacing[0] - row_spacing).abs()
                + (slice.pixel_spacing[1] - col_spacing).abs()
        })
        .sum();
    if deviation > row_spacing * SNAP_TOLERANCE {
        warnings.push(GeometryWarning::InconsistentSpacing { deviation });
    }

    let slice_spacing = round_to(vec.norm(), 7);

    let (u, v) = mean_orientation(slices);

    let mut affine = Matrix4::identity();
    affine
        .fixed_view_mut::<3, 1>(0, 0)
        .copy_from(&(u * col_spacing));
    affine
        .fixed_view_mut::<3, 1>(0, 1)
        .copy_from(&(v * row_spacing));
    affine.fixed_view_mut::<3, 1>(0, 2).copy_from(&vec);
    affine.fixed_view_mut::<3, 1>(0, 3).copy_from(&pos);

    let dv = vec.dot(&u.cross(&v));
    let qfac = if dv < 0.0 { -1.0 } else { 1.0 };
    let skew = (qfac * dv - slice_spacing).abs();
    if skew > ORTHOGONALITY_TOLERANCE {
        warnings.push(GeometryWarning::NonOrthogonalVolume { deviation: skew });
    }

    Ok(AffineFit {
        affine,
        pixdim: [qfac, col_spacing, row_spacing, slice_spacing],
        warnings,
    })
}

/// Least-squares slope and intercept of position against slice index.
///
/// A single slice has no defined slope; the minimum-norm solution (zero
/// step, origin at the slice) is used.
fn fit_positions(slices: &[SliceRecord]) -> (Vector3<f64>, Vector3<f64>) {
    let n = slices.len() as f64;
    let positions: Vec<Vector3<f64>> = slices
        .iter()
        .map(|slice| Vector3::from(slice.position))
        .collect();
    let mean_position = positions.iter().sum::<Vector3<f64>>() / n;
    if slices.len() < 2 {
        return (Vector3::zeros(), mean_position);
    }

    let mean_index = (n - 1.0) / 2.0;
    let mut sxy = Vector3::zeros();
    let mut sxx = 0.0;
    for (i, p) in positions.iter().enumerate() {
        let di = i as f64 - mean_index;
        sxy += (p - mean_position) * di;
        sxx += di * di;
    }
    let slope = sxy / sxx;
    let intercept = mean_position - slope * mean_index;
    (slope, intercept)
}

/// Averaged row and column direction cosines, each re-normalised.
fn mean_orientation(slices: &[SliceRecord]) -> (Vector3<f64>, Vector3<f64>) {
    let n = slices.len() as f64;
    let mut sum = [0.0; 6];
    for slice in slices {
        for (acc, value) in sum.iter_mut().zip(slice.orientation) {
            *acc += value;
        }
    }
    let u = Vector3::new(sum[0], sum[1], sum[2]) / n;
    let v = Vector3::new(sum[3], sum[4], sum[5]) / n;

    let u = u.try_normalize(0.0).unwrap_or(u);
    let v = v.try_normalize(0.0).unwrap_or(v);
    (snap(u), snap(v))
}

fn snap(v: Vector3<f64>) -> Vector3<f64> {
    v.map(|x| if x.abs() < SNAP_TOLERANCE { 0.0 } else { x })
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}
