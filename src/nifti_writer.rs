use crate::enums::Convention;
use crate::volume::Volume;

use log::{debug, warn};
use nalgebra::{Matrix3, Matrix4, Vector3};
use nifti::{NiftiHeader, writer::WriterOptions};
use std::path::Path;
use thiserror::Error;

/// NIfTI-1 stores dimensions as signed 16 bit values.
const MAX_DIM: usize = i16::MAX as usize;

/// NIFTI_XFORM_SCANNER_ANAT
const XFORM_SCANNER_ANAT: i16 = 1;

/// NIFTI_UNITS_MM
const UNITS_MM: u8 = 2;

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("Volume of shape {0:?} exceeds the NIfTI-1 dimension limit")]
    TooLarge((usize, usize, usize)),

    #[error("NIfTI error: {0}")]
    Nifti(#[from] nifti::NiftiError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serialises a volume and its affine to a file.
pub trait VolumeWriter: Sync {
    fn write_volume(&self, volume: &Volume, path: &Path) -> Result<(), WriteError>;
}

/// Writes single-file NIfTI-1 images with `f32` voxels.
///
/// The voxel array is stored as (column, row, slice). Both the sform and
/// the qform carry the affine. A `.nii.gz` path is gzip compressed.
#[derive(Clone, Copy, Debug, Default)]
pub struct NiftiWriter;

impl VolumeWriter for NiftiWriter {
    fn write_volume(&self, volume: &Volume, path: &Path) -> Result<(), WriteError> {
        let dim = volume.dim();
        if dim.0 > MAX_DIM || dim.1 > MAX_DIM || dim.2 > MAX_DIM {
            return Err(WriteError::TooLarge(dim));
        }
        if volume.convention != Convention::Ras {
            warn!(
                "Writing {} with an LPS affine, NIfTI readers will assume RAS",
                path.display()
            );
        }

        let header = nifti_header(volume);
        debug!(
            "NIfTI header for {}: pixdim {:?}, srow_x {:?}, srow_y {:?}, srow_z {:?}",
            path.display(),
            &header.pixdim[..4],
            header.srow_x,
            header.srow_y,
            header.srow_z
        );

        WriterOptions::new(path)
            .reference_header(&header)
            .write_nifti(&volume.data.view().reversed_axes())?;
        Ok(())
    }
}

/// Header carrying the geometry of `volume`. Dimensions and data type are
/// filled in by the writer from the voxel array.
pub fn nifti_header(volume: &Volume) -> NiftiHeader {
    let affine = &volume.affine;
    let row = |r: usize| {
        [
            affine[(r, 0)] as f32,
            affine[(r, 1)] as f32,
            affine[(r, 2)] as f32,
            affine[(r, 3)] as f32,
        ]
    };

    let [qfac, sx, sy, sz] = volume.pixdim;
    let (b, c, d) = quaternion(affine, qfac);

    NiftiHeader {
        pixdim: [
            qfac as f32,
            sx as f32,
            sy as f32,
            sz as f32,
            1.0,
            1.0,
            1.0,
            1.0,
        ],
        xyzt_units: UNITS_MM,
        qform_code: XFORM_SCANNER_ANAT,
        sform_code: XFORM_SCANNER_ANAT,
        quatern_b: b as f32,
        quatern_c: c as f32,
        quatern_d: d as f32,
        quatern_x: affine[(0, 3)] as f32,
        quatern_y: affine[(1, 3)] as f32,
        quatern_z: affine[(2, 3)] as f32,
        srow_x: row(0),
        srow_y: row(1),
        srow_z: row(2),
        ..NiftiHeader::default()
    }
}

/// Quaternion (b, c, d) of the rotation part of `affine`, with the third
/// column negated when `qfac` is negative.
fn quaternion(affine: &Matrix4<f64>, qfac: f64) -> (f64, f64, f64) {
    let unit = |c: usize| {
        let column: Vector3<f64> = affine.fixed_view::<3, 1>(0, c).into_owned();
        column.try_normalize(0.0)
    };
    let u = unit(0).unwrap_or_else(Vector3::x);
    let v = unit(1).unwrap_or_else(Vector3::y);
    let mut w = unit(2).unwrap_or_else(|| u.cross(&v) * qfac.signum());
    if qfac < 0.0 {
        w = -w;
    }
    let r = Matrix3::from_columns(&[u, v, w]);

    let trace = r[(0, 0)] + r[(1, 1)] + r[(2, 2)] + 1.0;
    let (a, b, c, d) = if trace > 0.5 {
        let a = 0.5 * trace.sqrt();
        (
            a,
            0.25 * (r[(2, 1)] - r[(1, 2)]) / a,
            0.25 * (r[(0, 2)] - r[(2, 0)]) / a,
            0.25 * (r[(1, 0)] - r[(0, 1)]) / a,
        )
    } else {
        let xd = 1.0 + r[(0, 0)] - (r[(1, 1)] + r[(2, 2)]);
        let yd = 1.0 + r[(1, 1)] - (r[(0, 0)] + r[(2, 2)]);
        let zd = 1.0 + r[(2, 2)] - (r[(0, 0)] + r[(1, 1)]);
        if xd > 1.0 {
            let b = 0.5 * xd.sqrt();
            (
                0.25 * (r[(2, 1)] - r[(1, 2)]) / b,
                b,
                0.25 * (r[(0, 1)] + r[(1, 0)]) / b,
                0.25 * (r[(0, 2)] + r[(2, 0)]) / b,
            )
        } else if yd > 1.0 {
            let c = 0.5 * yd.sqrt();
            (
                0.25 * (r[(0, 2)] - r[(2, 0)]) / c,
                0.25 * (r[(0, 1)] + r[(1, 0)]) / c,
                c,
                0.25 * (r[(1, 2)] + r[(2, 1)]) / c,
            )
        } else {
            let d = 0.5 * zd.sqrt();
            (
                0.25 * (r[(1, 0)] - r[(0, 1)]) / d,
                0.25 * (r[(0, 2)] + r[(2, 0)]) / d,
                0.25 * (r[(1, 2)] + r[(2, 1)]) / d,
                d,
            )
        }
    };

    if a < 0.0 { (-b, -c, -d) } else { (b, c, d) }
}
