use crate::volume::Volume;

use log::debug;
use nalgebra::{Matrix4, Vector4};
use ndarray::Axis;

/// Switches a volume between the DICOM (LPS) and NIfTI (RAS) conventions.
///
/// The two conventions differ by the sign of the first two physical axes,
/// so the same operation converts in both directions.
pub struct CoordinateNormalizer;

impl CoordinateNormalizer {
    /// Rewrites the affine for the opposite convention and reorders the
    /// voxels so that the dominant entries of the first two affine columns
    /// are non-negative.
    ///
    /// Voxels are only reindexed, never resampled, and every flip of the
    /// data is matched by the affine so the physical geometry is unchanged.
    pub fn convert(mut volume: Volume) -> Volume {
        let convention_flip = Matrix4::from_diagonal(&Vector4::new(-1.0, -1.0, 1.0, 1.0));
        volume.affine = convention_flip * volume.affine;

        let (xmaxi, ymaxi) = dominant_rows(&volume.affine);
        let (_, rows, columns) = volume.dim();

        if volume.affine[(xmaxi, 0)] < 0.0 {
            debug!("Flipping columns");
            flip_axis(&mut volume, 0, columns);
        }
        if volume.affine[(ymaxi, 1)] < 0.0 {
            debug!("Flipping rows");
            flip_axis(&mut volume, 1, rows);
        }

        // -0.0 -> 0.0
        volume.affine.apply(|x| {
            if *x == 0.0 {
                *x = 0.0;
            }
        });
        volume.convention = volume.convention.opposite();
        volume
    }
}

/// Rows holding the largest magnitude of affine columns 0 and 1. The row
/// picked for column 0 is excluded for column 1 so the two always differ.
pub fn dominant_rows(affine: &Matrix4<f64>) -> (usize, usize) {
    let xmaxi = argmax_abs(affine.column(0).iter().copied());
    let ymaxi = argmax_abs(
        affine
            .column(1)
            .iter()
            .enumerate()
            .map(|(row, &value)| if row == xmaxi { 0.0 } else { value }),
    );
    (xmaxi, ymaxi)
}

/// Index of the first element with the largest magnitude.
fn argmax_abs(values: impl Iterator<Item = f64>) -> usize {
    let mut best = (0, f64::NEG_INFINITY);
    for (index, value) in values.enumerate() {
        if value.abs() > best.1 {
            best = (index, value.abs());
        }
    }
    best.0
}

/// Reverses the voxel axis addressed by affine column `column` (0 for
/// columns, 1 for rows) and moves the origin to the former last voxel.
/// Negating one column changes the handedness, so qfac follows.
fn flip_axis(volume: &mut Volume, column: usize, extent: usize) {
    let axis = match column {
        0 => Axis(2),
        _ => Axis(1),
    };
    volume.data.invert_axis(axis);
    volume.data = volume.data.as_standard_layout().into_owned();

    let direction = volume.affine.column(column).into_owned();
    let origin = volume.affine.column(3) + direction * extent.saturating_sub(1) as f64;
    volume.affine.set_column(3, &origin);
    volume.affine.set_column(column, &(-direction));
    volume.pixdim[0] = -volume.pixdim[0];
}
