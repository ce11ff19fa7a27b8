use crate::enums::{Convention, Orientation};

use image::ImageBuffer;
use image::Luma;
use nalgebra::{Matrix4, Vector3};
use ndarray::Array3;
use ndarray::ArrayView2;
use ndarray::s;
use rayon::prelude::*;

/// Voxels of one series together with the geometry that places them in
/// patient space.
#[derive(Clone, Debug, PartialEq)]
pub struct Volume {
    /// Calibrated intensities, indexed (slice, row, column)
    pub data: Array3<f32>,
    /// Maps (column, row, slice, 1) to physical coordinates
    pub affine: Matrix4<f64>,
    /// (qfac, column spacing, row spacing, slice spacing)
    pub pixdim: [f64; 4],
    pub convention: Convention,
}

impl Volume {
    pub fn new(data: Array3<f32>, affine: Matrix4<f64>, pixdim: [f64; 4]) -> Self {
        Self {
            data,
            affine,
            pixdim,
            convention: Convention::Lps,
        }
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Get a reference to the underlying data
    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    pub fn qfac(&self) -> f64 {
        self.pixdim[0]
    }

    /// Physical position of a voxel index given as (column, row, slice)
    pub fn voxel_to_world(&self, column: f64, row: f64, slice: f64) -> Vector3<f64> {
        let p = self.affine * nalgebra::Vector4::new(column, row, slice, 1.0);
        Vector3::new(p.x, p.y, p.z)
    }

    pub fn get_slice_from_axis(
        &self,
        index: usize,
        orientation: &Orientation,
    ) -> Option<ArrayView2<'_, f32>> {
        if !self.is_valid_index(index, orientation) {
            return None;
        }
        let slice_result = match orientation {
            Orientation::Axial => self.data().slice(s![index, .., ..]),
            Orientation::Coronal => self.data().slice(s![.., index, ..]),
            Orientation::Sagittal => self.data().slice(s![.., .., index]),
        };
        Some(slice_result)
    }

    /// Grayscale rendering of the centre slice along `orientation`,
    /// windowed to the slice's own value range.
    pub fn preview_image(&self, orientation: Orientation) -> Option<ImageBuffer<Luma<u8>, Vec<u8>>> {
        let index = self.axis_len(&orientation) / 2;
        let slice = self.get_slice_from_axis(index, &orientation)?;
        Self::slice_to_image(&slice)
    }

    #[inline]
    fn normalize_to_u8(value: f32, min: f32, range: f32) -> u8 {
        if range <= 0.0 {
            return 0;
        }
        (((value - min) / range) * 255.0).clamp(0.0, 255.0) as u8
    }

    fn slice_to_image(slice: &ArrayView2<'_, f32>) -> Option<ImageBuffer<Luma<u8>, Vec<u8>>> {
        let (height, width) = slice.dim();
        let (min, max) = slice
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        let range = max - min;
        let pixel_data: Vec<u8> = slice
            .into_par_iter()
            .map(|&v| Self::normalize_to_u8(v, min, range))
            .collect();
        ImageBuffer::from_raw(width as u32, height as u32, pixel_data)
    }

    fn axis_len(&self, orientation: &Orientation) -> usize {
        let dim = self.data.dim();
        match orientation {
            Orientation::Axial => dim.0,
            Orientation::Coronal => dim.1,
            Orientation::Sagittal => dim.2,
        }
    }

    fn is_valid_index(&self, index: usize, orientation: &Orientation) -> bool {
        index < self.axis_len(orientation)
    }
}
