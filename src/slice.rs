use ndarray::Array2;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SliceReadError {
    #[error("Missing attribute: {0}")]
    MissingAttribute(&'static str),

    #[error("Invalid attribute {name}: {reason}")]
    InvalidAttribute { name: &'static str, reason: String },

    #[error("Pixel data error: {0}")]
    PixelData(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DICOM error: {0}")]
    Dicom(#[from] dicom::object::ReadError),
}

/// One acquired cross-section with the geometry needed to place it in
/// patient space.
#[derive(Clone, Debug, PartialEq)]
pub struct SliceRecord {
    /// Ordering hint (InstanceNumber), `None` when absent or unparseable
    pub instance_index: Option<i32>,
    /// Stored pixel values, (rows, columns)
    pub pixel_data: Array2<f32>,
    /// Physical spacing between rows and between columns
    pub pixel_spacing: [f64; 2],
    /// Position of the first transmitted voxel
    pub position: [f64; 3],
    /// Row direction cosines followed by column direction cosines
    pub orientation: [f64; 6],
    pub rescale_slope: f64,
    pub rescale_intercept: f64,
}

impl SliceRecord {
    pub fn new(
        pixel_data: Array2<f32>,
        pixel_spacing: [f64; 2],
        position: [f64; 3],
        orientation: [f64; 6],
    ) -> Self {
        Self {
            instance_index: None,
            pixel_data,
            pixel_spacing,
            position,
            orientation,
            rescale_slope: 1.0,
            rescale_intercept: 0.0,
        }
    }

    pub fn with_instance_index(mut self, index: i32) -> Self {
        self.instance_index = Some(index);
        self
    }

    pub fn with_rescale(mut self, slope: f64, intercept: f64) -> Self {
        self.rescale_slope = slope;
        self.rescale_intercept = intercept;
        self
    }

    /// Key used to order slices in a series. Unknown order sorts first.
    pub fn sort_key(&self) -> i64 {
        self.instance_index.map_or(-1, i64::from)
    }

    /// (rows, columns)
    pub fn dim(&self) -> (usize, usize) {
        self.pixel_data.dim()
    }

    /// Pixel values with the linear rescale applied.
    pub fn calibrated(&self) -> Array2<f32> {
        let (slope, intercept) = (self.rescale_slope, self.rescale_intercept);
        self.pixel_data
            .mapv(|v| (f64::from(v) * slope + intercept) as f32)
    }

    /// Rejects geometry that cannot describe a real slice plane.
    pub fn validate(&self) -> Result<(), SliceReadError> {
        let finite = |values: &[f64]| values.iter().all(|v| v.is_finite());

        if !finite(&self.pixel_spacing) || self.pixel_spacing.iter().any(|&s| s <= 0.0) {
            return Err(SliceReadError::InvalidAttribute {
                name: "PixelSpacing",
                reason: format!("{:?}", self.pixel_spacing),
            });
        }
        if !finite(&self.position) {
            return Err(SliceReadError::InvalidAttribute {
                name: "ImagePositionPatient",
                reason: format!("{:?}", self.position),
            });
        }
        let zero_length = |v: &[f64]| v.iter().map(|x| x * x).sum::<f64>() == 0.0;
        if !finite(&self.orientation)
            || zero_length(&self.orientation[0..3])
            || zero_length(&self.orientation[3..6])
        {
            return Err(SliceReadError::InvalidAttribute {
                name: "ImageOrientationPatient",
                reason: format!("{:?}", self.orientation),
            });
        }
        Ok(())
    }
}

/// Turns one slice source into a [`SliceRecord`].
///
/// The reconstruction code only ever sees records, so any file format
/// can be plugged in here.
pub trait SliceMetadataReader: Sync {
    fn read_slice(&self, path: &Path) -> Result<SliceRecord, SliceReadError>;
}
