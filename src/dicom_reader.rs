use crate::slice::{SliceMetadataReader, SliceReadError, SliceRecord};

use dicom::{
    core::Tag,
    object::{FileDicomObject, InMemDicomObject, open_file},
    pixeldata::{ConvertOptions, ModalityLutOption, PixelDecoder, VoiLutOption},
};
use dicom_dictionary_std::tags;
use log::debug;
use ndarray::{Array2, s};
use std::path::Path;

/// Reads [`SliceRecord`]s from DICOM files.
///
/// Only the first frame of multi-frame objects is used. Stored values are
/// decoded without applying the modality LUT so that RescaleSlope and
/// RescaleIntercept stay on the record.
#[derive(Clone, Copy, Debug, Default)]
pub struct DicomSliceReader;

impl SliceMetadataReader for DicomSliceReader {
    fn read_slice(&self, path: &Path) -> Result<SliceRecord, SliceReadError> {
        let dicom_object = open_file(path)?;
        let pixel_data = Self::decode_image(&dicom_object)?;
        let record = slice_from_object(&dicom_object, pixel_data)?;
        debug!(
            "Read {} (instance {:?}, {}x{})",
            path.display(),
            record.instance_index,
            record.dim().0,
            record.dim().1
        );
        Ok(record)
    }
}

impl DicomSliceReader {
    fn decode_image(
        dicom_object: &FileDicomObject<InMemDicomObject>,
    ) -> Result<Array2<f32>, SliceReadError> {
        let pixel_data = dicom_object
            .decode_pixel_data()
            .map_err(|e| SliceReadError::PixelData(e.to_string()))?;
        let options = ConvertOptions::new()
            .with_modality_lut(ModalityLutOption::None)
            .with_voi_lut(VoiLutOption::Identity);
        pixel_data
            .to_ndarray_with_options::<f32>(&options)
            .map(|arr| arr.slice_move(s![0, .., .., 0]))
            .map_err(|e| SliceReadError::PixelData(e.to_string()))
    }
}

/// Builds a validated record from the geometry attributes of a DICOM data
/// set and its already decoded pixels.
pub fn slice_from_object(
    dicom_object: &InMemDicomObject,
    pixel_data: Array2<f32>,
) -> Result<SliceRecord, SliceReadError> {
    let pixel_spacing = multi_float::<2>(dicom_object, tags::PIXEL_SPACING, "PixelSpacing")?;
    let position = multi_float::<3>(
        dicom_object,
        tags::IMAGE_POSITION_PATIENT,
        "ImagePositionPatient",
    )?;
    let orientation = multi_float::<6>(
        dicom_object,
        tags::IMAGE_ORIENTATION_PATIENT,
        "ImageOrientationPatient",
    )?;

    let mut record = SliceRecord::new(pixel_data, pixel_spacing, position, orientation)
        .with_rescale(
            optional_float(dicom_object, tags::RESCALE_SLOPE).unwrap_or(1.0),
            optional_float(dicom_object, tags::RESCALE_INTERCEPT).unwrap_or(0.0),
        );
    record.instance_index = dicom_object
        .element(tags::INSTANCE_NUMBER)
        .ok()
        .and_then(|elem| elem.to_int::<i32>().ok());

    record.validate()?;
    Ok(record)
}

fn multi_float<const N: usize>(
    dicom_object: &InMemDicomObject,
    tag: Tag,
    name: &'static str,
) -> Result<[f64; N], SliceReadError> {
    let values = dicom_object
        .element(tag)
        .map_err(|_| SliceReadError::MissingAttribute(name))?
        .to_multi_float64()
        .map_err(|e| SliceReadError::InvalidAttribute {
            name,
            reason: e.to_string(),
        })?;

    values
        .try_into()
        .map_err(|values: Vec<f64>| SliceReadError::InvalidAttribute {
            name,
            reason: format!("expected {} values, found {}", N, values.len()),
        })
}

fn optional_float(dicom_object: &InMemDicomObject, tag: Tag) -> Option<f64> {
    dicom_object
        .element(tag)
        .ok()
        .and_then(|elem| elem.to_float64().ok())
}
