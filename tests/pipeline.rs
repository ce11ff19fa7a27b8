use dicom::core::{DataElement, PrimitiveValue, VR, dicom_value};
use dicom::dictionary_std::StandardDataDictionary;
use dicom::object::{FileDicomObject, FileMetaTableBuilder};
use dicom_dictionary_std::tags;
use dicom_nifti::{
    Convention, ConversionJob, ConvertConfig, ConvertError, Converter, DicomSliceReader,
    GeometryPolicy, GeometryWarning, NiftiWriter, Orientation, ReconstructError, SelectionError,
    SeriesLoaderError, SeriesSelector, SliceMetadataReader, SliceReadError, SliceRecord, Volume,
    VolumeWriter, WriteError,
};
use nalgebra::Matrix4;
use ndarray::{Array2, Ix3};
use nifti::{IntoNdArray, NiftiObject, ReaderOptions};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};
use tempfile::{TempDir, tempdir};

const AXIAL: [f64; 6] = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0];

/// Serves prepared records keyed by path.
#[derive(Default)]
struct MockReader(HashMap<PathBuf, SliceRecord>);

impl SliceMetadataReader for MockReader {
    fn read_slice(&self, path: &Path) -> Result<SliceRecord, SliceReadError> {
        self.0
            .get(path)
            .cloned()
            .ok_or_else(|| SliceReadError::PixelData(format!("no pixels in {}", path.display())))
    }
}

/// Keeps written volumes in memory.
#[derive(Default)]
struct RecordingWriter(Mutex<Vec<(PathBuf, Volume)>>);

impl VolumeWriter for RecordingWriter {
    fn write_volume(&self, volume: &Volume, path: &Path) -> Result<(), WriteError> {
        self.0
            .lock()
            .unwrap()
            .push((path.to_path_buf(), volume.clone()));
        Ok(())
    }
}

impl RecordingWriter {
    fn written(&self, path: &Path) -> Option<Volume> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, v)| v.clone())
    }

    fn count(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

/// 4x4 axial slice at z = 2 * k, voxel value row * 4 + column + 100 * k.
fn axial_slice(k: usize) -> SliceRecord {
    let pixels = Array2::from_shape_fn((4, 4), |(r, c)| (r * 4 + c + 100 * k) as f32);
    SliceRecord::new(pixels, [1.0, 1.0], [0.0, 0.0, 2.0 * k as f64], AXIAL)
        .with_instance_index(k as i32 + 1)
}

/// Creates one empty file per record in `root/name` and registers the
/// record under it. File names sort in reverse instance order.
fn add_series(
    root: &TempDir,
    name: &str,
    records: Vec<SliceRecord>,
    reader: &mut MockReader,
) -> PathBuf {
    let dir = root.path().join(name);
    fs::create_dir_all(&dir).unwrap();
    let count = records.len();
    for (k, record) in records.into_iter().enumerate() {
        let file = dir.join(format!("IM{:03}.dcm", count - k));
        fs::write(&file, b"").unwrap();
        reader.0.insert(file, record);
    }
    dir
}

#[test]
fn test_axial_series_end_to_end() {
    let root = tempdir().unwrap();
    let mut reader = MockReader::default();
    let input = add_series(&root, "series", (0..5).map(axial_slice).collect(), &mut reader);
    let output = root.path().join("out/scan.nii.gz");

    let converter = Converter::with_io(reader, RecordingWriter::default(), ConvertConfig::default());
    let report = converter
        .convert(&ConversionJob {
            series: "scan".into(),
            input,
            output: output.clone(),
        })
        .unwrap();

    assert_eq!(report.dim, (5, 4, 4));
    assert_eq!(report.pixdim, [1.0, 1.0, 1.0, 2.0]);
    assert!(report.warnings.is_empty());
    assert!(report.preview.is_none());

    let written = converter.writer().written(&output).unwrap();
    assert_eq!(written.convention, Convention::Ras);
    #[rustfmt::skip]
    let expected = Matrix4::new(
        1.0, 0.0, 0.0, -3.0,
        0.0, 1.0, 0.0, -3.0,
        0.0, 0.0, 2.0, 0.0,
        0.0, 0.0, 0.0, 1.0,
    );
    assert!((written.affine - expected).abs().max() < 1e-9);

    // both in-plane axes were reversed
    for ((k, r, c), &value) in written.data.indexed_iter() {
        assert_eq!(value, ((3 - r) * 4 + (3 - c) + 100 * k) as f32);
    }
}

#[test]
fn test_batch_isolates_failing_series() {
    let root = tempdir().unwrap();
    let mut reader = MockReader::default();

    let good_a = add_series(&root, "a", (0..3).map(axial_slice).collect(), &mut reader);
    let mut mismatched: Vec<SliceRecord> = (0..3).map(axial_slice).collect();
    mismatched[1].pixel_data = Array2::zeros((4, 5));
    let bad = add_series(&root, "b", mismatched, &mut reader);
    let good_c = add_series(&root, "c", (0..4).map(axial_slice).collect(), &mut reader);

    let out = root.path().join("out");
    let jobs: Vec<ConversionJob> = [("a", good_a), ("b", bad), ("c", good_c)]
        .into_iter()
        .map(|(name, input)| ConversionJob {
            series: name.to_string(),
            input,
            output: out.join(format!("{name}.nii")),
        })
        .collect();

    let converter = Converter::with_io(reader, RecordingWriter::default(), ConvertConfig::default());
    let results = converter.convert_batch(&jobs);

    assert_eq!(results.len(), 3);
    assert_eq!(results[0].as_ref().unwrap().dim, (3, 4, 4));
    match &results[1] {
        Err(e @ ConvertError::Reconstruct {
            source: ReconstructError::ShapeMismatch { index: 1, .. },
            ..
        }) => assert_eq!(e.series(), "b"),
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(results[2].as_ref().unwrap().dim, (4, 4, 4));
    assert!(converter.writer().written(&out.join("b.nii")).is_none());
}

#[test]
fn test_unreadable_slice_fails_series() {
    let root = tempdir().unwrap();
    let mut reader = MockReader::default();
    let input = add_series(&root, "series", (0..3).map(axial_slice).collect(), &mut reader);
    fs::write(input.join("IM999.dcm"), b"").unwrap();

    let converter = Converter::with_io(reader, RecordingWriter::default(), ConvertConfig::default());
    let result = converter.convert(&ConversionJob {
        series: "series".into(),
        input: input.clone(),
        output: root.path().join("series.nii"),
    });

    match result {
        Err(ConvertError::Load {
            source: SeriesLoaderError::UnreadableSource { path, .. },
            ..
        }) => assert_eq!(path, input.join("IM999.dcm")),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn test_strict_policy_rejects_skewed_stack() {
    let root = tempdir().unwrap();
    let mut reader = MockReader::default();
    let skewed: Vec<SliceRecord> = (0..4)
        .map(|k| {
            let mut slice = axial_slice(k);
            slice.position[0] = k as f64;
            slice
        })
        .collect();
    let input = add_series(&root, "skewed", skewed, &mut reader);
    let job = ConversionJob {
        series: "skewed".into(),
        input,
        output: root.path().join("skewed.nii"),
    };

    let lenient = Converter::with_io(
        MockReader(reader.0.clone()),
        RecordingWriter::default(),
        ConvertConfig::default(),
    );
    let report = lenient.convert(&job).unwrap();
    assert!(matches!(
        report.warnings.as_slice(),
        [GeometryWarning::NonOrthogonalVolume { .. }]
    ));

    let strict = Converter::with_io(
        reader,
        RecordingWriter::default(),
        ConvertConfig {
            policy: GeometryPolicy::Strict,
            ..ConvertConfig::default()
        },
    );
    assert!(matches!(
        strict.convert(&job),
        Err(ConvertError::Reconstruct {
            source: ReconstructError::NonOrthogonalVolume { .. },
            ..
        })
    ));
}

#[test]
fn test_selection_keeps_order_and_reports_unresolved() {
    let root = tempdir().unwrap();
    let mut reader = MockReader::default();
    add_series(
        &root,
        "data/P1/study-a/series-1",
        (0..3).map(axial_slice).collect(),
        &mut reader,
    );
    let out = root.path().join("out");
    let selectors: Vec<SeriesSelector> = ["P1_0", "P2_0", "P1_3", "P1_0"]
        .into_iter()
        .map(|s| s.parse().unwrap())
        .collect();

    let converter = Converter::with_io(reader, RecordingWriter::default(), ConvertConfig::default());
    let results = converter.convert_selection(&root.path().join("data"), &selectors, &out);

    // the repeated P1_0 is converted once
    assert_eq!(results.len(), 3);
    assert_eq!(converter.writer().count(), 1);

    let report = results[0].as_ref().unwrap();
    assert_eq!(report.series, "P1_0");
    assert_eq!(report.output, out.join("P1_0.nii.gz"));
    assert_eq!(report.dim, (3, 4, 4));

    match &results[1] {
        Err(ConvertError::Selection {
            series,
            source: SelectionError::PatientNotFound(_),
        }) => assert_eq!(series, "P2_0"),
        other => panic!("unexpected result: {other:?}"),
    }
    match &results[2] {
        Err(ConvertError::Selection {
            series,
            source:
                SelectionError::IndexOutOfRange {
                    index: 3,
                    available: 1,
                    ..
                },
        }) => assert_eq!(series, "P1_3"),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn test_preview_written_next_to_volume() {
    let root = tempdir().unwrap();
    let mut reader = MockReader::default();
    let input = add_series(&root, "series", (0..5).map(axial_slice).collect(), &mut reader);
    let output = root.path().join("out/scan.nii.gz");

    let converter = Converter::with_io(
        reader,
        RecordingWriter::default(),
        ConvertConfig {
            preview: Some(Orientation::Axial),
            ..ConvertConfig::default()
        },
    );
    let report = converter
        .convert(&ConversionJob {
            series: "scan".into(),
            input,
            output,
        })
        .unwrap();

    let preview = root.path().join("out/scan.png");
    assert_eq!(report.preview.as_deref(), Some(preview.as_path()));
    let image = image::open(&preview).unwrap().to_luma8();
    assert_eq!(image.dimensions(), (4, 4));
    // centre slice after both in-plane flips: brightest voxel first
    assert_eq!(image.get_pixel(0, 0).0[0], 255);
    assert_eq!(image.get_pixel(3, 3).0[0], 0);
}

#[test]
fn test_convert_explicit_paths() {
    let mut reader = MockReader::default();
    let paths: Vec<PathBuf> = [2, 0, 1]
        .into_iter()
        .map(|k| {
            let path = PathBuf::from(format!("listed/slice-{k}"));
            reader.0.insert(path.clone(), axial_slice(k));
            path
        })
        .collect();
    let output = PathBuf::from("listed.nii");

    let converter = Converter::with_io(reader, RecordingWriter::default(), ConvertConfig::default());
    let report = converter.convert_paths("listed", &paths, &output).unwrap();

    assert_eq!(report.series, "listed");
    assert_eq!(report.dim, (3, 4, 4));
    assert_eq!(report.pixdim, [1.0, 1.0, 1.0, 2.0]);

    let written = converter.writer().written(&output).unwrap();
    // slices are stacked by instance number, not by list order
    for k in 0..3 {
        assert_eq!(written.data[[k, 3, 3]], (100 * k) as f32);
    }
}

fn write_dicom_slice(path: &Path, k: usize) {
    let meta = FileMetaTableBuilder::new()
        .transfer_syntax("1.2.840.10008.1.2.1")
        .media_storage_sop_class_uid("1.2.840.10008.5.1.4.1.1.2")
        .media_storage_sop_instance_uid(format!("1.2.826.0.1.3680043.2.1125.{}", k + 1))
        .build()
        .unwrap();
    let mut obj = FileDicomObject::new_empty_with_dict_and_meta(StandardDataDictionary, meta);

    let pixels: Vec<u8> = (0..6u16)
        .map(|i| i + 10 * k as u16)
        .flat_map(u16::to_le_bytes)
        .collect();
    let z = format!("{}", -2.5 * k as f64);

    obj.put(DataElement::new(tags::SAMPLES_PER_PIXEL, VR::US, PrimitiveValue::from(1_u16)));
    obj.put(DataElement::new(
        tags::PHOTOMETRIC_INTERPRETATION,
        VR::CS,
        PrimitiveValue::from("MONOCHROME2"),
    ));
    obj.put(DataElement::new(tags::ROWS, VR::US, PrimitiveValue::from(2_u16)));
    obj.put(DataElement::new(tags::COLUMNS, VR::US, PrimitiveValue::from(3_u16)));
    obj.put(DataElement::new(tags::BITS_ALLOCATED, VR::US, PrimitiveValue::from(16_u16)));
    obj.put(DataElement::new(tags::BITS_STORED, VR::US, PrimitiveValue::from(16_u16)));
    obj.put(DataElement::new(tags::HIGH_BIT, VR::US, PrimitiveValue::from(15_u16)));
    obj.put(DataElement::new(
        tags::PIXEL_REPRESENTATION,
        VR::US,
        PrimitiveValue::from(0_u16),
    ));
    obj.put(DataElement::new(
        tags::INSTANCE_NUMBER,
        VR::IS,
        PrimitiveValue::from(format!("{}", k + 1)),
    ));
    obj.put(DataElement::new(
        tags::PIXEL_SPACING,
        VR::DS,
        dicom_value!(Strs, ["0.5", "0.75"]),
    ));
    obj.put(DataElement::new(
        tags::IMAGE_POSITION_PATIENT,
        VR::DS,
        dicom_value!(Strs, ["10", "20", z.as_str()]),
    ));
    obj.put(DataElement::new(
        tags::IMAGE_ORIENTATION_PATIENT,
        VR::DS,
        dicom_value!(Strs, ["1", "0", "0", "0", "1", "0"]),
    ));
    obj.put(DataElement::new(
        tags::RESCALE_INTERCEPT,
        VR::DS,
        PrimitiveValue::from("-100"),
    ));
    obj.put(DataElement::new(tags::PIXEL_DATA, VR::OW, PrimitiveValue::from(pixels)));

    obj.write_to_file(path).unwrap();
}

#[test]
fn test_dicom_files_to_nifti_file() {
    let root = tempdir().unwrap();
    let input = root.path().join("dicom");
    fs::create_dir_all(&input).unwrap();
    for k in 0..3 {
        write_dicom_slice(&input.join(format!("slice{}.dcm", 3 - k)), k);
    }
    let output = root.path().join("nifti/volume.nii.gz");

    let converter = Converter::with_io(DicomSliceReader, NiftiWriter, ConvertConfig::default());
    let report = converter
        .convert(&ConversionJob {
            series: "volume".into(),
            input,
            output: output.clone(),
        })
        .unwrap();
    assert_eq!(report.dim, (3, 2, 3));
    assert!(report.warnings.is_empty());

    let obj = ReaderOptions::new().read_file(&output).unwrap();
    let header = obj.header();
    assert_eq!(&header.dim[..4], &[3, 3, 2, 3]);
    // column spacing 0.75, row spacing 0.5, descending slices
    assert_eq!(header.pixdim[..4], [-1.0, 0.75, 0.5, 2.5]);
    assert_eq!(header.srow_x, [0.75, 0.0, 0.0, -11.5]);
    assert_eq!(header.srow_y, [0.0, 0.5, 0.0, -20.5]);
    assert_eq!(header.srow_z, [0.0, 0.0, -2.5, 0.0]);

    let data = obj
        .into_volume()
        .into_ndarray::<f32>()
        .unwrap()
        .into_dimensionality::<Ix3>()
        .unwrap();
    // (column, row, slice) with both in-plane axes reversed
    assert_eq!(data.dim(), (3, 2, 3));
    assert_eq!(data[[0, 0, 0]], 5.0 - 100.0);
    assert_eq!(data[[2, 1, 2]], 20.0 - 100.0);
}
