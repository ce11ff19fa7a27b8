#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Orientation {
    Axial,
    Coronal,
    Sagittal,
}

/// Anatomical convention a [`Volume`](crate::volume::Volume) affine is
/// expressed in.
///
/// DICOM patient coordinates are LPS (x grows towards the patient's left,
/// y towards the back), NIfTI uses RAS (x grows to the right, y to the
/// front). The two differ by the sign of the first two physical axes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Convention {
    #[default]
    Lps,
    Ras,
}

impl Convention {
    pub fn opposite(self) -> Self {
        match self {
            Convention::Lps => Convention::Ras,
            Convention::Ras => Convention::Lps,
        }
    }
}

/// What to do when the slice geometry is inconsistent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GeometryPolicy {
    /// Warn and keep the best-effort reconstruction.
    #[default]
    BestEffort,
    /// Abort the series on any geometry warning.
    Strict,
}
