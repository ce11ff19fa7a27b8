use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SelectionError {
    #[error("Malformed series selector '{0}', expected PATIENT_INDEX")]
    Malformed(String),

    #[error("Patient directory not found: {}", .0.display())]
    PatientNotFound(PathBuf),

    #[error("Study index {index} out of range, {patient} has {available} studies")]
    IndexOutOfRange {
        patient: String,
        index: usize,
        available: usize,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Picks one series under a dataset root as `PATIENT_INDEX`.
///
/// The series lives in `root/PATIENT/<INDEX-th study>/<first series>`,
/// with studies and series taken in lexical order.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SeriesSelector {
    pub patient_id: String,
    pub study_index: usize,
}

impl FromStr for SeriesSelector {
    type Err = SelectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || SelectionError::Malformed(s.to_string());
        // patient ids may contain underscores themselves
        let (patient_id, index) = s.trim().rsplit_once('_').ok_or_else(malformed)?;
        if patient_id.is_empty()
            || patient_id.contains(['/', '\\'])
            || patient_id == "."
            || patient_id == ".."
        {
            return Err(malformed());
        }
        let study_index = index.parse().map_err(|_| malformed())?;
        Ok(Self {
            patient_id: patient_id.to_string(),
            study_index,
        })
    }
}

impl fmt::Display for SeriesSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.patient_id, self.study_index)
    }
}

impl SeriesSelector {
    /// Directory (or file) holding the selected series.
    pub fn resolve(&self, root: &Path) -> Result<PathBuf, SelectionError> {
        let patient_dir = root.join(&self.patient_id);
        if !patient_dir.is_dir() {
            return Err(SelectionError::PatientNotFound(patient_dir));
        }

        let studies = sorted_entries(&patient_dir)?;
        let study = studies
            .get(self.study_index)
            .ok_or_else(|| SelectionError::IndexOutOfRange {
                patient: self.patient_id.clone(),
                index: self.study_index,
                available: studies.len(),
            })?;

        if !study.is_dir() {
            return Ok(study.clone());
        }
        let series = sorted_entries(study)?
            .into_iter()
            .find(|path| path.is_dir())
            .unwrap_or_else(|| study.clone());
        Ok(series)
    }

    pub fn output_file_name(&self) -> String {
        format!("{self}.nii.gz")
    }
}

fn sorted_entries(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut entries: Vec<_> = fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .collect();
    entries.sort();
    Ok(entries)
}
