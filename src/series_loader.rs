use crate::slice::{SliceMetadataReader, SliceReadError, SliceRecord};

use log::{debug, info};
use rayon::prelude::*;
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SeriesLoaderError {
    #[error("No readable slices found")]
    EmptySeries,

    #[error("Unreadable slice {}: {source}", .path.display())]
    UnreadableSource {
        path: PathBuf,
        #[source]
        source: SliceReadError,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Suffix heuristics used to pick slice files out of a directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanConfig {
    /// Tried in order, the first suffix with any match wins. When none
    /// matches every regular file in the directory is taken.
    pub extensions: Vec<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            extensions: ["dcm", "DCM", "dc", "DC", "IMG"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// Slices of one acquisition, ordered by instance number.
///
/// Never empty.
#[derive(Clone, Debug)]
pub struct Series {
    slices: Vec<SliceRecord>,
}

impl Series {
    /// Orders `slices` by ascending [`SliceRecord::sort_key`], keeping the
    /// given order for equal keys.
    pub fn new(mut slices: Vec<SliceRecord>) -> Result<Self, SeriesLoaderError> {
        if slices.is_empty() {
            return Err(SeriesLoaderError::EmptySeries);
        }
        slices.sort_by_key(SliceRecord::sort_key);
        Ok(Self { slices })
    }

    pub fn slices(&self) -> &[SliceRecord] {
        &self.slices
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    /// True when at least one slice had no usable instance number.
    pub fn has_unknown_order(&self) -> bool {
        self.slices.iter().any(|slice| slice.instance_index.is_none())
    }
}

pub struct SeriesLoader;

impl SeriesLoader {
    /// Load a series from slice sources
    ///
    /// # Arguments
    ///
    /// * `paths` - Slice sources in discovery order
    /// * `reader` - Parser turning one source into a slice
    ///
    /// # Errors
    ///
    /// Fails on the first unreadable source or when `paths` is empty
    pub fn load_from_file_paths(
        paths: &[impl AsRef<Path> + Sync],
        reader: &impl SliceMetadataReader,
    ) -> Result<Series, SeriesLoaderError> {
        if paths.is_empty() {
            return Err(SeriesLoaderError::EmptySeries);
        }

        let slices = paths
            .par_iter()
            .map(|path| {
                let path = path.as_ref();
                reader
                    .read_slice(path)
                    .map_err(|source| SeriesLoaderError::UnreadableSource {
                        path: path.to_path_buf(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let series = Series::new(slices)?;
        if series.has_unknown_order() {
            debug!("Some slices lack an instance number, ordering is best effort");
        }
        Ok(series)
    }

    /// Load a series from a directory (or a single slice file)
    pub fn load_from_directory(
        path: impl AsRef<Path>,
        config: &ScanConfig,
        reader: &impl SliceMetadataReader,
    ) -> Result<Series, SeriesLoaderError> {
        let paths = find_slice_files(path.as_ref(), config)?;
        info!(
            "Found {} slice files in {}",
            paths.len(),
            path.as_ref().display()
        );
        Self::load_from_file_paths(&paths, reader)
    }
}

/// Lists the slice files at `path`, lexically sorted.
///
/// A directory is searched with the suffixes of `config`, a file is
/// returned as is.
pub fn find_slice_files(path: &Path, config: &ScanConfig) -> Result<Vec<PathBuf>, io::Error> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("Cannot open {}", path.display()),
        ));
    }

    let mut files: Vec<_> = fs::read_dir(path)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    files.sort();

    let matching = config.extensions.iter().find_map(|ext| {
        let hits: Vec<_> = files
            .iter()
            .filter(|path| path.extension().and_then(|s| s.to_str()) == Some(ext.as_str()))
            .cloned()
            .collect();
        (!hits.is_empty()).then_some(hits)
    });

    Ok(matching.unwrap_or(files))
}
