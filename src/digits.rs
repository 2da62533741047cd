use flate2::read::GzDecoder;
use itertools::Itertools;
use ndarray::{Array, Array1, Array2, ArrayView1, Axis, s};
use std::{
    fs::File,
    io::{BufRead, BufReader, Read},
    path::{Path, PathBuf},
};
use thiserror::Error;

pub const IMAGE_SIDE: usize = 16;
pub const FEATURES: usize = IMAGE_SIDE * IMAGE_SIDE;
pub const CLASSES: usize = 10;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}: no @data section found")]
    MissingData { path: PathBuf },
    #[error("{path}: no @attribute declarations found")]
    NoAttributes { path: PathBuf },
    #[error("{path}: expected {expected} feature attributes, found {actual}")]
    FeatureWidth {
        path: PathBuf,
        expected: usize,
        actual: usize,
    },
    #[error("{path}:{line}: expected {expected} values, found {actual}")]
    RecordWidth {
        path: PathBuf,
        line: usize,
        expected: usize,
        actual: usize,
    },
    #[error("{path}:{line}: `{value}` is not a finite number")]
    BadFeature {
        path: PathBuf,
        line: usize,
        value: String,
    },
    #[error("{path}:{line}: `{value}` is not a digit label in 0..={max}", max = CLASSES - 1)]
    BadLabel {
        path: PathBuf,
        line: usize,
        value: String,
    },
}

// A set of handwritten digits. Each row of `features` holds the raw pixel intensities of one 16x16
// image in row-major order, and the matching entry of `labels` is the digit it shows.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub features: Array2<f64>,
    pub labels: Vec<u8>,
}

impl Dataset {
    pub fn new(features: Array2<f64>, labels: Vec<u8>) -> Dataset {
        assert_eq!(features.nrows(), labels.len());
        Dataset { features, labels }
    }

    // Read an ARFF file whose last attribute is the class label and whose other attributes are all
    // numeric pixels. Files ending in ".gz" are decompressed on the fly.
    pub fn load(path: &Path, expected_width: usize) -> Result<Dataset, DatasetError> {
        let io_error = |source| DatasetError::Io {
            path: path.to_path_buf(),
            source,
        };

        let file = File::open(path).map_err(io_error)?;
        let gzipped = path
            .extension()
            .is_some_and(|extension| extension.eq_ignore_ascii_case("gz"));
        let reader: Box<dyn Read> = if gzipped {
            Box::new(GzDecoder::new(file))
        } else {
            Box::new(file)
        };

        Self::parse(BufReader::new(reader), path, expected_width)
    }

    fn parse<R: BufRead>(
        reader: R,
        path: &Path,
        expected_width: usize,
    ) -> Result<Dataset, DatasetError> {
        let mut attributes = 0;
        let mut in_data = false;
        let mut pixels = Vec::new();
        let mut labels = Vec::new();

        for (index, line) in reader.lines().enumerate() {
            let line = line.map_err(|source| DatasetError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let line_number = index + 1;
            let line = line.trim();
            if line.is_empty() || line.starts_with('%') {
                continue;
            }

            if !in_data {
                let keyword = line
                    .split_whitespace()
                    .next()
                    .unwrap_or_default()
                    .to_ascii_lowercase();
                match keyword.as_str() {
                    "@attribute" => attributes += 1,
                    "@data" => {
                        // The class attribute is the last one, everything before it is a pixel.
                        if attributes == 0 {
                            return Err(DatasetError::NoAttributes {
                                path: path.to_path_buf(),
                            });
                        }
                        if attributes - 1 != expected_width {
                            return Err(DatasetError::FeatureWidth {
                                path: path.to_path_buf(),
                                expected: expected_width,
                                actual: attributes - 1,
                            });
                        }
                        in_data = true;
                    }
                    _ => {}
                }
                continue;
            }

            let values = line.split(',').map(unquote).collect_vec();
            if values.len() != attributes {
                return Err(DatasetError::RecordWidth {
                    path: path.to_path_buf(),
                    line: line_number,
                    expected: attributes,
                    actual: values.len(),
                });
            }

            let (label, features) = values.split_last().expect("attributes is non-zero");
            for value in features {
                let pixel = value
                    .parse::<f64>()
                    .ok()
                    .filter(|pixel| pixel.is_finite())
                    .ok_or_else(|| DatasetError::BadFeature {
                        path: path.to_path_buf(),
                        line: line_number,
                        value: value.to_string(),
                    })?;
                pixels.push(pixel);
            }
            labels.push(parse_label(label).ok_or_else(|| DatasetError::BadLabel {
                path: path.to_path_buf(),
                line: line_number,
                value: label.to_string(),
            })?);
        }

        if !in_data {
            return Err(DatasetError::MissingData {
                path: path.to_path_buf(),
            });
        }

        let features = Array2::from_shape_vec((labels.len(), expected_width), pixels)
            .expect("every accepted record has exactly expected_width features");
        Ok(Dataset::new(features, labels))
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    // The first `limit` records, or all of them if there are fewer.
    pub fn prefix(&self, limit: usize) -> Dataset {
        let count = limit.min(self.len());
        Dataset {
            features: self.features.slice(s![..count, ..]).to_owned(),
            labels: self.labels[..count].to_vec(),
        }
    }

    pub fn image(&self, index: usize) -> ArrayView1<'_, f64> {
        self.features.row(index)
    }

    // Stack the bipolar target vector of every label into a [records x 10] matrix.
    pub fn targets(&self) -> Array2<f64> {
        let mut targets = Array2::zeros((self.len(), CLASSES));
        for (mut row, &label) in targets.axis_iter_mut(Axis(0)).zip(&self.labels) {
            row.assign(&target_vector(label));
        }
        targets
    }
}

// Turn a label into a [10] array where every value is -1.0 except for the value in the position
// corresponding to the label, whose value is 1.0.
pub fn target_vector(label: u8) -> Array1<f64> {
    assert!((label as usize) < CLASSES, "label {label} out of range");
    Array::from_shape_fn(CLASSES, |i| if i == label as usize { 1.0 } else { -1.0 })
}

fn unquote(value: &str) -> &str {
    let value = value.trim();
    value
        .strip_prefix('\'')
        .and_then(|v| v.strip_suffix('\''))
        .or_else(|| value.strip_prefix('"').and_then(|v| v.strip_suffix('"')))
        .unwrap_or(value)
}

// Labels are usually written as plain integers, but numeric exports sometimes write "3.0".
fn parse_label(value: &str) -> Option<u8> {
    let label = match value.parse::<u8>() {
        Ok(label) => label,
        Err(_) => {
            let float = value.parse::<f64>().ok()?;
            if float.fract() != 0.0 || !(0.0..=255.0).contains(&float) {
                return None;
            }
            float as u8
        }
    };
    ((label as usize) < CLASSES).then_some(label)
}
