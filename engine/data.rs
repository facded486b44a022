//! Reading labelled sparse data in svmlight format.
//!
//! Each non-empty line is `label index:value index:value ...`, optionally
//! followed by a `#` comment. Indices are 1-based unless the caller asks for
//! 0-based parsing. Tokens such as `qid:3` are ignored.

use crate::matrix::{ShapeError, SparseDesignMatrix};
use ndarray::Array1;
use std::fs::File;
use std::io::{BufRead, BufReader};
use thiserror::Error;

/// A design matrix together with one target per row.
#[derive(Debug, Clone)]
pub struct LabeledData {
    pub x: SparseDesignMatrix,
    pub y: Array1<f64>,
}

#[derive(Error, Debug)]
pub enum DataError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error(
        "The data uses feature index {index}, but only {n_features} features were requested."
    )]
    TooManyFeatures { index: usize, n_features: usize },
    #[error("The file contains no data rows.")]
    Empty,
    #[error("The parsed entries do not form a valid design matrix: {0}")]
    Shape(#[from] ShapeError),
}

fn parse_error(line: usize, message: impl Into<String>) -> DataError {
    DataError::Parse {
        line,
        message: message.into(),
    }
}

/// Parses svmlight text from any buffered reader.
///
/// `n_features` fixes the column count (needed when prediction data does not
/// use the highest training feature); otherwise it is one past the largest
/// index seen.
pub fn parse_svmlight<R: BufRead>(
    reader: R,
    n_features: Option<usize>,
    zero_based: bool,
) -> Result<LabeledData, DataError> {
    let mut labels = Vec::new();
    let mut triplets = Vec::new();
    let mut max_col = None;

    for (line_idx, line) in reader.lines().enumerate() {
        let line = line?;
        let line_no = line_idx + 1;
        let content = line.split('#').next().unwrap_or("").trim();
        if content.is_empty() {
            continue;
        }

        let mut tokens = content.split_whitespace();
        let label_token = tokens.next().unwrap_or("");
        let label: f64 = label_token
            .parse()
            .map_err(|_| parse_error(line_no, format!("invalid label '{label_token}'")))?;
        let row = labels.len();
        labels.push(label);

        for token in tokens {
            let (index, value) = token.split_once(':').ok_or_else(|| {
                parse_error(line_no, format!("expected 'index:value', found '{token}'"))
            })?;
            if index == "qid" {
                continue;
            }
            let index: usize = index
                .parse()
                .map_err(|_| parse_error(line_no, format!("invalid feature index '{index}'")))?;
            let value: f64 = value
                .parse()
                .map_err(|_| parse_error(line_no, format!("invalid feature value '{value}'")))?;
            let col = if zero_based {
                index
            } else {
                index.checked_sub(1).ok_or_else(|| {
                    parse_error(line_no, "feature index 0 in 1-based data (use zero-based parsing)")
                })?
            };
            if let Some(limit) = n_features {
                if col >= limit {
                    return Err(DataError::TooManyFeatures {
                        index,
                        n_features: limit,
                    });
                }
            }
            max_col = Some(max_col.map_or(col, |m: usize| m.max(col)));
            triplets.push((row, col, value));
        }
    }

    if labels.is_empty() {
        return Err(DataError::Empty);
    }
    let n_cols = n_features.unwrap_or_else(|| max_col.map_or(0, |m| m + 1));
    let x = SparseDesignMatrix::from_triplets(labels.len(), n_cols, triplets)?;
    log::info!(
        "Read {} rows with {} features ({} nonzeros).",
        x.rows(),
        x.cols(),
        x.nnz()
    );
    Ok(LabeledData {
        x,
        y: Array1::from_vec(labels),
    })
}

/// Reads an svmlight file from disk.
pub fn load_svmlight(
    path: &str,
    n_features: Option<usize>,
    zero_based: bool,
) -> Result<LabeledData, DataError> {
    let file = File::open(path)?;
    parse_svmlight(BufReader::new(file), n_features, zero_based)
}
