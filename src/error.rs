use std::path::PathBuf;
use thiserror::Error;

/// The main error type for labelpivot operations.
#[derive(Debug, Error)]
pub enum LabelpivotError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("annotation for '{}' carries {count} categories; converting requires exactly one", .filename.as_deref().unwrap_or("<no file>"))]
    MultipleCategories {
        filename: Option<String>,
        count: usize,
    },

    #[error("unknown category '{query}'; not present in the category table")]
    UnknownCategory { query: String },

    #[error("malformed annotation: {message}")]
    MalformedAnnotation { message: String },

    #[error("expected a {expected} annotation, got {actual}")]
    ShapeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("invalid YOLO context: {message}")]
    InvalidContext { message: String },

    #[error("Failed to parse CVAT XML from {path}: {message}")]
    CvatXmlParse { path: PathBuf, message: String },

    #[error("Failed to parse label file {path} line {line}: {message}")]
    YoloLabelParse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("Failed to parse YOLO dataset YAML from {path}: {source}")]
    YoloYamlParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Failed to serialize YOLO dataset YAML: {0}")]
    YoloYamlWrite(#[source] serde_yaml::Error),

    #[error("invalid YOLO dataset layout at {path}: {message}")]
    YoloLayoutInvalid { path: PathBuf, message: String },

    #[error("Failed to read image dimensions from {path}: {source}")]
    ImageDimensionRead {
        path: PathBuf,
        #[source]
        source: imagesize::ImageError,
    },

    #[error("Failed to parse Label Studio task JSON from {path}: {source}")]
    LabelStudioJsonParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to write Label Studio task JSON: {0}")]
    LabelStudioJsonWrite(#[source] serde_json::Error),

    #[error("annotation has no filename associated; cannot group by file")]
    MissingFilename,

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
}
