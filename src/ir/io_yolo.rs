//! Ultralytics-style YOLO reader and writer.
//!
//! One label file per image, one annotation per line, all values normalized
//! to [0, 1]. A dataset-level YAML carries the category table, directory
//! names and train/val/test split paths. The line codecs are pure; the
//! filesystem layer at the bottom of this module pairs images with label
//! files and probes pixel dimensions.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use super::annotation::{
    BBoxShape, CoordinateStyle, ImageAnnotation, Point, PosePoint, PoseShape, SegmentationShape,
    Shape,
};
use super::categories::CategoryTable;
use crate::conversion::group_annotations_by_filename;
use crate::error::LabelpivotError;

/// File extensions recognized as images when pairing images with labels.
///
/// Fixed process-wide; probing an actual decoder registry at runtime is
/// deliberately avoided.
const IMAGE_EXTENSIONS: [&str; 7] = ["jpg", "jpeg", "png", "bmp", "webp", "tif", "tiff"];

const DEFAULT_LABEL_EXTENSION: &str = ".txt";

/// The YOLO annotation flavor a dataset holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnnotationKind {
    BBox,
    Segmentation,
    Pose,
}

impl AnnotationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnnotationKind::BBox => "bbox",
            AnnotationKind::Segmentation => "segmentation",
            AnnotationKind::Pose => "pose",
        }
    }

    /// Whether an IR shape belongs to this annotation flavor.
    pub fn matches(&self, shape: &Shape) -> bool {
        matches!(
            (self, shape),
            (AnnotationKind::BBox, Shape::BBox(_))
                | (AnnotationKind::Segmentation, Shape::Segmentation(_))
                | (AnnotationKind::Pose, Shape::Pose(_))
        )
    }

    /// The line decoder for this flavor.
    pub fn import_fn(&self) -> ImportFn {
        match self {
            AnnotationKind::BBox => import_bbox_line,
            AnnotationKind::Segmentation => import_segmentation_line,
            AnnotationKind::Pose => import_pose_line,
        }
    }

    /// The line encoder for this flavor.
    pub fn export_fn(&self) -> ExportFn {
        match self {
            AnnotationKind::BBox => export_bbox,
            AnnotationKind::Segmentation => export_segmentation,
            AnnotationKind::Pose => export_pose,
        }
    }
}

impl FromStr for AnnotationKind {
    type Err = LabelpivotError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "bbox" => Ok(AnnotationKind::BBox),
            "segmentation" => Ok(AnnotationKind::Segmentation),
            "pose" => Ok(AnnotationKind::Pose),
            other => Err(LabelpivotError::UnsupportedFormat(format!(
                "annotation type '{other}' (supported: bbox, segmentation, pose)"
            ))),
        }
    }
}

impl std::fmt::Display for AnnotationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decodes one label line into an IR annotation.
pub type ImportFn =
    fn(&str, &YoloContext, u32, u32) -> Result<ImageAnnotation, LabelpivotError>;

/// Encodes one IR annotation into a label line.
pub type ExportFn = fn(&ImageAnnotation, &YoloContext) -> Result<String, LabelpivotError>;

/// Everything shared across one YOLO import or export session.
#[derive(Clone, Debug)]
pub struct YoloContext {
    /// Type of annotations associated with this context.
    pub annotation_type: AnnotationKind,
    pub categories: CategoryTable,
    /// Name of the directory containing label files.
    pub label_dir_name: String,
    /// Name of the directory containing image files.
    pub image_dir_name: String,
    /// For pose annotations: 2 = x, y; 3 = x, y, visibility.
    pub keypoint_dim: u8,
    /// For pose annotations: number of keypoints in each annotation.
    pub keypoints_in_annotation: Option<usize>,
    /// Extension of the label files, dot included.
    pub label_extension: String,
    /// Base path to the data.
    pub path: Option<PathBuf>,
    /// Train split, relative to the base path.
    pub train_path: Option<PathBuf>,
    /// Validation split, relative to the base path.
    pub val_path: Option<PathBuf>,
    /// Test split, relative to the base path; may be discovered on export.
    pub test_path: Option<PathBuf>,
}

impl YoloContext {
    pub fn new(annotation_type: AnnotationKind) -> Self {
        Self {
            annotation_type,
            categories: CategoryTable::new(),
            label_dir_name: "labels".to_string(),
            image_dir_name: "images".to_string(),
            keypoint_dim: 3,
            keypoints_in_annotation: None,
            label_extension: DEFAULT_LABEL_EXTENSION.to_string(),
            path: None,
            train_path: Some(PathBuf::from(".")),
            val_path: Some(PathBuf::from(".")),
            test_path: None,
        }
    }

    /// Load a context from a dataset YAML file.
    pub fn from_yaml_file(
        path: &Path,
        annotation_type: AnnotationKind,
    ) -> Result<Self, LabelpivotError> {
        let data = fs::read_to_string(path).map_err(LabelpivotError::Io)?;
        Self::parse_yaml(&data, annotation_type, path)
    }

    /// Load a context from dataset YAML content.
    pub fn from_yaml_str(
        yaml: &str,
        annotation_type: AnnotationKind,
    ) -> Result<Self, LabelpivotError> {
        Self::parse_yaml(yaml, annotation_type, Path::new("<string>"))
    }

    fn parse_yaml(
        yaml: &str,
        annotation_type: AnnotationKind,
        path: &Path,
    ) -> Result<Self, LabelpivotError> {
        let parsed: DataYaml =
            serde_yaml::from_str(yaml).map_err(|source| LabelpivotError::YoloYamlParse {
                path: path.to_path_buf(),
                source,
            })?;

        let mut context = Self::new(annotation_type);

        context.categories = match parsed.names {
            DataYamlNames::Sequence(names) => {
                CategoryTable::from_pairs(names.into_iter().enumerate())
            }
            DataYamlNames::Mapping(mapping) => CategoryTable::from_pairs(mapping),
        };

        if let Some((count, dim)) = parsed.kpt_shape {
            context.keypoints_in_annotation = Some(count);
            context.keypoint_dim = dim;
        }

        if let Some(base) = parsed.path {
            context.path = Some(base);
        }
        if let Some(train) = parsed.train {
            context.train_path = Some(train);
        }
        if let Some(val) = parsed.val {
            context.val_path = Some(val);
        }
        if let Some(test) = parsed.test {
            context.test_path = Some(test);
        }

        Ok(context)
    }

    /// Serialize the dataset YAML (`path`, `names`, `nc`, splits, and
    /// `kpt_shape` for pose contexts).
    pub fn to_yaml_string(
        &self,
        path_override: Option<&Path>,
    ) -> Result<String, LabelpivotError> {
        let path = path_override
            .map(Path::to_path_buf)
            .or_else(|| self.path.clone())
            .ok_or_else(|| LabelpivotError::InvalidContext {
                message: "output path is not set; set it on the context or pass an override"
                    .to_string(),
            })?;

        let kpt_shape = if self.annotation_type == AnnotationKind::Pose {
            let count = self.keypoints_in_annotation.ok_or_else(|| {
                LabelpivotError::InvalidContext {
                    message: "keypoints_in_annotation must be set for pose export".to_string(),
                }
            })?;
            Some([count, usize::from(self.keypoint_dim)])
        } else {
            None
        };

        let out = DataYamlOut {
            path,
            names: self
                .categories
                .iter()
                .map(|category| (category.id, category.name.as_str()))
                .collect(),
            nc: self.categories.len(),
            train: self.train_path.clone(),
            val: self.val_path.clone(),
            test: self.test_path.clone(),
            kpt_shape,
        };

        serde_yaml::to_string(&out).map_err(LabelpivotError::YoloYamlWrite)
    }
}

#[derive(Debug, Deserialize)]
struct DataYaml {
    names: DataYamlNames,
    #[serde(default)]
    kpt_shape: Option<(usize, u8)>,
    #[serde(default)]
    path: Option<PathBuf>,
    #[serde(default)]
    train: Option<PathBuf>,
    #[serde(default)]
    val: Option<PathBuf>,
    #[serde(default)]
    test: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DataYamlNames {
    Sequence(Vec<String>),
    Mapping(BTreeMap<usize, String>),
}

#[derive(Debug, Serialize)]
struct DataYamlOut<'a> {
    path: PathBuf,
    names: BTreeMap<usize, &'a str>,
    nc: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    train: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    val: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    test: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kpt_shape: Option<[usize; 2]>,
}

// ============================================================================
// Line codecs
// ============================================================================

/// Build a bbox annotation from already-parsed normalized fields.
pub fn import_bbox(
    category_id: usize,
    center_x: f64,
    center_y: f64,
    width: f64,
    height: f64,
    context: &YoloContext,
    image_width: u32,
    image_height: u32,
) -> Result<ImageAnnotation, LabelpivotError> {
    let category = context.categories.require_by_id(category_id)?;
    Ok(ImageAnnotation::ground_truth(
        category.name.clone(),
        CoordinateStyle::Normalized,
        image_width,
        image_height,
        Shape::BBox(BBoxShape {
            top: center_y - height / 2.0,
            left: center_x - width / 2.0,
            width,
            height,
            rotation: 0.0,
        }),
    ))
}

/// Decode one `category cx cy w h` label line.
pub fn import_bbox_line(
    annotation: &str,
    context: &YoloContext,
    image_width: u32,
    image_height: u32,
) -> Result<ImageAnnotation, LabelpivotError> {
    let tokens = single_line_tokens(annotation)?;
    if tokens.len() != 5 {
        return Err(malformed(format!(
            "expected 5 fields for a bbox line, found {}",
            tokens.len()
        )));
    }

    import_bbox(
        parse_category_id(tokens[0])?,
        parse_field(tokens[1], "center_x")?,
        parse_field(tokens[2], "center_y")?,
        parse_field(tokens[3], "width")?,
        parse_field(tokens[4], "height")?,
        context,
        image_width,
        image_height,
    )
}

/// Build a segmentation annotation from already-parsed normalized points.
pub fn import_segmentation(
    category_id: usize,
    points: Vec<(f64, f64)>,
    context: &YoloContext,
    image_width: u32,
    image_height: u32,
) -> Result<ImageAnnotation, LabelpivotError> {
    let category = context.categories.require_by_id(category_id)?;
    Ok(ImageAnnotation::ground_truth(
        category.name.clone(),
        CoordinateStyle::Normalized,
        image_width,
        image_height,
        Shape::Segmentation(SegmentationShape {
            points: points.into_iter().map(|(x, y)| Point::new(x, y)).collect(),
        }),
    ))
}

/// Decode one `category x1 y1 x2 y2 ...` polygon label line.
pub fn import_segmentation_line(
    annotation: &str,
    context: &YoloContext,
    image_width: u32,
    image_height: u32,
) -> Result<ImageAnnotation, LabelpivotError> {
    let tokens = single_line_tokens(annotation)?;
    if tokens.is_empty() || (tokens.len() - 1) % 2 != 0 {
        return Err(malformed(format!(
            "expected a category followed by x/y pairs, found {} field(s)",
            tokens.len()
        )));
    }

    let category_id = parse_category_id(tokens[0])?;
    let mut points = Vec::with_capacity((tokens.len() - 1) / 2);
    for pair in tokens[1..].chunks_exact(2) {
        points.push((parse_field(pair[0], "x")?, parse_field(pair[1], "y")?));
    }

    import_segmentation(category_id, points, context, image_width, image_height)
}

/// Build a pose annotation from already-parsed normalized fields.
pub fn import_pose(
    category_id: usize,
    points: Vec<PosePoint>,
    center_x: f64,
    center_y: f64,
    width: f64,
    height: f64,
    context: &YoloContext,
    image_width: u32,
    image_height: u32,
) -> Result<ImageAnnotation, LabelpivotError> {
    let category = context.categories.require_by_id(category_id)?;
    Ok(ImageAnnotation::ground_truth(
        category.name.clone(),
        CoordinateStyle::Normalized,
        image_width,
        image_height,
        Shape::Pose(PoseShape {
            top: center_y - height / 2.0,
            left: center_x - width / 2.0,
            width,
            height,
            points,
        }),
    ))
}

/// Decode one `category cx cy w h [x y (vis)]*` pose label line.
///
/// The per-point group size follows `context.keypoint_dim`: 2 keeps
/// visibility unknown, 3 reads an explicit `0`/`1` flag.
pub fn import_pose_line(
    annotation: &str,
    context: &YoloContext,
    image_width: u32,
    image_height: u32,
) -> Result<ImageAnnotation, LabelpivotError> {
    let tokens = single_line_tokens(annotation)?;
    if tokens.len() < 5 {
        return Err(malformed(format!(
            "expected at least 5 fields for a pose line, found {}",
            tokens.len()
        )));
    }

    let group = match context.keypoint_dim {
        2 | 3 => usize::from(context.keypoint_dim),
        other => {
            return Err(malformed(format!(
                "unsupported keypoint dimensionality {other}; expected 2 or 3"
            )))
        }
    };

    let point_tokens = &tokens[5..];
    if point_tokens.len() % group != 0 {
        return Err(malformed(format!(
            "pose line has {} point field(s), not divisible by keypoint dim {group}",
            point_tokens.len()
        )));
    }

    let mut points = Vec::with_capacity(point_tokens.len() / group);
    for chunk in point_tokens.chunks_exact(group) {
        let x = parse_field(chunk[0], "x")?;
        let y = parse_field(chunk[1], "y")?;
        let visible = if group == 3 {
            Some(chunk[2] == "1")
        } else {
            None
        };
        points.push(PosePoint::with_visibility(x, y, visible));
    }

    import_pose(
        parse_category_id(tokens[0])?,
        points,
        parse_field(tokens[1], "center_x")?,
        parse_field(tokens[2], "center_y")?,
        parse_field(tokens[3], "width")?,
        parse_field(tokens[4], "height")?,
        context,
        image_width,
        image_height,
    )
}

/// Encode a bbox annotation as `category cx cy w h`.
///
/// Rotation is not representable in this format: a rotated box is exported
/// with its rotation truncated, and a warning is emitted.
pub fn export_bbox(
    annotation: &ImageAnnotation,
    context: &YoloContext,
) -> Result<String, LabelpivotError> {
    let annotation = annotation.normalized();
    let Shape::BBox(bbox) = &annotation.shape else {
        return Err(LabelpivotError::ShapeMismatch {
            expected: "bbox",
            actual: annotation.shape.kind(),
        });
    };

    if bbox.rotation != 0.0 {
        warn!(
            "Bounding box for file {} has a non-zero rotation; not representable in YOLO format",
            annotation.filename.as_deref().unwrap_or("<no file>")
        );
    }

    let category = annotation.ensure_single_category()?;
    let category_id = context.categories.require_by_name(category)?.id;

    let center_x = bbox.left + bbox.width / 2.0;
    let center_y = bbox.top + bbox.height / 2.0;

    Ok(format!(
        "{category_id} {center_x} {center_y} {} {}",
        bbox.width, bbox.height
    ))
}

/// Encode a segmentation annotation as `category x1 y1 x2 y2 ...`.
pub fn export_segmentation(
    annotation: &ImageAnnotation,
    context: &YoloContext,
) -> Result<String, LabelpivotError> {
    let annotation = annotation.normalized();
    let Shape::Segmentation(segmentation) = &annotation.shape else {
        return Err(LabelpivotError::ShapeMismatch {
            expected: "segmentation",
            actual: annotation.shape.kind(),
        });
    };

    let category = annotation.ensure_single_category()?;
    let category_id = context.categories.require_by_name(category)?.id;

    let mut line = category_id.to_string();
    for point in &segmentation.points {
        line.push_str(&format!(" {} {}", point.x, point.y));
    }
    Ok(line)
}

/// Encode a pose annotation as `category cx cy w h [x y (vis)]*`.
///
/// With 2-dim keypoints, explicitly invisible points are dropped (omission
/// is the only way to express invisibility). With 3-dim keypoints, unknown
/// visibility collapses to `1`.
pub fn export_pose(
    annotation: &ImageAnnotation,
    context: &YoloContext,
) -> Result<String, LabelpivotError> {
    let annotation = annotation.normalized();
    let Shape::Pose(pose) = &annotation.shape else {
        return Err(LabelpivotError::ShapeMismatch {
            expected: "pose",
            actual: annotation.shape.kind(),
        });
    };

    let point_fields: Vec<String> = match context.keypoint_dim {
        2 => pose
            .points
            .iter()
            .filter(|point| point.visible != Some(false))
            .map(|point| format!("{} {}", point.x, point.y))
            .collect(),
        3 => pose
            .points
            .iter()
            .map(|point| {
                let visibility = if point.visible == Some(false) { 0 } else { 1 };
                format!("{} {} {visibility}", point.x, point.y)
            })
            .collect(),
        other => {
            return Err(malformed(format!(
                "unsupported keypoint dimensionality {other}; expected 2 or 3"
            )))
        }
    };

    let category = annotation.ensure_single_category()?;
    let category_id = context.categories.require_by_name(category)?.id;

    let center_x = pose.left + pose.width / 2.0;
    let center_y = pose.top + pose.height / 2.0;

    let mut line = format!(
        "{category_id} {center_x} {center_y} {} {}",
        pose.width, pose.height
    );
    for field in point_fields {
        line.push(' ');
        line.push_str(&field);
    }
    Ok(line)
}

/// Serializes the annotations of one image into label-file content.
///
/// Annotations whose shape does not match `context.annotation_type` are
/// dropped with a warning. Returns `None` when nothing remains.
pub fn annotations_to_string(
    annotations: &[&ImageAnnotation],
    context: &YoloContext,
) -> Result<Option<String>, LabelpivotError> {
    let filtered: Vec<&ImageAnnotation> = annotations
        .iter()
        .copied()
        .filter(|ann| context.annotation_type.matches(&ann.shape))
        .collect();

    if filtered.len() != annotations.len() {
        warn!(
            "{} has {} annotation(s) of the wrong type that won't be exported",
            annotations
                .first()
                .and_then(|ann| ann.filename.as_deref())
                .unwrap_or("<no file>"),
            annotations.len() - filtered.len()
        );
    }

    if filtered.is_empty() {
        return Ok(None);
    }

    let export_fn = context.annotation_type.export_fn();
    let lines: Vec<String> = filtered
        .into_iter()
        .map(|ann| export_fn(ann, context))
        .collect::<Result<_, _>>()?;

    Ok(Some(lines.join("\n")))
}

fn single_line_tokens(annotation: &str) -> Result<Vec<&str>, LabelpivotError> {
    if annotation.trim_end().contains('\n') {
        return Err(malformed(
            "got multiple lines; pass one annotation at a time".to_string(),
        ));
    }
    Ok(annotation.split_whitespace().collect())
}

fn parse_category_id(raw: &str) -> Result<usize, LabelpivotError> {
    raw.parse::<usize>().map_err(|_| {
        malformed(format!(
            "invalid category id '{raw}'; expected a non-negative integer"
        ))
    })
}

fn parse_field(raw: &str, field_name: &str) -> Result<f64, LabelpivotError> {
    raw.parse::<f64>().map_err(|_| {
        malformed(format!(
            "invalid {field_name} '{raw}'; expected a floating-point number"
        ))
    })
}

fn malformed(message: String) -> LabelpivotError {
    LabelpivotError::MalformedAnnotation { message }
}

// ============================================================================
// Filesystem layer
// ============================================================================

/// Walk a YOLO dataset on disk and decode every label file.
///
/// Returns annotations keyed by the image path relative to the data
/// directory. Images without a label file are skipped with a warning.
pub fn load_yolo_from_fs_with_context(
    context: &YoloContext,
    import_dir: &Path,
) -> Result<BTreeMap<String, Vec<ImageAnnotation>>, LabelpivotError> {
    let base = context
        .path
        .as_ref()
        .ok_or_else(|| LabelpivotError::InvalidContext {
            message: "context path must be set to load a dataset from disk".to_string(),
        })?;

    let data_dir = if base.is_absolute() {
        base.clone()
    } else {
        import_dir.join(base)
    };

    let mut annotations = BTreeMap::new();

    for entry in WalkDir::new(&data_dir) {
        let entry = entry.map_err(|source| LabelpivotError::YoloLayoutInvalid {
            path: data_dir.clone(),
            message: format!("failed while traversing directory: {source}"),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let image_path = entry.path();
        let rel_path = image_path.strip_prefix(&data_dir).unwrap_or(image_path);

        if !path_has_component(rel_path, &context.image_dir_name) {
            debug!("{} is not under an image dir, skipping", rel_path.display());
            continue;
        }
        if !is_image(image_path) {
            debug!("Skipping {} because it's not an image", image_path.display());
            continue;
        }

        let Some(label_rel) = replace_folder(
            rel_path,
            &context.image_dir_name,
            &context.label_dir_name,
            Some(&context.label_extension),
        ) else {
            warn!(
                "Couldn't generate annotation file path for image file [{}]",
                image_path.display()
            );
            continue;
        };

        let label_path = data_dir.join(&label_rel);
        if !label_path.is_file() {
            warn!(
                "Couldn't find annotation file [{}] for image file [{}]",
                label_path.display(),
                image_path.display()
            );
            continue;
        }

        let rel_name = rel_string(rel_path);
        let parsed = parse_annotation_file(context, image_path, &label_path, &rel_name)?;
        annotations.insert(rel_name, parsed);
    }

    Ok(annotations)
}

/// Load a context from a dataset YAML, then the dataset it points at.
pub fn load_yolo_from_fs(
    annotation_type: AnnotationKind,
    meta_file: &Path,
) -> Result<(BTreeMap<String, Vec<ImageAnnotation>>, YoloContext), LabelpivotError> {
    let context = YoloContext::from_yaml_file(meta_file, annotation_type)?;
    let import_dir = meta_file.parent().unwrap_or(Path::new("."));
    let annotations = load_yolo_from_fs_with_context(&context, import_dir)?;
    Ok((annotations, context))
}

fn parse_annotation_file(
    context: &YoloContext,
    image_path: &Path,
    label_path: &Path,
    rel_name: &str,
) -> Result<Vec<ImageAnnotation>, LabelpivotError> {
    let (width, height) = read_image_dimensions(image_path)?;
    let content = fs::read_to_string(label_path).map_err(LabelpivotError::Io)?;

    let import_fn = context.annotation_type.import_fn();
    let mut annotations = Vec::new();

    for (line_idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let annotation = import_fn(line, context, width, height).map_err(|err| match err {
            LabelpivotError::MalformedAnnotation { message } => LabelpivotError::YoloLabelParse {
                path: label_path.to_path_buf(),
                line: line_idx + 1,
                message,
            },
            other => other,
        })?;
        annotations.push(annotation.with_filename(rel_name));
    }

    Ok(annotations)
}

/// Write annotations as a YOLO dataset: label files under the context path
/// plus the dataset YAML.
///
/// Train/val/test split paths are inferred from the exported image paths
/// when an unambiguous `train`/`val`/`test` folder exists. Returns the path
/// of the written YAML file.
pub fn export_to_fs(
    context: &mut YoloContext,
    annotations: &[ImageAnnotation],
    export_dir: &Path,
    meta_file: &str,
) -> Result<PathBuf, LabelpivotError> {
    if context.path.is_none() {
        info!("YoloContext path was not set; exporting to 'data'");
        context.path = Some(PathBuf::from("data"));
    }
    let base = context.path.clone().unwrap_or_default();

    let grouped = group_annotations_by_filename(annotations)?;

    for (filename, anns) in &grouped {
        let Some(label_rel) = replace_folder(
            Path::new(filename),
            &context.image_dir_name,
            &context.label_dir_name,
            Some(&context.label_extension),
        ) else {
            warn!("Couldn't generate annotation file path for image file [{filename}]");
            continue;
        };

        let label_path = export_dir.join(&base).join(label_rel);
        if let Some(parent) = label_path.parent() {
            fs::create_dir_all(parent).map_err(LabelpivotError::Io)?;
        }

        if let Some(content) = annotations_to_string(anns, context)? {
            fs::write(&label_path, content).map_err(LabelpivotError::Io)?;
        }
    }

    let image_paths: Vec<&str> = grouped.keys().map(String::as_str).collect();
    let (train, val, test) = guess_train_val_test_split(&image_paths);

    // A missing split folder means YOLO trains on the whole dataset; keep
    // the context defaults instead of overwriting them with nothing.
    if train.is_some() {
        context.train_path = train;
    }
    if val.is_some() {
        context.val_path = val;
    }
    context.test_path = test;

    let yaml_path = export_dir.join(meta_file);
    fs::write(&yaml_path, context.to_yaml_string(None)?).map_err(LabelpivotError::Io)?;

    info!(
        "Saved annotations to {} and dataset YAML to {}",
        export_dir.join(&base).display(),
        yaml_path.display()
    );

    Ok(yaml_path)
}

fn read_image_dimensions(path: &Path) -> Result<(u32, u32), LabelpivotError> {
    let size = imagesize::size(path).map_err(|source| LabelpivotError::ImageDimensionRead {
        path: path.to_path_buf(),
        source,
    })?;

    let width: u32 = size
        .width
        .try_into()
        .map_err(|_| LabelpivotError::YoloLayoutInvalid {
            path: path.to_path_buf(),
            message: format!("image width {} does not fit in u32", size.width),
        })?;
    let height: u32 = size
        .height
        .try_into()
        .map_err(|_| LabelpivotError::YoloLayoutInvalid {
            path: path.to_path_buf(),
            message: format!("image height {} does not fit in u32", size.height),
        })?;

    Ok((width, height))
}

// ============================================================================
// Path helpers
// ============================================================================

fn is_image(path: &Path) -> bool {
    let Some(ext) = path.extension().and_then(|ext| ext.to_str()) else {
        return false;
    };
    IMAGE_EXTENSIONS
        .iter()
        .any(|allowed| ext.eq_ignore_ascii_case(allowed))
}

fn path_has_component(path: &Path, dir_name: &str) -> bool {
    path.components()
        .any(|component| matches!(component, Component::Normal(part) if part.to_str() == Some(dir_name)))
}

/// Swaps the last occurrence of `to_replace` in the path with
/// `replace_with`, optionally swapping the file extension too.
///
/// Returns `None` when an extension swap is requested but the file has no
/// extension.
fn replace_folder(
    path: &Path,
    to_replace: &str,
    replace_with: &str,
    replace_extension_with: Option<&str>,
) -> Option<PathBuf> {
    let mut parts: Vec<String> = path
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect();

    if let Some(index) = parts.iter().rposition(|part| part == to_replace) {
        parts[index] = replace_with.to_string();
    }

    if let Some(new_extension) = replace_extension_with {
        let file_name = parts.last_mut()?;
        let dot = file_name.rfind('.')?;
        file_name.truncate(dot);
        file_name.push_str(new_extension);
    }

    Some(parts.iter().collect())
}

fn rel_string(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Finds the common folder prefix ending at `part` shared by the paths.
///
/// Multiple equally-short distinct candidates mean the answer is ambiguous
/// and `None` is returned rather than guessed.
fn common_folder_with_part(paths: &[&Path], part: &str) -> Option<PathBuf> {
    let mut candidates: BTreeSet<PathBuf> = BTreeSet::new();

    for path in paths {
        let mut prefix = PathBuf::new();
        for component in path.components() {
            prefix.push(component);
            if matches!(component, Component::Normal(p) if p.to_str() == Some(part)) {
                candidates.insert(prefix.clone());
            }
        }
    }

    if candidates.is_empty() {
        return None;
    }
    if candidates.len() == 1 {
        return candidates.into_iter().next();
    }

    let shortest_len = candidates
        .iter()
        .map(|candidate| candidate.components().count())
        .min()?;
    let mut shortest: Vec<PathBuf> = candidates
        .into_iter()
        .filter(|candidate| candidate.components().count() == shortest_len)
        .collect();

    if shortest.len() == 1 {
        shortest.pop()
    } else {
        None
    }
}

/// Guess `(train, val, test)` split folders from exported image paths.
pub fn guess_train_val_test_split(
    image_paths: &[&str],
) -> (Option<PathBuf>, Option<PathBuf>, Option<PathBuf>) {
    let paths: Vec<&Path> = image_paths.iter().map(Path::new).collect();
    (
        common_folder_with_part(&paths, "train"),
        common_folder_with_part(&paths, "val"),
        common_folder_with_part(&paths, "test"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context_with_categories(kind: AnnotationKind, names: &[&str]) -> YoloContext {
        let mut context = YoloContext::new(kind);
        for name in names {
            context.categories.get_or_create(name);
        }
        context
    }

    #[test]
    fn import_bbox_line_computes_top_left() {
        let context = context_with_categories(AnnotationKind::BBox, &["cat", "dog", "bird"]);
        let ann = import_bbox_line("2 0.5 0.25 0.3 0.1", &context, 100, 100).expect("import");

        assert_eq!(ann.coordinate_style, CoordinateStyle::Normalized);
        assert_eq!(ann.categories.get("bird"), Some(&1.0));

        let Shape::BBox(bbox) = &ann.shape else {
            panic!("expected bbox");
        };
        assert!((bbox.left - 0.35).abs() < 1e-12);
        assert!((bbox.top - 0.2).abs() < 1e-12);
        assert_eq!(bbox.width, 0.3);
        assert_eq!(bbox.height, 0.1);
    }

    #[test]
    fn import_rejects_multiple_lines() {
        let context = context_with_categories(AnnotationKind::BBox, &["cat"]);
        let err = import_bbox_line("0 0.5 0.5 0.1 0.1\n0 0.2 0.2 0.1 0.1", &context, 10, 10)
            .unwrap_err();
        assert!(matches!(err, LabelpivotError::MalformedAnnotation { .. }));
    }

    #[test]
    fn import_rejects_wrong_field_count() {
        let context = context_with_categories(AnnotationKind::BBox, &["cat"]);
        let err = import_bbox_line("0 0.5 0.5 0.1", &context, 10, 10).unwrap_err();
        assert!(matches!(err, LabelpivotError::MalformedAnnotation { .. }));
    }

    #[test]
    fn import_rejects_unknown_category() {
        let context = context_with_categories(AnnotationKind::BBox, &["cat"]);
        let err = import_bbox_line("3 0.5 0.5 0.1 0.1", &context, 10, 10).unwrap_err();
        assert!(matches!(err, LabelpivotError::UnknownCategory { .. }));
    }

    #[test]
    fn bbox_line_roundtrip_is_exact() {
        let context = context_with_categories(AnnotationKind::BBox, &["cat"]);
        let ann = import_bbox_line("0 0.5 0.5 0.2 0.3", &context, 640, 480).expect("import");
        let line = export_bbox(&ann, &context).expect("export");
        assert_eq!(line, "0 0.5 0.5 0.2 0.3");
    }

    #[test]
    fn export_bbox_denormalizes_first() {
        let context = context_with_categories(AnnotationKind::BBox, &["cat"]);
        let ann = ImageAnnotation::ground_truth(
            "cat",
            CoordinateStyle::Denormalized,
            200,
            100,
            Shape::BBox(BBoxShape {
                top: 25.0,
                left: 50.0,
                width: 100.0,
                height: 50.0,
                rotation: 0.0,
            }),
        );
        let line = export_bbox(&ann, &context).expect("export");
        assert_eq!(line, "0 0.5 0.5 0.5 0.5");
    }

    #[test]
    fn export_bbox_rejects_wrong_shape() {
        let context = context_with_categories(AnnotationKind::BBox, &["cat"]);
        let ann = ImageAnnotation::ground_truth(
            "cat",
            CoordinateStyle::Normalized,
            10,
            10,
            Shape::pose_from_points(vec![PosePoint::new(0.1, 0.1)]),
        );
        let err = export_bbox(&ann, &context).unwrap_err();
        assert!(matches!(err, LabelpivotError::ShapeMismatch { .. }));
    }

    #[test]
    fn segmentation_line_preserves_point_order() {
        let context = context_with_categories(AnnotationKind::Segmentation, &["roof"]);
        let ann = import_segmentation_line("0 0.1 0.2 0.5 0.6 0.3 0.4", &context, 10, 10)
            .expect("import");

        let Shape::Segmentation(seg) = &ann.shape else {
            panic!("expected segmentation");
        };
        let coords: Vec<_> = seg.points.iter().map(|p| (p.x, p.y)).collect();
        assert_eq!(coords, vec![(0.1, 0.2), (0.5, 0.6), (0.3, 0.4)]);

        let line = export_segmentation(&ann, &context).expect("export");
        assert_eq!(line, "0 0.1 0.2 0.5 0.6 0.3 0.4");
    }

    #[test]
    fn pose_line_3dim_reads_visibility() {
        let mut context = context_with_categories(AnnotationKind::Pose, &["person"]);
        context.keypoint_dim = 3;

        let ann = import_pose_line("0 0.5 0.5 0.4 0.4 0.3 0.3 1 0.7 0.7 0", &context, 10, 10)
            .expect("import");
        let Shape::Pose(pose) = &ann.shape else {
            panic!("expected pose");
        };
        assert_eq!(pose.points.len(), 2);
        assert_eq!(pose.points[0].visible, Some(true));
        assert_eq!(pose.points[1].visible, Some(false));
        assert!((pose.left - 0.3).abs() < 1e-12);
        assert!((pose.top - 0.3).abs() < 1e-12);
    }

    #[test]
    fn pose_line_2dim_leaves_visibility_unknown() {
        let mut context = context_with_categories(AnnotationKind::Pose, &["person"]);
        context.keypoint_dim = 2;

        let ann =
            import_pose_line("0 0.5 0.5 0.4 0.4 0.3 0.3 0.7 0.7", &context, 10, 10).expect("import");
        let Shape::Pose(pose) = &ann.shape else {
            panic!("expected pose");
        };
        assert_eq!(pose.points.len(), 2);
        assert_eq!(pose.points[0].visible, None);
    }

    #[test]
    fn pose_line_rejects_bad_group_size() {
        let mut context = context_with_categories(AnnotationKind::Pose, &["person"]);
        context.keypoint_dim = 3;
        let err = import_pose_line("0 0.5 0.5 0.4 0.4 0.3 0.3", &context, 10, 10).unwrap_err();
        assert!(matches!(err, LabelpivotError::MalformedAnnotation { .. }));
    }

    #[test]
    fn export_pose_2dim_drops_invisible_points() {
        let mut context = context_with_categories(AnnotationKind::Pose, &["person"]);
        context.keypoint_dim = 2;

        let ann = ImageAnnotation::ground_truth(
            "person",
            CoordinateStyle::Normalized,
            10,
            10,
            Shape::Pose(PoseShape {
                top: 0.0,
                left: 0.0,
                width: 1.0,
                height: 1.0,
                points: vec![
                    PosePoint::with_visibility(0.1, 0.1, Some(true)),
                    PosePoint::with_visibility(0.2, 0.2, Some(false)),
                    PosePoint::with_visibility(0.3, 0.3, None),
                ],
            }),
        );

        let line = export_pose(&ann, &context).expect("export");
        assert_eq!(line, "0 0.5 0.5 1 1 0.1 0.1 0.3 0.3");
    }

    #[test]
    fn export_pose_3dim_collapses_unknown_to_visible() {
        let mut context = context_with_categories(AnnotationKind::Pose, &["person"]);
        context.keypoint_dim = 3;

        let ann = ImageAnnotation::ground_truth(
            "person",
            CoordinateStyle::Normalized,
            10,
            10,
            Shape::Pose(PoseShape {
                top: 0.0,
                left: 0.0,
                width: 1.0,
                height: 1.0,
                points: vec![
                    PosePoint::with_visibility(0.1, 0.1, Some(false)),
                    PosePoint::with_visibility(0.3, 0.3, None),
                ],
            }),
        );

        let line = export_pose(&ann, &context).expect("export");
        assert_eq!(line, "0 0.5 0.5 1 1 0.1 0.1 0 0.3 0.3 1");
    }

    #[test]
    fn export_rejects_multi_category_annotation() {
        let context = context_with_categories(AnnotationKind::BBox, &["cat", "dog"]);
        let mut ann = ImageAnnotation::ground_truth(
            "cat",
            CoordinateStyle::Normalized,
            10,
            10,
            Shape::BBox(BBoxShape {
                top: 0.0,
                left: 0.0,
                width: 0.5,
                height: 0.5,
                rotation: 0.0,
            }),
        );
        ann.categories.insert("dog".to_string(), 0.4);

        let err = export_bbox(&ann, &context).unwrap_err();
        assert!(matches!(err, LabelpivotError::MultipleCategories { .. }));
    }

    #[test]
    fn annotations_to_string_filters_wrong_kind() {
        let context = context_with_categories(AnnotationKind::BBox, &["cat"]);
        let bbox = ImageAnnotation::ground_truth(
            "cat",
            CoordinateStyle::Normalized,
            10,
            10,
            Shape::BBox(BBoxShape {
                top: 0.25,
                left: 0.25,
                width: 0.5,
                height: 0.5,
                rotation: 0.0,
            }),
        );
        let pose = ImageAnnotation::ground_truth(
            "cat",
            CoordinateStyle::Normalized,
            10,
            10,
            Shape::pose_from_points(vec![PosePoint::new(0.5, 0.5)]),
        );

        let content = annotations_to_string(&[&bbox, &pose], &context)
            .expect("serialize")
            .expect("content");
        assert_eq!(content, "0 0.5 0.5 0.5 0.5");

        let none = annotations_to_string(&[&pose], &context).expect("serialize");
        assert!(none.is_none());
    }

    #[test]
    fn yaml_context_parses_names_and_kpt_shape() {
        let yaml = "path: data\nnames:\n  0: person\n  1: bicycle\nkpt_shape: [17, 3]\ntrain: train/images\nval: val/images\n";
        let context = YoloContext::from_yaml_str(yaml, AnnotationKind::Pose).expect("parse");

        assert_eq!(context.categories.len(), 2);
        assert_eq!(
            context.categories.get_by_id(1).map(|c| c.name.as_str()),
            Some("bicycle")
        );
        assert_eq!(context.keypoints_in_annotation, Some(17));
        assert_eq!(context.keypoint_dim, 3);
        assert_eq!(context.train_path, Some(PathBuf::from("train/images")));
        assert_eq!(context.val_path, Some(PathBuf::from("val/images")));
        assert_eq!(context.test_path, None);
    }

    #[test]
    fn yaml_context_accepts_sequence_names() {
        let yaml = "names:\n  - cat\n  - dog\n";
        let context = YoloContext::from_yaml_str(yaml, AnnotationKind::BBox).expect("parse");
        assert_eq!(
            context.categories.get_by_id(0).map(|c| c.name.as_str()),
            Some("cat")
        );
        assert_eq!(
            context.categories.get_by_id(1).map(|c| c.name.as_str()),
            Some("dog")
        );
    }

    #[test]
    fn yaml_output_requires_path() {
        let context = context_with_categories(AnnotationKind::BBox, &["cat"]);
        assert!(matches!(
            context.to_yaml_string(None),
            Err(LabelpivotError::InvalidContext { .. })
        ));
    }

    #[test]
    fn yaml_output_roundtrips_through_parse() {
        let mut context = context_with_categories(AnnotationKind::Pose, &["person"]);
        context.path = Some(PathBuf::from("data"));
        context.keypoints_in_annotation = Some(5);
        context.keypoint_dim = 2;
        context.train_path = Some(PathBuf::from("train"));
        context.test_path = Some(PathBuf::from("test"));

        let yaml = context.to_yaml_string(None).expect("serialize");
        assert!(yaml.contains("nc: 1"));

        let parsed = YoloContext::from_yaml_str(&yaml, AnnotationKind::Pose).expect("parse");
        assert_eq!(parsed.categories.len(), 1);
        assert_eq!(parsed.keypoints_in_annotation, Some(5));
        assert_eq!(parsed.keypoint_dim, 2);
        assert_eq!(parsed.path, Some(PathBuf::from("data")));
        assert_eq!(parsed.test_path, Some(PathBuf::from("test")));
    }

    #[test]
    fn yaml_output_without_keypoint_count_fails_for_pose() {
        let mut context = context_with_categories(AnnotationKind::Pose, &["person"]);
        context.path = Some(PathBuf::from("data"));
        assert!(matches!(
            context.to_yaml_string(None),
            Err(LabelpivotError::InvalidContext { .. })
        ));
    }

    #[test]
    fn replace_folder_swaps_last_occurrence() {
        let replaced = replace_folder(
            Path::new("images/nested/images/a.jpg"),
            "images",
            "labels",
            Some(".txt"),
        )
        .expect("replaceable");
        assert_eq!(replaced, PathBuf::from("images/nested/labels/a.txt"));
    }

    #[test]
    fn replace_folder_requires_an_extension() {
        assert!(replace_folder(Path::new("images/a"), "images", "labels", Some(".txt")).is_none());
    }

    #[test]
    fn split_guessing_finds_unique_folders() {
        let (train, val, test) = guess_train_val_test_split(&[
            "data/train/images/a.jpg",
            "data/train/images/b.jpg",
            "data/val/images/c.jpg",
        ]);
        assert_eq!(train, Some(PathBuf::from("data/train")));
        assert_eq!(val, Some(PathBuf::from("data/val")));
        assert_eq!(test, None);
    }

    #[test]
    fn split_guessing_leaves_ambiguous_candidates_unset() {
        let (train, _, _) =
            guess_train_val_test_split(&["a/train/x.jpg", "b/train/y.jpg"]);
        assert_eq!(train, None);
    }

    #[test]
    fn split_guessing_prefers_the_shortest_candidate() {
        let (train, _, _) = guess_train_val_test_split(&[
            "data/train/images/a.jpg",
            "data/train/extra/train/b.jpg",
        ]);
        assert_eq!(train, Some(PathBuf::from("data/train")));
    }
}
