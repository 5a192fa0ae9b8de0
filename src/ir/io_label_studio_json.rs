//! Label Studio task JSON reader and writer.
//!
//! A task holds annotation containers whose result records carry
//! percentage-scale (0-100) coordinates. Rectangle, polygon and ellipse
//! records map 1:1 to IR shapes. Poses have no native record type: one IR
//! pose decomposes into a rectangle record plus one keypoint record per
//! point, linked only through a side table on the task's `data` object and
//! reassembled from it on import.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use log::{debug, warn};
use rand::RngExt;
use serde::{Deserialize, Serialize};

use super::annotation::{
    BBoxShape, CoordinateStyle, EllipseShape, ImageAnnotation, Point, PosePoint,
    SegmentationShape, Shape,
};
use crate::error::LabelpivotError;

// ============================================================================
// Task schema
// ============================================================================

/// Common fields shared by every result record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecordMeta {
    pub original_width: u32,
    pub original_height: u32,
    #[serde(default)]
    pub image_rotation: f64,
    /// Opaque correlation id; the only cross-record link that survives a
    /// serialize/deserialize round trip.
    #[serde(default = "new_record_id")]
    pub id: String,
    #[serde(default = "default_origin")]
    pub origin: String,
    #[serde(default = "default_to_name")]
    pub to_name: String,
    #[serde(default = "default_from_name")]
    pub from_name: String,
    /// For predictions, the score of the prediction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

impl RecordMeta {
    fn new(original_width: u32, original_height: u32) -> Self {
        Self {
            original_width,
            original_height,
            image_rotation: 0.0,
            id: new_record_id(),
            origin: default_origin(),
            to_name: default_to_name(),
            from_name: default_from_name(),
            score: None,
        }
    }
}

fn new_record_id() -> String {
    let bits = rand::rng().random::<u64>() & ((1u64 << 40) - 1);
    format!("{bits:010x}")
}

fn new_task_id() -> u64 {
    rand::rng().random_range(0..(1u64 << 63))
}

fn default_origin() -> String {
    "manual".to_string()
}

fn default_to_name() -> String {
    "image".to_string()
}

fn default_from_name() -> String {
    "label".to_string()
}

fn default_true() -> bool {
    true
}

fn default_keypoint_width() -> f64 {
    1.0
}

fn default_user_id() -> i64 {
    1
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RectangleValue {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    #[serde(default)]
    pub rotation: f64,
    pub rectanglelabels: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolygonValue {
    pub points: Vec<[f64; 2]>,
    pub polygonlabels: Vec<String>,
    #[serde(default = "default_true")]
    pub closed: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EllipseValue {
    pub x: f64,
    pub y: f64,
    #[serde(rename = "radiusX")]
    pub radius_x: f64,
    #[serde(rename = "radiusY")]
    pub radius_y: f64,
    #[serde(default)]
    pub rotation: f64,
    pub ellipselabels: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeypointValue {
    pub x: f64,
    pub y: f64,
    #[serde(default = "default_keypoint_width")]
    pub width: f64,
    pub keypointlabels: Vec<String>,
}

/// One typed result record of a task.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LsRecord {
    #[serde(rename = "rectanglelabels")]
    Rectangle {
        #[serde(flatten)]
        meta: RecordMeta,
        value: RectangleValue,
    },
    #[serde(rename = "polygonlabels")]
    Polygon {
        #[serde(flatten)]
        meta: RecordMeta,
        value: PolygonValue,
    },
    #[serde(rename = "ellipselabels")]
    Ellipse {
        #[serde(flatten)]
        meta: RecordMeta,
        value: EllipseValue,
    },
    #[serde(rename = "keypointlabels")]
    Keypoint {
        #[serde(flatten)]
        meta: RecordMeta,
        value: KeypointValue,
    },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AnnotationsContainer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_by: Option<i64>,
    #[serde(default)]
    pub result: Vec<LsRecord>,
    #[serde(default)]
    pub ground_truth: bool,
}

/// The task-level `data` object.
///
/// `pose_boxes[i]` and `pose_points[i]` form the side table linking a
/// decomposed pose's rectangle record id to its keypoint record ids.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TaskData {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pose_boxes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pose_points: Vec<Vec<String>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A Label Studio labeling task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LabelStudioTask {
    #[serde(default)]
    pub annotations: Vec<AnnotationsContainer>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub data: TaskData,
    #[serde(default)]
    pub project: i64,
    #[serde(default = "new_task_id")]
    pub id: u64,
    #[serde(skip, default = "default_user_id")]
    pub user_id: i64,
}

impl Default for LabelStudioTask {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Record <-> IR conversion
// ============================================================================

impl LsRecord {
    pub fn meta(&self) -> &RecordMeta {
        match self {
            LsRecord::Rectangle { meta, .. }
            | LsRecord::Polygon { meta, .. }
            | LsRecord::Ellipse { meta, .. }
            | LsRecord::Keypoint { meta, .. } => meta,
        }
    }

    /// Decode this record into an IR annotation.
    ///
    /// Keypoint records decode to a single-point pose; reassembly into the
    /// full skeleton happens at the task level.
    pub fn to_ir_annotation(&self) -> Result<ImageAnnotation, LabelpivotError> {
        let meta = self.meta();
        let (category, shape) = match self {
            LsRecord::Rectangle { value, .. } => (
                first_label(&value.rectanglelabels, "rectanglelabels")?,
                Shape::BBox(BBoxShape {
                    top: value.y / 100.0,
                    left: value.x / 100.0,
                    width: value.width / 100.0,
                    height: value.height / 100.0,
                    rotation: value.rotation,
                }),
            ),
            LsRecord::Polygon { value, .. } => (
                first_label(&value.polygonlabels, "polygonlabels")?,
                Shape::Segmentation(SegmentationShape {
                    points: value
                        .points
                        .iter()
                        .map(|&[x, y]| Point::new(x / 100.0, y / 100.0))
                        .collect(),
                }),
            ),
            LsRecord::Ellipse { value, .. } => (
                first_label(&value.ellipselabels, "ellipselabels")?,
                Shape::Ellipse(EllipseShape {
                    center_x: value.x / 100.0,
                    center_y: value.y / 100.0,
                    radius_x: value.radius_x / 100.0,
                    radius_y: value.radius_y / 100.0,
                    rotation: value.rotation,
                }),
            ),
            LsRecord::Keypoint { value, .. } => (
                first_label(&value.keypointlabels, "keypointlabels")?,
                Shape::pose_from_points(vec![PosePoint::new(value.x / 100.0, value.y / 100.0)]),
            ),
        };

        let mut annotation = ImageAnnotation::ground_truth(
            category,
            CoordinateStyle::Normalized,
            meta.original_width,
            meta.original_height,
            shape,
        );
        annotation.imported_id = Some(meta.id.clone());
        Ok(annotation)
    }
}

fn first_label<'a>(labels: &'a [String], field: &str) -> Result<&'a str, LabelpivotError> {
    labels
        .first()
        .map(String::as_str)
        .ok_or_else(|| LabelpivotError::MalformedAnnotation {
            message: format!("result record has an empty {field} list"),
        })
}

/// Encode an IR bbox as a rectangle record.
pub fn rectangle_from_ir(annotation: &ImageAnnotation) -> Result<LsRecord, LabelpivotError> {
    let annotation = annotation.normalized();
    let Shape::BBox(bbox) = &annotation.shape else {
        return Err(LabelpivotError::ShapeMismatch {
            expected: "bbox",
            actual: annotation.shape.kind(),
        });
    };
    let category = annotation.ensure_single_category()?;

    Ok(LsRecord::Rectangle {
        meta: RecordMeta::new(annotation.image_width, annotation.image_height),
        value: RectangleValue {
            x: bbox.left * 100.0,
            y: bbox.top * 100.0,
            width: bbox.width * 100.0,
            height: bbox.height * 100.0,
            rotation: bbox.rotation,
            rectanglelabels: vec![category.to_string()],
        },
    })
}

/// Encode an IR polygon as a polygon record.
pub fn polygon_from_ir(annotation: &ImageAnnotation) -> Result<LsRecord, LabelpivotError> {
    let annotation = annotation.normalized();
    let Shape::Segmentation(segmentation) = &annotation.shape else {
        return Err(LabelpivotError::ShapeMismatch {
            expected: "segmentation",
            actual: annotation.shape.kind(),
        });
    };
    let category = annotation.ensure_single_category()?;

    Ok(LsRecord::Polygon {
        meta: RecordMeta::new(annotation.image_width, annotation.image_height),
        value: PolygonValue {
            points: segmentation
                .points
                .iter()
                .map(|point| [point.x * 100.0, point.y * 100.0])
                .collect(),
            polygonlabels: vec![category.to_string()],
            closed: true,
        },
    })
}

/// Encode an IR ellipse as an ellipse record.
pub fn ellipse_from_ir(annotation: &ImageAnnotation) -> Result<LsRecord, LabelpivotError> {
    let annotation = annotation.normalized();
    let Shape::Ellipse(ellipse) = &annotation.shape else {
        return Err(LabelpivotError::ShapeMismatch {
            expected: "ellipse",
            actual: annotation.shape.kind(),
        });
    };
    let category = annotation.ensure_single_category()?;

    Ok(LsRecord::Ellipse {
        meta: RecordMeta::new(annotation.image_width, annotation.image_height),
        value: EllipseValue {
            x: ellipse.center_x * 100.0,
            y: ellipse.center_y * 100.0,
            radius_x: ellipse.radius_x * 100.0,
            radius_y: ellipse.radius_y * 100.0,
            rotation: ellipse.rotation,
            ellipselabels: vec![category.to_string()],
        },
    })
}

/// Decompose an IR pose into one rectangle record plus one keypoint record
/// per point. Point visibility is not representable and is dropped.
pub fn pose_to_records(
    annotation: &ImageAnnotation,
) -> Result<(LsRecord, Vec<LsRecord>), LabelpivotError> {
    let annotation = annotation.normalized();
    let Shape::Pose(pose) = &annotation.shape else {
        return Err(LabelpivotError::ShapeMismatch {
            expected: "pose",
            actual: annotation.shape.kind(),
        });
    };
    let category = annotation.ensure_single_category()?;

    let bbox = LsRecord::Rectangle {
        meta: RecordMeta::new(annotation.image_width, annotation.image_height),
        value: RectangleValue {
            x: pose.left * 100.0,
            y: pose.top * 100.0,
            width: pose.width * 100.0,
            height: pose.height * 100.0,
            rotation: 0.0,
            rectanglelabels: vec![category.to_string()],
        },
    };

    let keypoints = pose
        .points
        .iter()
        .map(|point| LsRecord::Keypoint {
            meta: RecordMeta::new(annotation.image_width, annotation.image_height),
            value: KeypointValue {
                x: point.x * 100.0,
                y: point.y * 100.0,
                width: default_keypoint_width(),
                keypointlabels: vec![category.to_string()],
            },
        })
        .collect();

    Ok((bbox, keypoints))
}

// ============================================================================
// Task operations
// ============================================================================

impl LabelStudioTask {
    pub fn new() -> Self {
        Self {
            annotations: Vec::new(),
            meta: BTreeMap::new(),
            data: TaskData::default(),
            project: 0,
            id: new_task_id(),
            user_id: default_user_id(),
        }
    }

    /// Append a result record to the task's first annotation container,
    /// creating it on demand.
    pub fn add_record(&mut self, record: LsRecord) {
        if self.annotations.is_empty() {
            self.annotations.push(AnnotationsContainer {
                completed_by: Some(self.user_id),
                ..Default::default()
            });
        }
        self.annotations[0].result.push(record);
    }

    /// Append an IR annotation, dispatching on its shape.
    ///
    /// A pose is decomposed into a rectangle record plus keypoint records,
    /// and the side table is extended so the pose can be reassembled on
    /// import.
    pub fn add_ir_annotation(
        &mut self,
        annotation: &ImageAnnotation,
    ) -> Result<(), LabelpivotError> {
        match &annotation.shape {
            Shape::BBox(_) => {
                let record = rectangle_from_ir(annotation)?;
                self.add_record(record);
            }
            Shape::Segmentation(_) => {
                let record = polygon_from_ir(annotation)?;
                self.add_record(record);
            }
            Shape::Ellipse(_) => {
                let record = ellipse_from_ir(annotation)?;
                self.add_record(record);
            }
            Shape::Pose(_) => {
                let (bbox, keypoints) = pose_to_records(annotation)?;
                let bbox_id = bbox.meta().id.clone();
                let point_ids = keypoints
                    .iter()
                    .map(|record| record.meta().id.clone())
                    .collect();
                self.add_record(bbox);
                for keypoint in keypoints {
                    self.add_record(keypoint);
                }
                self.log_pose_metadata(bbox_id, point_ids);
            }
        }
        Ok(())
    }

    pub fn add_ir_annotations<'a>(
        &mut self,
        annotations: impl IntoIterator<Item = &'a ImageAnnotation>,
    ) -> Result<(), LabelpivotError> {
        for annotation in annotations {
            self.add_ir_annotation(annotation)?;
        }
        Ok(())
    }

    /// Record which keypoint record ids belong to which rectangle record id.
    fn log_pose_metadata(&mut self, bbox_id: String, point_ids: Vec<String>) {
        self.data.pose_boxes.push(bbox_id);
        self.data.pose_points.push(point_ids);
    }

    /// Decode every result record into IR annotations, then reassemble
    /// decomposed poses from the side table.
    pub fn to_ir_annotations(
        &self,
        filename: Option<&str>,
    ) -> Result<Vec<ImageAnnotation>, LabelpivotError> {
        let mut annotations = Vec::new();
        for container in &self.annotations {
            for record in &container.result {
                let mut annotation = record.to_ir_annotation()?;
                if let Some(filename) = filename {
                    annotation.filename = Some(filename.to_string());
                }
                annotations.push(annotation);
            }
        }
        Ok(self.recompose_poses(annotations))
    }

    /// Merge decomposed pose records back into pose annotations.
    ///
    /// Each side-table entry is handled independently: missing or
    /// wrong-shape records degrade with a warning, and an entry whose
    /// points all fail to resolve leaves its records in the flat list
    /// without blocking the other entries.
    fn recompose_poses(&self, annotations: Vec<ImageAnnotation>) -> Vec<ImageAnnotation> {
        if self.data.pose_boxes.is_empty() && self.data.pose_points.is_empty() {
            return annotations;
        }

        let lookup: BTreeMap<&str, &ImageAnnotation> = annotations
            .iter()
            .filter_map(|ann| ann.imported_id.as_deref().map(|id| (id, ann)))
            .collect();

        let mut consumed: BTreeSet<String> = BTreeSet::new();
        let mut poses: Vec<ImageAnnotation> = Vec::new();

        for (bbox_id, point_ids) in self.data.pose_boxes.iter().zip(&self.data.pose_points) {
            let mut entry_consumed: Vec<String> = Vec::new();

            let bbox_ann = match lookup.get(bbox_id.as_str()) {
                None => {
                    warn!(
                        "Bounding box of pose with annotation ID {bbox_id} does not exist in \
                         the task but exists in metadata"
                    );
                    None
                }
                Some(ann) if !matches!(ann.shape, Shape::BBox(_)) => {
                    warn!(
                        "Bounding box of pose with annotation ID {bbox_id} is not a bounding \
                         box annotation"
                    );
                    None
                }
                Some(ann) => {
                    entry_consumed.push(bbox_id.clone());
                    Some(*ann)
                }
            };

            let mut category: Option<String> = bbox_ann
                .and_then(|ann| ann.ensure_single_category().ok())
                .map(str::to_string);
            let mut dims = bbox_ann.map(|ann| (ann.image_width, ann.image_height));
            let mut filename = bbox_ann.and_then(|ann| ann.filename.clone());

            let mut points: Vec<PosePoint> = Vec::new();
            for point_id in point_ids {
                match lookup.get(point_id.as_str()) {
                    None => {
                        warn!(
                            "Point of pose with annotation ID {bbox_id} does not exist in the \
                             task but exists in metadata"
                        );
                    }
                    Some(ann) => match &ann.shape {
                        Shape::Pose(pose) => {
                            if category.is_none() {
                                category =
                                    ann.ensure_single_category().ok().map(str::to_string);
                            }
                            if dims.is_none() {
                                dims = Some((ann.image_width, ann.image_height));
                            }
                            if filename.is_none() {
                                filename = ann.filename.clone();
                            }
                            points.extend(pose.points.iter().copied());
                            entry_consumed.push(point_id.clone());
                        }
                        _ => {
                            warn!(
                                "Point of pose with annotation ID {point_id} is not a point \
                                 annotation"
                            );
                        }
                    },
                }
            }

            if points.is_empty() {
                warn!(
                    "No points found for a pose on task {}; leaving its records in place",
                    self.id
                );
                continue;
            }
            let (Some(category), Some((width, height))) = (category, dims) else {
                warn!(
                    "Pose with annotation ID {bbox_id} on task {} has no usable category or \
                     image dimensions",
                    self.id
                );
                continue;
            };

            let mut merged = ImageAnnotation::ground_truth(
                category,
                CoordinateStyle::Normalized,
                width,
                height,
                Shape::pose_from_points(points),
            );
            merged.filename = filename;

            // The original rectangle wins over the bounding box of the
            // resolved points.
            if let (Some(bbox_ann), Shape::Pose(pose)) = (bbox_ann, &mut merged.shape) {
                if let Shape::BBox(bbox) = &bbox_ann.shape {
                    pose.top = bbox.top;
                    pose.left = bbox.left;
                    pose.width = bbox.width;
                    pose.height = bbox.height;
                }
            }

            consumed.extend(entry_consumed);
            poses.push(merged);
        }

        debug!(
            "Consolidated {} pose annotation(s) for task {}",
            poses.len(),
            self.id
        );

        if poses.is_empty() {
            return annotations;
        }

        let mut remaining: Vec<ImageAnnotation> = annotations
            .into_iter()
            .filter(|ann| {
                ann.imported_id
                    .as_deref()
                    .map(|id| !consumed.contains(id))
                    .unwrap_or(true)
            })
            .collect();
        remaining.extend(poses);
        remaining
    }
}

// ============================================================================
// Serialization entry points
// ============================================================================

/// Parse one task from JSON text.
pub fn parse_ls_task(json: &str) -> Result<LabelStudioTask, LabelpivotError> {
    serde_json::from_str(json).map_err(|source| LabelpivotError::LabelStudioJsonParse {
        path: Path::new("<string>").to_path_buf(),
        source,
    })
}

/// Parse one task from JSON bytes.
pub fn parse_ls_task_slice(bytes: &[u8]) -> Result<LabelStudioTask, LabelpivotError> {
    serde_json::from_slice(bytes).map_err(|source| LabelpivotError::LabelStudioJsonParse {
        path: Path::new("<bytes>").to_path_buf(),
        source,
    })
}

/// Read a file holding either one task object or an array of tasks.
pub fn read_ls_tasks(path: &Path) -> Result<Vec<LabelStudioTask>, LabelpivotError> {
    let data = fs::read_to_string(path).map_err(LabelpivotError::Io)?;
    let parse_err = |source| LabelpivotError::LabelStudioJsonParse {
        path: path.to_path_buf(),
        source,
    };

    let value: serde_json::Value = serde_json::from_str(&data).map_err(parse_err)?;
    if value.is_array() {
        serde_json::from_value(value).map_err(parse_err)
    } else {
        let task = serde_json::from_value(value).map_err(parse_err)?;
        Ok(vec![task])
    }
}

/// Serialize one task to pretty JSON.
pub fn task_to_json_string(task: &LabelStudioTask) -> Result<String, LabelpivotError> {
    serde_json::to_string_pretty(task).map_err(LabelpivotError::LabelStudioJsonWrite)
}

/// Write tasks as a JSON array file.
pub fn write_ls_tasks(path: &Path, tasks: &[LabelStudioTask]) -> Result<(), LabelpivotError> {
    let json =
        serde_json::to_string_pretty(tasks).map_err(LabelpivotError::LabelStudioJsonWrite)?;
    fs::write(path, json).map_err(LabelpivotError::Io)
}
