//! Cross-format conversion drivers.
//!
//! Every conversion here goes through the IR: decode the input format into
//! [`ImageAnnotation`]s, then encode those into the output format. No
//! format pair converts directly.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::LabelpivotError;
use crate::ir::annotation::{ImageAnnotation, Shape};
use crate::ir::io_cvat_xml::read_cvat_xml;
use crate::ir::io_label_studio_json::{read_ls_tasks, write_ls_tasks, LabelStudioTask};
use crate::ir::io_yolo::{export_to_fs, load_yolo_from_fs, AnnotationKind, YoloContext};

/// Group annotations by their owning image path.
///
/// Fails when any annotation has no filename, since the grouping would be
/// meaningless.
pub fn group_annotations_by_filename(
    annotations: &[ImageAnnotation],
) -> Result<BTreeMap<String, Vec<&ImageAnnotation>>, LabelpivotError> {
    let mut grouped: BTreeMap<String, Vec<&ImageAnnotation>> = BTreeMap::new();
    for annotation in annotations {
        let filename = annotation
            .filename
            .as_ref()
            .ok_or(LabelpivotError::MissingFilename)?;
        grouped.entry(filename.clone()).or_default().push(annotation);
    }
    Ok(grouped)
}

/// Convert a CVAT XML export into a YOLO dataset directory.
///
/// Returns the path of the written dataset YAML.
pub fn cvat_to_yolo(
    input: &Path,
    output_dir: &Path,
    kind: AnnotationKind,
) -> Result<PathBuf, LabelpivotError> {
    let per_image = read_cvat_xml(input)?;
    let annotations: Vec<ImageAnnotation> = per_image.into_values().flatten().collect();

    let mut context = context_for_annotations(kind, &annotations)?;
    export_to_fs(&mut context, &annotations, output_dir, "labelpivot.yaml")
}

/// Convert a CVAT XML export into Label Studio task files, one per image.
///
/// Returns the paths of the written task files.
pub fn cvat_to_label_studio(
    input: &Path,
    output_dir: &Path,
) -> Result<Vec<PathBuf>, LabelpivotError> {
    let per_image = read_cvat_xml(input)?;
    write_tasks_per_image(per_image, output_dir)
}

/// Convert a YOLO dataset (referenced by its dataset YAML) into Label
/// Studio task files, one per image.
pub fn yolo_to_label_studio(
    meta_file: &Path,
    kind: AnnotationKind,
    output_dir: &Path,
) -> Result<Vec<PathBuf>, LabelpivotError> {
    let (per_image, _context) = load_yolo_from_fs(kind, meta_file)?;
    write_tasks_per_image(per_image, output_dir)
}

/// Convert a Label Studio task file (single task or array) into a YOLO
/// dataset directory.
pub fn label_studio_to_yolo(
    input: &Path,
    output_dir: &Path,
    kind: AnnotationKind,
) -> Result<PathBuf, LabelpivotError> {
    let tasks = read_ls_tasks(input)?;

    let mut annotations = Vec::new();
    for task in &tasks {
        let filename = task_image_name(task).unwrap_or_else(|| format!("task_{}.jpg", task.id));
        annotations.extend(task.to_ir_annotations(Some(&filename))?);
    }

    let mut context = context_for_annotations(kind, &annotations)?;
    export_to_fs(&mut context, &annotations, output_dir, "labelpivot.yaml")
}

/// Build a YOLO context whose category table covers every exportable
/// annotation, with ids assigned in first-seen order.
fn context_for_annotations(
    kind: AnnotationKind,
    annotations: &[ImageAnnotation],
) -> Result<YoloContext, LabelpivotError> {
    let mut context = YoloContext::new(kind);

    for annotation in annotations {
        if !kind.matches(&annotation.shape) {
            continue;
        }
        let category = annotation.ensure_single_category()?;
        context.categories.get_or_create(category);
    }

    if kind == AnnotationKind::Pose {
        let max_points = annotations
            .iter()
            .filter_map(|annotation| match &annotation.shape {
                Shape::Pose(pose) => Some(pose.points.len()),
                _ => None,
            })
            .max()
            .unwrap_or(0);
        context.keypoints_in_annotation = Some(max_points);
    }

    Ok(context)
}

fn write_tasks_per_image(
    per_image: BTreeMap<String, Vec<ImageAnnotation>>,
    output_dir: &Path,
) -> Result<Vec<PathBuf>, LabelpivotError> {
    fs::create_dir_all(output_dir).map_err(LabelpivotError::Io)?;

    let mut written = Vec::with_capacity(per_image.len());

    for (filename, annotations) in per_image {
        let mut task = LabelStudioTask::new();
        task.data
            .extra
            .insert("image".to_string(), serde_json::Value::String(filename.clone()));
        task.add_ir_annotations(annotations.iter())?;

        let stem = Path::new(&filename)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("task_{}", task.id));
        let task_path = output_dir.join(format!("{stem}.json"));

        write_ls_tasks(&task_path, std::slice::from_ref(&task))?;
        written.push(task_path);
    }

    Ok(written)
}

/// Derive the image name a task refers to from its `data.image` entry.
fn task_image_name(task: &LabelStudioTask) -> Option<String> {
    let image_ref = task.data.extra.get("image")?.as_str()?;
    image_ref
        .rsplit(['/', '\\'])
        .next()
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}
