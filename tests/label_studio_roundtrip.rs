//! Integration tests for Label Studio task JSON support.

use labelpivot::ir::io_label_studio_json::{read_ls_tasks, write_ls_tasks, LabelStudioTask};
use labelpivot::ir::{
    BBoxShape, CoordinateStyle, EllipseShape, ImageAnnotation, Point, PosePoint,
    SegmentationShape, Shape,
};

fn sample_annotations() -> Vec<ImageAnnotation> {
    vec![
        ImageAnnotation::ground_truth(
            "car",
            CoordinateStyle::Denormalized,
            200,
            100,
            Shape::BBox(BBoxShape {
                top: 10.0,
                left: 20.0,
                width: 100.0,
                height: 50.0,
                rotation: 0.0,
            }),
        )
        .with_filename("street.jpg"),
        ImageAnnotation::ground_truth(
            "roof",
            CoordinateStyle::Denormalized,
            200,
            100,
            Shape::Segmentation(SegmentationShape {
                points: vec![
                    Point::new(10.0, 10.0),
                    Point::new(60.0, 10.0),
                    Point::new(35.0, 40.0),
                ],
            }),
        )
        .with_filename("street.jpg"),
        ImageAnnotation::ground_truth(
            "wheel",
            CoordinateStyle::Denormalized,
            200,
            100,
            Shape::Ellipse(EllipseShape {
                center_x: 50.0,
                center_y: 60.0,
                radius_x: 10.0,
                radius_y: 8.0,
                rotation: 0.0,
            }),
        )
        .with_filename("street.jpg"),
        ImageAnnotation::ground_truth(
            "person",
            CoordinateStyle::Denormalized,
            200,
            100,
            Shape::Pose(labelpivot::ir::PoseShape {
                top: 20.0,
                left: 120.0,
                width: 40.0,
                height: 60.0,
                points: vec![PosePoint::new(130.0, 30.0), PosePoint::new(150.0, 70.0)],
            }),
        )
        .with_filename("street.jpg"),
    ]
}

#[test]
fn task_file_write_then_read_roundtrip_semantic() {
    let annotations = sample_annotations();

    let mut task = LabelStudioTask::new();
    task.add_ir_annotations(annotations.iter()).expect("add annotations");

    // One bbox + one polygon + one ellipse + (one rectangle + two
    // keypoints) for the pose.
    assert_eq!(task.annotations[0].result.len(), 6);

    let temp = tempfile::tempdir().expect("create temp dir");
    let path = temp.path().join("tasks.json");
    write_ls_tasks(&path, std::slice::from_ref(&task)).expect("write tasks");

    let restored = read_ls_tasks(&path).expect("read tasks");
    assert_eq!(restored.len(), 1);

    let decoded = restored[0]
        .to_ir_annotations(Some("street.jpg"))
        .expect("decode task");

    // The pose reassembles, so the flat record count collapses back to 4.
    assert_eq!(decoded.len(), 4);

    let mut kinds: Vec<&str> = decoded.iter().map(|ann| ann.shape.kind()).collect();
    kinds.sort_unstable();
    assert_eq!(kinds, vec!["bbox", "ellipse", "pose", "segmentation"]);

    // Every decoded annotation is normalized; compare against the
    // normalized originals.
    for original in &annotations {
        let normalized = original.normalized();
        let category = normalized.ensure_single_category().expect("one category");
        let decoded_ann = decoded
            .iter()
            .find(|ann| ann.categories.contains_key(category))
            .expect("category survives the roundtrip");

        match (&normalized.shape, &decoded_ann.shape) {
            (Shape::BBox(expected), Shape::BBox(actual)) => {
                assert!((expected.left - actual.left).abs() < 1e-9);
                assert!((expected.top - actual.top).abs() < 1e-9);
                assert!((expected.width - actual.width).abs() < 1e-9);
                assert!((expected.height - actual.height).abs() < 1e-9);
            }
            (Shape::Segmentation(expected), Shape::Segmentation(actual)) => {
                assert_eq!(expected.points.len(), actual.points.len());
                for (left, right) in expected.points.iter().zip(&actual.points) {
                    assert!((left.x - right.x).abs() < 1e-9);
                    assert!((left.y - right.y).abs() < 1e-9);
                }
            }
            (Shape::Ellipse(expected), Shape::Ellipse(actual)) => {
                assert!((expected.center_x - actual.center_x).abs() < 1e-9);
                assert!((expected.radius_y - actual.radius_y).abs() < 1e-9);
            }
            (Shape::Pose(expected), Shape::Pose(actual)) => {
                assert!((expected.left - actual.left).abs() < 1e-9);
                assert!((expected.top - actual.top).abs() < 1e-9);
                assert!((expected.width - actual.width).abs() < 1e-9);
                assert!((expected.height - actual.height).abs() < 1e-9);
                assert_eq!(expected.points.len(), actual.points.len());
            }
            (expected, actual) => panic!(
                "shape mismatch after roundtrip: {} vs {}",
                expected.kind(),
                actual.kind()
            ),
        }
    }
}

#[test]
fn single_task_object_files_are_accepted() {
    let mut task = LabelStudioTask::new();
    task.add_ir_annotation(&sample_annotations()[0]).expect("add annotation");

    let temp = tempfile::tempdir().expect("create temp dir");
    let path = temp.path().join("task.json");
    let json = labelpivot::ir::io_label_studio_json::task_to_json_string(&task)
        .expect("serialize task");
    std::fs::write(&path, json).expect("write task");

    let restored = read_ls_tasks(&path).expect("read single task");
    assert_eq!(restored.len(), 1);
    assert_eq!(restored[0].annotations[0].result.len(), 1);
}

#[test]
fn side_table_survives_serialization() {
    let mut task = LabelStudioTask::new();
    task.add_ir_annotation(&sample_annotations()[3]).expect("add pose");

    let json =
        labelpivot::ir::io_label_studio_json::task_to_json_string(&task).expect("serialize");
    assert!(json.contains("pose_boxes"));
    assert!(json.contains("pose_points"));

    let restored =
        labelpivot::ir::io_label_studio_json::parse_ls_task(&json).expect("parse task");
    assert_eq!(restored.data.pose_boxes, task.data.pose_boxes);
    assert_eq!(restored.data.pose_points, task.data.pose_points);
}
