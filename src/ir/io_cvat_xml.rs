//! CVAT XML reader.
//!
//! This adapter decodes CVAT "for images" task-export XML: `<image>`
//! containers carrying `<box>`, `<ellipse>`, `<polygon>`, `<points>` and
//! `<skeleton>` shape elements. All decoded values are absolute pixels
//! (denormalized). CVAT is an import-only format here; conversions out of
//! the IR target the YOLO and Label Studio codecs.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::warn;
use roxmltree::{Document, Node};

use super::annotation::{
    BBoxShape, CoordinateStyle, EllipseShape, ImageAnnotation, Point, PosePoint,
    SegmentationShape, Shape,
};
use crate::error::LabelpivotError;

/// Pixel dimensions and name of one `<image>` container.
#[derive(Clone, Debug)]
pub struct CvatImageInfo {
    pub name: String,
    pub width: u32,
    pub height: u32,
}

type ShapeParser =
    fn(Node<'_, '_>, &CvatImageInfo, &Path) -> Result<ImageAnnotation, LabelpivotError>;

/// Looks up the decoder for a CVAT shape element tag.
fn shape_parser(tag: &str) -> Option<ShapeParser> {
    match tag {
        "box" => Some(parse_box),
        "ellipse" => Some(parse_ellipse),
        "polygon" => Some(parse_polygon),
        "points" => Some(parse_points),
        "skeleton" => Some(parse_skeleton),
        _ => None,
    }
}

/// Read a CVAT XML file into IR annotations grouped by image name.
pub fn read_cvat_xml(
    path: &Path,
) -> Result<BTreeMap<String, Vec<ImageAnnotation>>, LabelpivotError> {
    let xml = fs::read_to_string(path).map_err(LabelpivotError::Io)?;
    parse_cvat_xml_str(&xml, path)
}

/// Parse CVAT XML from a string.
pub fn load_cvat_xml_str(
    xml: &str,
) -> Result<BTreeMap<String, Vec<ImageAnnotation>>, LabelpivotError> {
    parse_cvat_xml_str(xml, Path::new("<string>"))
}

/// Parse CVAT XML from bytes (must be valid UTF-8).
pub fn load_cvat_xml_slice(
    bytes: &[u8],
) -> Result<BTreeMap<String, Vec<ImageAnnotation>>, LabelpivotError> {
    let xml = std::str::from_utf8(bytes).map_err(|source| LabelpivotError::CvatXmlParse {
        path: PathBuf::from("<bytes>"),
        message: format!("input is not valid UTF-8: {source}"),
    })?;
    parse_cvat_xml_str(xml, Path::new("<bytes>"))
}

fn parse_cvat_xml_str(
    xml: &str,
    path: &Path,
) -> Result<BTreeMap<String, Vec<ImageAnnotation>>, LabelpivotError> {
    let document = Document::parse(xml).map_err(|source| LabelpivotError::CvatXmlParse {
        path: path.to_path_buf(),
        message: source.to_string(),
    })?;

    let mut annotations = BTreeMap::new();

    for image_node in document
        .descendants()
        .filter(|node| node.is_element() && node.tag_name().name() == "image")
    {
        let info = parse_image_tag(image_node, path)?;
        let image_annotations = parse_image_annotations(image_node, &info, path)?;
        annotations.insert(info.name, image_annotations);
    }

    Ok(annotations)
}

/// Decode every supported shape element under one `<image>` node.
///
/// Unsupported element types are logged and skipped rather than failing the
/// whole image.
fn parse_image_annotations(
    image_node: Node<'_, '_>,
    info: &CvatImageInfo,
    path: &Path,
) -> Result<Vec<ImageAnnotation>, LabelpivotError> {
    let mut annotations = Vec::new();

    for shape_node in image_node.children().filter(|n| n.is_element()) {
        let tag = shape_node.tag_name().name();
        let Some(parser) = shape_parser(tag) else {
            warn!(
                "Unknown CVAT annotation type <{tag}> in image '{}'",
                info.name
            );
            continue;
        };
        annotations.push(parser(shape_node, info, path)?);
    }

    Ok(annotations)
}

fn parse_image_tag(node: Node<'_, '_>, path: &Path) -> Result<CvatImageInfo, LabelpivotError> {
    Ok(CvatImageInfo {
        name: required_attr(node, "name", path, "<image>")?.to_string(),
        width: parse_required_u32_attr(node, "width", path, "<image>")?,
        height: parse_required_u32_attr(node, "height", path, "<image>")?,
    })
}

/// Converts the CVAT rotated-box encoding to the IR one.
///
/// CVAT rotates counter-clockwise around the box center; the IR rotates
/// clockwise around the top-left corner. Rotating the top-left point about
/// the center by the same magnitude switches the pivot while the box size
/// and rotation value carry over unchanged.
///
/// Returns `(left, top, width, height, rotation)`.
fn calculate_bbox(
    xtl: f64,
    ytl: f64,
    xbr: f64,
    ybr: f64,
    rotation: f64,
) -> (f64, f64, f64, f64, f64) {
    if rotation == 0.0 {
        return (xtl, ytl, xbr - xtl, ybr - ytl, rotation);
    }

    let center_x = xtl + (xbr - xtl) / 2.0;
    let center_y = ytl + (ybr - ytl) / 2.0;

    let (sin, cos) = rotation.to_radians().sin_cos();

    let left = center_x + cos * (xtl - center_x) - sin * (ytl - center_y);
    let top = center_y + sin * (xtl - center_x) + cos * (ytl - center_y);

    (left.round(), top.round(), xbr - xtl, ybr - ytl, rotation)
}

fn parse_box(
    node: Node<'_, '_>,
    info: &CvatImageInfo,
    path: &Path,
) -> Result<ImageAnnotation, LabelpivotError> {
    let label = required_attr(node, "label", path, "<box>")?;
    let xtl = parse_required_f64_attr(node, "xtl", path, "<box>")?;
    let ytl = parse_required_f64_attr(node, "ytl", path, "<box>")?;
    let xbr = parse_required_f64_attr(node, "xbr", path, "<box>")?;
    let ybr = parse_required_f64_attr(node, "ybr", path, "<box>")?;
    let rotation = parse_optional_f64_attr(node, "rotation", path, "<box>")?.unwrap_or(0.0);

    let (left, top, width, height, rotation) = calculate_bbox(xtl, ytl, xbr, ybr, rotation);

    Ok(ImageAnnotation::ground_truth(
        label,
        CoordinateStyle::Denormalized,
        info.width,
        info.height,
        Shape::BBox(BBoxShape {
            top,
            left,
            width,
            height,
            rotation,
        }),
    )
    .with_filename(info.name.clone()))
}

fn parse_ellipse(
    node: Node<'_, '_>,
    info: &CvatImageInfo,
    path: &Path,
) -> Result<ImageAnnotation, LabelpivotError> {
    let label = required_attr(node, "label", path, "<ellipse>")?;
    let center_x = parse_required_f64_attr(node, "cx", path, "<ellipse>")?;
    let center_y = parse_required_f64_attr(node, "cy", path, "<ellipse>")?;
    let radius_x = parse_required_f64_attr(node, "rx", path, "<ellipse>")?;
    let radius_y = parse_required_f64_attr(node, "ry", path, "<ellipse>")?;
    let rotation = parse_optional_f64_attr(node, "rotation", path, "<ellipse>")?.unwrap_or(0.0);

    Ok(ImageAnnotation::ground_truth(
        label,
        CoordinateStyle::Denormalized,
        info.width,
        info.height,
        Shape::Ellipse(EllipseShape {
            center_x: center_x.round(),
            center_y: center_y.round(),
            radius_x,
            radius_y,
            rotation,
        }),
    )
    .with_filename(info.name.clone()))
}

fn parse_polygon(
    node: Node<'_, '_>,
    info: &CvatImageInfo,
    path: &Path,
) -> Result<ImageAnnotation, LabelpivotError> {
    let label = required_attr(node, "label", path, "<polygon>")?;
    let raw_points = required_attr(node, "points", path, "<polygon>")?;
    let points = parse_point_list(raw_points, path, "<polygon>")?
        .into_iter()
        .map(|(x, y)| Point::new(x, y))
        .collect();

    Ok(ImageAnnotation::ground_truth(
        label,
        CoordinateStyle::Denormalized,
        info.width,
        info.height,
        Shape::Segmentation(SegmentationShape { points }),
    )
    .with_filename(info.name.clone()))
}

fn parse_points(
    node: Node<'_, '_>,
    info: &CvatImageInfo,
    path: &Path,
) -> Result<ImageAnnotation, LabelpivotError> {
    let label = required_attr(node, "label", path, "<points>")?;
    let raw_points = required_attr(node, "points", path, "<points>")?;
    let points: Vec<PosePoint> = parse_point_list(raw_points, path, "<points>")?
        .into_iter()
        .map(|(x, y)| PosePoint::new(x, y))
        .collect();

    Ok(ImageAnnotation::ground_truth(
        label,
        CoordinateStyle::Denormalized,
        info.width,
        info.height,
        Shape::pose_from_points(points),
    )
    .with_filename(info.name.clone()))
}

fn parse_skeleton(
    node: Node<'_, '_>,
    info: &CvatImageInfo,
    path: &Path,
) -> Result<ImageAnnotation, LabelpivotError> {
    let label = required_attr(node, "label", path, "<skeleton>")?;

    // Joints carry their own labels; the element order in the file is not
    // stable, and downstream consumers key joints by position index.
    let mut joints: Vec<(String, PosePoint)> = Vec::new();

    for point_node in node
        .children()
        .filter(|n| n.is_element() && n.tag_name().name() == "points")
    {
        let joint_label = required_attr(point_node, "label", path, "<skeleton><points>")?;
        let raw_point = required_attr(point_node, "points", path, "<skeleton><points>")?;
        let occluded = required_attr(point_node, "occluded", path, "<skeleton><points>")?;

        let parsed = parse_point_list(raw_point, path, "<skeleton><points>")?;
        let &(x, y) = parsed.first().ok_or_else(|| LabelpivotError::CvatXmlParse {
            path: path.to_path_buf(),
            message: format!(
                "<skeleton> joint '{joint_label}' in image '{}' has an empty points attribute",
                info.name
            ),
        })?;

        joints.push((
            joint_label.to_string(),
            PosePoint::with_visibility(x, y, Some(occluded == "0")),
        ));
    }

    let all_labels_numeric = joints
        .iter()
        .all(|(label, _)| label.parse::<u64>().is_ok());
    if all_labels_numeric {
        joints.sort_by_key(|(label, _)| label.parse::<u64>().unwrap_or(u64::MAX));
    } else {
        joints.sort_by(|(a, _), (b, _)| a.cmp(b));
    }

    let points: Vec<PosePoint> = joints.into_iter().map(|(_, point)| point).collect();

    Ok(ImageAnnotation::ground_truth(
        label,
        CoordinateStyle::Denormalized,
        info.width,
        info.height,
        Shape::pose_from_points(points),
    )
    .with_filename(info.name.clone()))
}

/// Parses a `;`-separated list of `x,y` pairs, in listed order.
fn parse_point_list(
    raw: &str,
    path: &Path,
    context: &str,
) -> Result<Vec<(f64, f64)>, LabelpivotError> {
    let mut points = Vec::new();

    for pair in raw.split(';') {
        let Some((x, y)) = pair.split_once(',') else {
            return Err(LabelpivotError::CvatXmlParse {
                path: path.to_path_buf(),
                message: format!("invalid point '{pair}' in {context}; expected 'x,y'"),
            });
        };
        let x = parse_f64(x, path, context)?;
        let y = parse_f64(y, path, context)?;
        points.push((x, y));
    }

    Ok(points)
}

fn parse_f64(raw: &str, path: &Path, context: &str) -> Result<f64, LabelpivotError> {
    raw.trim()
        .parse::<f64>()
        .map_err(|_| LabelpivotError::CvatXmlParse {
            path: path.to_path_buf(),
            message: format!("invalid number '{raw}' in {context}"),
        })
}

fn required_attr<'a>(
    node: Node<'a, '_>,
    attr: &str,
    path: &Path,
    context: &str,
) -> Result<&'a str, LabelpivotError> {
    node.attribute(attr)
        .ok_or_else(|| LabelpivotError::CvatXmlParse {
            path: path.to_path_buf(),
            message: format!("missing '{attr}' attribute in {context}"),
        })
}

fn parse_required_u32_attr(
    node: Node<'_, '_>,
    attr: &str,
    path: &Path,
    context: &str,
) -> Result<u32, LabelpivotError> {
    let raw = required_attr(node, attr, path, context)?;
    raw.trim()
        .parse::<u32>()
        .map_err(|_| LabelpivotError::CvatXmlParse {
            path: path.to_path_buf(),
            message: format!("invalid '{attr}' value '{raw}' in {context}; expected u32"),
        })
}

fn parse_required_f64_attr(
    node: Node<'_, '_>,
    attr: &str,
    path: &Path,
    context: &str,
) -> Result<f64, LabelpivotError> {
    let raw = required_attr(node, attr, path, context)?;
    parse_f64(raw, path, context)
}

fn parse_optional_f64_attr(
    node: Node<'_, '_>,
    attr: &str,
    path: &Path,
    context: &str,
) -> Result<Option<f64>, LabelpivotError> {
    node.attribute(attr)
        .map(|raw| parse_f64(raw, path, context))
        .transpose()
}
