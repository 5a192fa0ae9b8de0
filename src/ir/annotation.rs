//! Core annotation model for the labelpivot intermediate representation.
//!
//! This module defines the canonical format-agnostic representation of a
//! single image annotation. All format-specific decoders convert into this
//! IR, and all encoders convert out of it; no format pair ever converts
//! directly.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::LabelpivotError;

/// How the spatial values of an annotation are expressed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinateStyle {
    /// Values are fractions of the image dimensions, conventionally in [0, 1].
    Normalized,
    /// Values are absolute pixel units.
    Denormalized,
}

/// A 2D point of a segmentation polygon.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    #[inline]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// A keypoint of a pose skeleton.
///
/// `visible` is three-state: `Some(true)` = visible, `Some(false)` =
/// occluded, `None` = unknown.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PosePoint {
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visible: Option<bool>,
}

impl PosePoint {
    #[inline]
    pub fn new(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            visible: None,
        }
    }

    #[inline]
    pub fn with_visibility(x: f64, y: f64, visible: Option<bool>) -> Self {
        Self { x, y, visible }
    }
}

/// An axis-aligned bounding box with an optional rotation.
///
/// Rotation is in degrees, clockwise, pivoting around the top-left corner.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BBoxShape {
    pub top: f64,
    pub left: f64,
    pub width: f64,
    pub height: f64,
    #[serde(default)]
    pub rotation: f64,
}

/// An ellipse described by its center and per-axis radii.
///
/// Rotation is in degrees, clockwise, pivoting around the top-left corner
/// of the bounding box.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EllipseShape {
    pub center_x: f64,
    pub center_y: f64,
    pub radius_x: f64,
    pub radius_y: f64,
    #[serde(default)]
    pub rotation: f64,
}

/// A polygon. Point order defines edge connectivity and is preserved.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SegmentationShape {
    pub points: Vec<Point>,
}

/// A pose skeleton: a bounding box plus an ordered keypoint sequence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoseShape {
    pub top: f64,
    pub left: f64,
    pub width: f64,
    pub height: f64,
    pub points: Vec<PosePoint>,
}

/// The geometric payload of an annotation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape")]
pub enum Shape {
    #[serde(rename = "bbox")]
    BBox(BBoxShape),
    #[serde(rename = "ellipse")]
    Ellipse(EllipseShape),
    #[serde(rename = "segmentation")]
    Segmentation(SegmentationShape),
    #[serde(rename = "pose")]
    Pose(PoseShape),
}

impl Shape {
    /// Short tag naming the shape variant, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Shape::BBox(_) => "bbox",
            Shape::Ellipse(_) => "ellipse",
            Shape::Segmentation(_) => "segmentation",
            Shape::Pose(_) => "pose",
        }
    }

    /// Builds a pose whose box is the axis-aligned bounding box of `points`.
    pub fn pose_from_points(points: Vec<PosePoint>) -> Self {
        if points.is_empty() {
            return Shape::Pose(PoseShape {
                top: 0.0,
                left: 0.0,
                width: 0.0,
                height: 0.0,
                points,
            });
        }

        let mut min_x = f64::INFINITY;
        let mut max_x = f64::NEG_INFINITY;
        let mut min_y = f64::INFINITY;
        let mut max_y = f64::NEG_INFINITY;
        for point in &points {
            min_x = min_x.min(point.x);
            max_x = max_x.max(point.x);
            min_y = min_y.min(point.y);
            max_y = max_y.max(point.y);
        }

        Shape::Pose(PoseShape {
            top: min_y,
            left: min_x,
            width: max_x - min_x,
            height: max_y - min_y,
            points,
        })
    }

    /// Applies the per-axis transforms to every spatial field.
    ///
    /// Rotation values are angles, not lengths, and are never rescaled.
    fn map_spatial(&mut self, fx: impl Fn(f64) -> f64, fy: impl Fn(f64) -> f64) {
        match self {
            Shape::BBox(bbox) => {
                bbox.top = fy(bbox.top);
                bbox.left = fx(bbox.left);
                bbox.width = fx(bbox.width);
                bbox.height = fy(bbox.height);
            }
            Shape::Ellipse(ellipse) => {
                ellipse.center_x = fx(ellipse.center_x);
                ellipse.center_y = fy(ellipse.center_y);
                ellipse.radius_x = fx(ellipse.radius_x);
                ellipse.radius_y = fy(ellipse.radius_y);
            }
            Shape::Segmentation(segmentation) => {
                for point in &mut segmentation.points {
                    point.x = fx(point.x);
                    point.y = fy(point.y);
                }
            }
            Shape::Pose(pose) => {
                pose.top = fy(pose.top);
                pose.left = fx(pose.left);
                pose.width = fx(pose.width);
                pose.height = fy(pose.height);
                for point in &mut pose.points {
                    point.x = fx(point.x);
                    point.y = fy(point.y);
                }
            }
        }
    }
}

/// A single image annotation in the labelpivot IR.
///
/// `image_width`/`image_height` are required at construction: every
/// normalize/denormalize transform needs them, so an annotation without a
/// spatial scale cannot exist.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageAnnotation {
    /// Path of the owning image, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,

    /// Category names with their confidence in [0, 1]; ground truth is 1.0.
    pub categories: BTreeMap<String, f64>,

    pub coordinate_style: CoordinateStyle,

    /// Opaque id correlating back to a source-format record. Only consulted
    /// during pose recomposition of one Label Studio task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imported_id: Option<String>,

    pub image_width: u32,
    pub image_height: u32,

    #[serde(flatten)]
    pub shape: Shape,
}

impl ImageAnnotation {
    /// Creates a new annotation with the given categories.
    pub fn new(
        categories: BTreeMap<String, f64>,
        coordinate_style: CoordinateStyle,
        image_width: u32,
        image_height: u32,
        shape: Shape,
    ) -> Self {
        Self {
            filename: None,
            categories,
            coordinate_style,
            imported_id: None,
            image_width,
            image_height,
            shape,
        }
    }

    /// Creates a ground-truth annotation with a single category at
    /// confidence 1.0.
    pub fn ground_truth(
        category: impl Into<String>,
        coordinate_style: CoordinateStyle,
        image_width: u32,
        image_height: u32,
        shape: Shape,
    ) -> Self {
        let mut categories = BTreeMap::new();
        categories.insert(category.into(), 1.0);
        Self::new(
            categories,
            coordinate_style,
            image_width,
            image_height,
            shape,
        )
    }

    /// Sets the owning image path.
    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn has_one_category(&self) -> bool {
        self.categories.len() == 1
    }

    /// Returns the single category name, or fails with
    /// [`LabelpivotError::MultipleCategories`] when there is not exactly one.
    pub fn ensure_single_category(&self) -> Result<&str, LabelpivotError> {
        if !self.has_one_category() {
            return Err(LabelpivotError::MultipleCategories {
                filename: self.filename.clone(),
                count: self.categories.len(),
            });
        }
        Ok(self
            .categories
            .keys()
            .next()
            .map(String::as_str)
            .unwrap_or_default())
    }

    /// Returns a copy with all spatial values as fractions of the image
    /// dimensions. A no-op copy when already normalized.
    pub fn normalized(&self) -> Self {
        let mut copy = self.clone();
        if self.coordinate_style == CoordinateStyle::Normalized {
            return copy;
        }
        let (width, height) = (f64::from(self.image_width), f64::from(self.image_height));
        copy.shape.map_spatial(|x| x / width, |y| y / height);
        copy.coordinate_style = CoordinateStyle::Normalized;
        copy
    }

    /// Returns a copy with all spatial values in absolute pixel units.
    /// A no-op copy when already denormalized.
    pub fn denormalized(&self) -> Self {
        let mut copy = self.clone();
        if self.coordinate_style == CoordinateStyle::Denormalized {
            return copy;
        }
        let (width, height) = (f64::from(self.image_width), f64::from(self.image_height));
        copy.shape.map_spatial(|x| x * width, |y| y * height);
        copy.coordinate_style = CoordinateStyle::Denormalized;
        copy
    }
}
