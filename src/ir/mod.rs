//! Intermediate Representation (IR) for labelpivot.
//!
//! This module defines the canonical, format-agnostic representation of
//! image annotations. It serves as the central "hub" that all format
//! conversions pass through: every decoder produces [`ImageAnnotation`]s
//! and every encoder consumes them, so N formats need only 2N codecs.
//!
//! # Design Principles
//!
//! 1. **One pivot**: no format pair converts directly; geometry is only
//!    translated into and out of the IR.
//!
//! 2. **Unrepresentable invalid states**: image dimensions are required
//!    constructor fields, so a normalize/denormalize transform can never
//!    run without a spatial scale.
//!
//! 3. **Shapes as data**: the shape variants form a tagged sum type and the
//!    codecs are plain functions over it, dispatched through per-format
//!    lookup tables.

pub mod annotation;
pub mod categories;
pub mod io_cvat_xml;
pub mod io_label_studio_json;
pub mod io_yolo;

// Re-export core types for convenient access
pub use annotation::{
    BBoxShape, CoordinateStyle, EllipseShape, ImageAnnotation, Point, PosePoint, PoseShape,
    SegmentationShape, Shape,
};
pub use categories::{Category, CategoryTable};
