// Chart rendering module
// Turns a numeric series into backend-agnostic drawing commands

pub mod render;

pub use render::{render, PADDING};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: f64,
}

impl Rgba {
    pub const fn new(r: u8, g: u8, b: u8, a: f64) -> Self {
        Self { r, g, b, a }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ColorStop {
    pub offset: f64,
    pub color: Rgba,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinearGradient {
    pub from: Point,
    pub to: Point,
    pub stops: Vec<ColorStop>,
}

/// One instruction for a 2D surface, in paint order
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DrawCommand {
    Clear {
        width: f64,
        height: f64,
    },
    GridLine {
        from: Point,
        to: Point,
        color: Rgba,
        line_width: f64,
    },
    Polyline {
        points: Vec<Point>,
        color: Rgba,
        line_width: f64,
    },
    /// Closed polygon filled with a gradient
    FillArea {
        points: Vec<Point>,
        gradient: LinearGradient,
    },
}
