// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Detection geometry: normalized center-form bounding boxes.

use serde::{Deserialize, Serialize};

/// Axis-aligned box in center form. `(x, y)` is the box center, `(w, h)` the
/// full width and height; all four normalized to `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BBox {
    /// Build from corner form `(x1, y1, x2, y2)`.
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x: (x1 + x2) / 2.0,
            y: (y1 + y2) / 2.0,
            w: x2 - x1,
            h: y2 - y1,
        }
    }

    /// Corner form `(x1, y1, x2, y2)`.
    pub fn corners(&self) -> (f32, f32, f32, f32) {
        (
            self.x - self.w / 2.0,
            self.y - self.h / 2.0,
            self.x + self.w / 2.0,
            self.y + self.h / 2.0,
        )
    }

    /// Whether the box lies entirely inside the unit square.
    pub fn is_normalized(&self) -> bool {
        let (x1, y1, x2, y2) = self.corners();
        // Small tolerance for float round-trips at the edges.
        const EPS: f32 = 1e-4;
        (-EPS..=1.0 + EPS).contains(&x1)
            && (-EPS..=1.0 + EPS).contains(&y1)
            && x1 <= x2 + EPS
            && y1 <= y2 + EPS
            && x2 <= 1.0 + EPS
            && y2 <= 1.0 + EPS
    }
}

/// One detected object in a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    pub cls: String,
    pub conf: f32,
    pub bbox: BBox,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track_id: Option<String>,
}

impl Detection {
    /// Check the wire invariants: non-empty class, confidence in `[0, 1]`,
    /// box inside the unit square. Violations are dropped by callers, never
    /// propagated.
    pub fn is_valid(&self) -> bool {
        !self.cls.is_empty() && (0.0..=1.0).contains(&self.conf) && self.bbox.is_normalized()
    }
}

#[cfg(test)]
#[path = "detect_tests.rs"]
mod tests;
