//! Detection sum type and the geometry used to compare detections.
//!
//! A detector emits four kinds of results for an image: bounding boxes,
//! points, segmentation polygons and whole-image classifications.  They
//! travel together in [`ImageMetadata`], which is also the metadata file
//! stored next to every outbox image.

use serde::{Deserialize, Serialize};

use crate::types::Timestamp;

/// Axis-aligned bounding box detection in pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxDetection {
    pub category_name: String,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub model_name: String,
    pub confidence: f64,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoxDetection {
    pub fn area(&self) -> f64 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-union with another box.
    pub fn iou(&self, other: &BoxDetection) -> f64 {
        iou(self, other)
    }
}

/// Single point detection in pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointDetection {
    pub category_name: String,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub model_name: String,
    pub confidence: f64,
    pub x: f64,
    pub y: f64,
}

impl PointDetection {
    pub fn distance(&self, other: &PointDetection) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// Polygon outline of a segmented region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationDetection {
    pub category_name: String,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub model_name: String,
    #[serde(default)]
    pub confidence: f64,
    pub shape: Vec<Point>,
}

/// Whole-image class assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationDetection {
    pub category_name: String,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub model_name: String,
    pub confidence: f64,
}

/// One detection of any supported kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Detection {
    Box(BoxDetection),
    Point(PointDetection),
    Segmentation(SegmentationDetection),
    Classification(ClassificationDetection),
}

impl Detection {
    pub fn category_name(&self) -> &str {
        match self {
            Detection::Box(d) => &d.category_name,
            Detection::Point(d) => &d.category_name,
            Detection::Segmentation(d) => &d.category_name,
            Detection::Classification(d) => &d.category_name,
        }
    }

    pub fn confidence(&self) -> f64 {
        match self {
            Detection::Box(d) => d.confidence,
            Detection::Point(d) => d.confidence,
            Detection::Segmentation(d) => d.confidence,
            Detection::Classification(d) => d.confidence,
        }
    }
}

/// Detections plus bookkeeping for a single image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMetadata {
    #[serde(default)]
    pub detections: Vec<Detection>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created: Timestamp,
    /// Grouping key of the producer, e.g. a camera id.
    #[serde(default)]
    pub source: Option<String>,
}

impl ImageMetadata {
    pub fn new(detections: Vec<Detection>) -> Self {
        Self {
            detections,
            tags: Vec::new(),
            created: chrono::Utc::now(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Append tags that are not present yet, keeping insertion order.
    pub fn add_tags<I, S>(&mut self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for tag in tags {
            let tag = tag.into();
            if !self.tags.contains(&tag) {
                self.tags.push(tag);
            }
        }
    }
}

/// Detections produced for one dataset image while evaluating a freshly
/// trained model. One JSON array of these forms a detection shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageDetections {
    pub image_id: String,
    #[serde(flatten)]
    pub metadata: ImageMetadata,
}

// ---------------------------------------------------------------------------
// Geometry
// ---------------------------------------------------------------------------

/// Intersection-over-union of two boxes.
///
/// `intersection / (area_a + area_b - intersection)`. A zero or negative
/// union yields `0.0`.
pub fn iou(a: &BoxDetection, b: &BoxDetection) -> f64 {
    let left = a.x.max(b.x);
    let top = a.y.max(b.y);
    let right = (a.x + a.width).min(b.x + b.width);
    let bottom = (a.y + a.height).min(b.y + b.height);

    let intersection = (right - left).max(0.0) * (bottom - top).max(0.0);
    let union = a.area() + b.area() - intersection;
    if union <= 0.0 {
        return 0.0;
    }
    intersection / union
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f64, y: f64, width: f64, height: f64) -> BoxDetection {
        BoxDetection {
            category_name: "dirt".into(),
            category_id: None,
            model_name: "test".into(),
            confidence: 0.9,
            x,
            y,
            width,
            height,
        }
    }

    #[test]
    fn half_overlap_is_one_half() {
        let a = bbox(10.0, 0.0, 30.0, 100.0);
        let b = bbox(20.0, 0.0, 30.0, 100.0);
        assert_eq!(iou(&a, &b), 0.5);
    }

    #[test]
    fn touching_boxes_do_not_overlap() {
        let a = bbox(10.0, 0.0, 30.0, 100.0);
        let c = bbox(0.0, 30.0, 10.0, 10.0);
        assert_eq!(iou(&a, &c), 0.0);
    }

    #[test]
    fn iou_is_symmetric() {
        let boxes = [
            bbox(0.0, 0.0, 10.0, 10.0),
            bbox(5.0, 5.0, 10.0, 10.0),
            bbox(-3.0, 2.0, 7.5, 1.0),
            bbox(100.0, 100.0, 1.0, 1.0),
        ];
        for a in &boxes {
            for b in &boxes {
                assert_eq!(iou(a, b), iou(b, a));
            }
        }
    }

    #[test]
    fn box_with_itself_is_one() {
        let a = bbox(3.0, 4.0, 12.0, 8.0);
        assert_eq!(a.iou(&a), 1.0);
    }

    #[test]
    fn degenerate_boxes_yield_zero() {
        let a = bbox(0.0, 0.0, 0.0, 0.0);
        assert_eq!(iou(&a, &a), 0.0);
    }

    #[test]
    fn point_distance_is_euclidean() {
        let p = PointDetection {
            category_name: "dirt".into(),
            category_id: None,
            model_name: String::new(),
            confidence: 0.5,
            x: 0.0,
            y: 0.0,
        };
        let q = PointDetection { x: 3.0, y: 4.0, ..p.clone() };
        assert_eq!(p.distance(&q), 5.0);
    }

    #[test]
    fn detection_serializes_with_kind_tag() {
        let d = Detection::Box(bbox(1.0, 2.0, 3.0, 4.0));
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["kind"], "box");
        assert_eq!(json["category_name"], "dirt");
    }

    #[test]
    fn add_tags_skips_duplicates() {
        let mut meta = ImageMetadata::new(Vec::new());
        meta.add_tags(["uncertain", "uncertain", "box"]);
        assert_eq!(meta.tags, vec!["uncertain", "box"]);
    }
}
