use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-point quality flag carried through to the durable document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Good,
    Suspect,
    Bad,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub unit: String,
    pub quality: Quality,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetMetadata {
    pub source: String,
    pub last_updated: DateTime<Utc>,
    pub total_records: usize,
    pub quality_score: u8,
}

/// Canonical series for one source: ascending, one point per timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub source: String,
    pub points: Vec<TimeSeriesPoint>,
    pub metadata: DatasetMetadata,
}

impl Dataset {
    /// Build a dataset from arbitrary points, enforcing the ordering invariant.
    pub fn from_points(
        source: &str,
        points: Vec<TimeSeriesPoint>,
        quality_score: u8,
        last_updated: DateTime<Utc>,
    ) -> Self {
        let (points, _) = canonicalize(points);
        Self {
            source: source.to_string(),
            metadata: DatasetMetadata {
                source: source.to_string(),
                last_updated,
                total_records: points.len(),
                quality_score: quality_score.min(100),
            },
            points,
        }
    }

    /// Fold a freshly normalized batch into this dataset. Batch points win on
    /// timestamp collisions; metadata comes from the batch.
    pub fn merged_with(&self, batch: &Dataset) -> Dataset {
        let mut points = Vec::with_capacity(self.points.len() + batch.points.len());
        points.extend(self.points.iter().cloned());
        points.extend(batch.points.iter().cloned());
        Dataset::from_points(
            &batch.source,
            points,
            batch.metadata.quality_score,
            batch.metadata.last_updated,
        )
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn latest(&self) -> Option<&TimeSeriesPoint> {
        self.points.last()
    }
}

/// Stable-sort by timestamp and collapse equal timestamps keeping the last
/// occurrence. Returns the canonical points and the number collapsed.
pub fn canonicalize(mut points: Vec<TimeSeriesPoint>) -> (Vec<TimeSeriesPoint>, usize) {
    points.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

    let before = points.len();
    let mut out: Vec<TimeSeriesPoint> = Vec::with_capacity(before);
    for point in points {
        match out.last_mut() {
            Some(last) if last.timestamp == point.timestamp => *last = point,
            _ => out.push(point),
        }
    }
    let collapsed = before - out.len();
    (out, collapsed)
}
