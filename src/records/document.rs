use std::fmt::Write as _;

use log::warn;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{AppError, Result};
use crate::series::{canonicalize, Dataset, DatasetMetadata, TimeSeriesPoint};

/// Field descriptions embedded in every stored document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDescription {
    pub timestamp: String,
    pub value: String,
    pub unit: String,
    pub quality: String,
}

impl Default for SchemaDescription {
    fn default() -> Self {
        Self {
            timestamp: "RFC 3339 instant in UTC".to_string(),
            value: "numeric reading".to_string(),
            unit: "measurement unit of the source".to_string(),
            quality: "one of good, suspect, bad".to_string(),
        }
    }
}

/// Durable JSON shape of a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetDocument {
    pub metadata: DatasetMetadata,
    #[serde(default)]
    pub schema: SchemaDescription,
    /// Hex SHA-256 over the source name and every point.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub data: Vec<TimeSeriesPoint>,
}

impl From<&Dataset> for DatasetDocument {
    fn from(dataset: &Dataset) -> Self {
        Self {
            metadata: dataset.metadata.clone(),
            schema: SchemaDescription::default(),
            checksum: Some(checksum(&dataset.metadata.source, &dataset.points)),
            data: dataset.points.clone(),
        }
    }
}

impl DatasetDocument {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parse a stored document and check it against its checksum, if it has one.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let document: Self = serde_json::from_slice(bytes)
            .map_err(|err| AppError::Parse(format!("stored dataset is malformed: {err}")))?;
        document.verify()?;
        Ok(document)
    }

    pub fn verify(&self) -> Result<()> {
        let Some(expected) = self.checksum.as_deref() else {
            return Ok(());
        };
        let actual = checksum(&self.metadata.source, &self.data);
        if actual != expected {
            return Err(AppError::Parse(format!(
                "stored dataset for {} failed its checksum (expected {}, found {})",
                self.metadata.source, expected, actual
            )));
        }
        Ok(())
    }

    pub fn into_dataset(self) -> Dataset {
        let mut metadata = self.metadata;
        let (points, collapsed) = canonicalize(self.data);
        if collapsed > 0 || points.len() != metadata.total_records {
            warn!(
                "stored dataset for {} was not canonical; repaired {} points",
                metadata.source,
                points.len()
            );
            metadata.total_records = points.len();
        }
        Dataset {
            source: metadata.source.clone(),
            points,
            metadata,
        }
    }
}

fn checksum(source: &str, points: &[TimeSeriesPoint]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update([0u8]);
    for point in points {
        hasher.update(point.timestamp.timestamp().to_le_bytes());
        hasher.update(point.timestamp.timestamp_subsec_nanos().to_le_bytes());
        hasher.update(point.value.to_bits().to_le_bytes());
        hasher.update(point.unit.as_bytes());
        hasher.update([0u8, point.quality as u8]);
    }

    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest.iter() {
        let _ = write!(&mut out, "{:02x}", byte);
    }
    out
}
