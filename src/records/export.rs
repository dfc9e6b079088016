use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::str::FromStr;

use crate::error::{AppError, Context, Result};
use crate::series::{Dataset, Quality};

use super::document::DatasetDocument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Json,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "json" => Ok(ExportFormat::Json),
            other => Err(AppError::Config(format!("unsupported export format `{other}`"))),
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Output hook for downstream consumers of a dataset.
pub trait DatasetExporter: Send + Sync {
    fn format(&self) -> ExportFormat;

    fn export(&self, dataset: &Dataset, out: &mut dyn Write) -> Result<()>;
}

pub struct CsvExporter;

impl DatasetExporter for CsvExporter {
    fn format(&self) -> ExportFormat {
        ExportFormat::Csv
    }

    fn export(&self, dataset: &Dataset, out: &mut dyn Write) -> Result<()> {
        let mut writer = csv::Writer::from_writer(out);
        writer.write_record(["timestamp", "value", "unit", "quality"])?;

        for point in &dataset.points {
            writer.write_record([
                point.timestamp.to_rfc3339().as_str(),
                point.value.to_string().as_str(),
                point.unit.as_str(),
                quality_label(point.quality),
            ])?;
        }

        writer.flush()?;
        Ok(())
    }
}

pub struct JsonExporter;

impl DatasetExporter for JsonExporter {
    fn format(&self) -> ExportFormat {
        ExportFormat::Json
    }

    fn export(&self, dataset: &Dataset, out: &mut dyn Write) -> Result<()> {
        let bytes = DatasetDocument::from(dataset).to_bytes()?;
        out.write_all(&bytes)?;
        out.flush()?;
        Ok(())
    }
}

pub fn exporter_for(format: ExportFormat) -> Box<dyn DatasetExporter> {
    match format {
        ExportFormat::Csv => Box::new(CsvExporter),
        ExportFormat::Json => Box::new(JsonExporter),
    }
}

pub fn export_to_path(dataset: &Dataset, format: ExportFormat, path: &Path) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    exporter_for(format).export(dataset, &mut writer)
}

fn quality_label(quality: Quality) -> &'static str {
    match quality {
        Quality::Good => "good",
        Quality::Suspect => "suspect",
        Quality::Bad => "bad",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::TimeSeriesPoint;
    use chrono::{TimeZone, Utc};

    fn dataset() -> Dataset {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 6, 0, 0).unwrap();
        let points = vec![
            TimeSeriesPoint {
                timestamp: at,
                value: 1.5,
                unit: "kwh".to_string(),
                quality: Quality::Good,
            },
            TimeSeriesPoint {
                timestamp: at + chrono::Duration::hours(1),
                value: 2.0,
                unit: "kwh".to_string(),
                quality: Quality::Suspect,
            },
        ];
        Dataset::from_points("meter", points, 90, at)
    }

    #[test]
    fn csv_export_writes_header_and_rows() {
        let mut out = Vec::new();
        CsvExporter.export(&dataset(), &mut out).unwrap();

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "timestamp,value,unit,quality");
        assert_eq!(lines[1], "2024-05-01T06:00:00+00:00,1.5,kwh,good");
        assert_eq!(lines[2], "2024-05-01T07:00:00+00:00,2,kwh,suspect");
    }

    #[test]
    fn json_export_matches_stored_document() {
        let mut out = Vec::new();
        exporter_for(ExportFormat::Json)
            .export(&dataset(), &mut out)
            .unwrap();

        let document = DatasetDocument::from_slice(&out).unwrap();
        assert_eq!(document.into_dataset(), dataset());
    }

    #[test]
    fn parses_format_names() {
        assert_eq!("CSV".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert_eq!("json".parse::<ExportFormat>().unwrap(), ExportFormat::Json);
        assert!("xml".parse::<ExportFormat>().is_err());
    }
}
