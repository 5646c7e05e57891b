use std::fmt;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Identity of one external dataset pipeline: `(location, database, subsection)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceId {
    location: String,
    database: String,
    subsection: Option<String>,
}

impl SourceId {
    pub fn new(location: &str, database: &str, subsection: Option<&str>) -> Self {
        Self {
            location: location.to_string(),
            database: database.to_string(),
            subsection: subsection
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(str::to_string),
        }
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn subsection(&self) -> Option<&str> {
        self.subsection.as_deref()
    }

    /// Directory of this source below the catalog root.
    pub fn relative_dir(&self) -> Utf8PathBuf {
        let mut path = Utf8PathBuf::from(&self.location).join(&self.database);
        if let Some(sub) = &self.subsection {
            path.push(sub);
        }
        path
    }

    /// True when every segment of `hint` prefix-matches the corresponding
    /// segment of this id.
    pub fn matches_hint(&self, hint: &SourceHint) -> bool {
        if !self.location.starts_with(&hint.location) {
            return false;
        }
        if let Some(db) = &hint.database {
            if !self.database.starts_with(db.as_str()) {
                return false;
            }
        }
        if let Some(sub) = &hint.subsection {
            match &self.subsection {
                Some(own) => {
                    if !own.starts_with(sub.as_str()) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        true
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.location, self.database)?;
        if let Some(sub) = &self.subsection {
            write!(f, "-{sub}")?;
        }
        Ok(())
    }
}

/// Partial source name as given on the command line: `loc[-db[-sub]]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceHint {
    pub location: String,
    pub database: Option<String>,
    pub subsection: Option<String>,
}

impl FromStr for SourceHint {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(PipelineError::InvalidSource(value.to_string()));
        }
        let mut parts = trimmed.splitn(3, '-');
        let location = parts.next().unwrap_or_default().to_string();
        if location.is_empty() {
            return Err(PipelineError::InvalidSource(value.to_string()));
        }
        Ok(Self {
            location,
            database: parts.next().map(str::to_string),
            subsection: parts.next().map(str::to_string),
        })
    }
}

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Download,
    Processing,
    Conversion,
    Compile,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::Download,
        Stage::Processing,
        Stage::Conversion,
        Stage::Compile,
    ];

    /// Stages from Download up to and including `self`.
    pub fn chain(self) -> impl Iterator<Item = Stage> {
        Stage::ALL.into_iter().filter(move |stage| *stage <= self)
    }

    pub fn predecessor(self) -> Option<Stage> {
        match self {
            Stage::Download => None,
            Stage::Processing => Some(Stage::Download),
            Stage::Conversion => Some(Stage::Processing),
            Stage::Compile => Some(Stage::Conversion),
        }
    }

    /// Subdirectory of `data/` owned by this stage.
    pub fn dir_name(self) -> &'static str {
        match self {
            Stage::Download => "download",
            Stage::Processing => "processing",
            Stage::Conversion => "converted",
            Stage::Compile => "compiled",
        }
    }
}

impl FromStr for Stage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "download" => Ok(Stage::Download),
            "process" | "processing" => Ok(Stage::Processing),
            "convert" | "conversion" => Ok(Stage::Conversion),
            "compile" => Ok(Stage::Compile),
            other => Err(PipelineError::UnknownStage(other.to_string())),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Download => write!(f, "download"),
            Stage::Processing => write!(f, "processing"),
            Stage::Conversion => write!(f, "conversion"),
            Stage::Compile => write!(f, "compile"),
        }
    }
}

/// Fixed biological-workflow buckets the converter routes columns into,
/// plus the synthetic `preserved` and `unmapped` buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Event {
    Collection,
    Accession,
    SamplePrep,
    Extraction,
    Sequencing,
    Assembly,
    Annotation,
    RecordLevel,
    Preserved,
    Unmapped,
}

impl Event {
    pub const CANONICAL: [Event; 8] = [
        Event::Collection,
        Event::Accession,
        Event::SamplePrep,
        Event::Extraction,
        Event::Sequencing,
        Event::Assembly,
        Event::Annotation,
        Event::RecordLevel,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Event::Collection => "collection",
            Event::Accession => "accession",
            Event::SamplePrep => "sample prep",
            Event::Extraction => "extraction",
            Event::Sequencing => "sequencing",
            Event::Assembly => "assembly",
            Event::Annotation => "annotation",
            Event::RecordLevel => "record level",
            Event::Preserved => "preserved",
            Event::Unmapped => "unmapped",
        }
    }

    /// File stem used inside a stacked output directory.
    pub fn file_stem(self) -> String {
        self.as_str().replace(' ', "_")
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Event {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "collection" => Ok(Event::Collection),
            "accession" => Ok(Event::Accession),
            "sample prep" | "sample_prep" => Ok(Event::SamplePrep),
            "extraction" => Ok(Event::Extraction),
            "sequencing" => Ok(Event::Sequencing),
            "assembly" => Ok(Event::Assembly),
            "annotation" => Ok(Event::Annotation),
            "record level" | "record_level" => Ok(Event::RecordLevel),
            "preserved" => Ok(Event::Preserved),
            "unmapped" => Ok(Event::Unmapped),
            other => Err(PipelineError::UnknownEvent(other.to_string())),
        }
    }
}

impl Serialize for Event {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Event {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

/// Concrete on-disk representation of a data file, derived from the path
/// suffix. A path with no suffix is a stacked directory of per-event files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    Csv,
    Tsv,
    Parquet,
    Stacked,
    Unknown,
}

impl FileFormat {
    pub fn from_path(path: &Utf8Path) -> Self {
        match path.extension() {
            None => FileFormat::Stacked,
            Some("csv") => FileFormat::Csv,
            Some("tsv") | Some("tab") => FileFormat::Tsv,
            Some("parquet") => FileFormat::Parquet,
            Some(_) => FileFormat::Unknown,
        }
    }

    pub fn extension(self) -> Option<&'static str> {
        match self {
            FileFormat::Csv => Some("csv"),
            FileFormat::Tsv => Some("tsv"),
            FileFormat::Parquet => Some("parquet"),
            FileFormat::Stacked | FileFormat::Unknown => None,
        }
    }

    pub fn delimiter(self) -> Option<u8> {
        match self {
            FileFormat::Csv => Some(b','),
            FileFormat::Tsv => Some(b'\t'),
            _ => None,
        }
    }

    pub fn is_tabular(self) -> bool {
        matches!(
            self,
            FileFormat::Csv | FileFormat::Tsv | FileFormat::Parquet | FileFormat::Stacked
        )
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileFormat::Csv => write!(f, "csv"),
            FileFormat::Tsv => write!(f, "tsv"),
            FileFormat::Parquet => write!(f, "parquet"),
            FileFormat::Stacked => write!(f, "stacked"),
            FileFormat::Unknown => write!(f, "unknown"),
        }
    }
}
