use std::collections::{BTreeMap, HashMap};

use camino::Utf8Path;
use tracing::debug;

use crate::datafile::DataFile;
use crate::domain::Event;
use crate::error::PipelineError;
use crate::frame::Frame;

/// A remap target: which event bucket a column lands in, under which
/// canonical name.
pub type Target = (Event, String);

/// Rewrite rules `original column -> [(event, canonical name)]`, loaded from
/// a three-column mapping table.
#[derive(Debug, Clone, Default)]
pub struct Mapping {
    entries: HashMap<String, Vec<Target>>,
    canonical: Vec<String>,
}

impl Mapping {
    pub fn insert(&mut self, original: &str, event: Event, canonical: &str) {
        self.entries
            .entry(original.to_string())
            .or_default()
            .push((event, canonical.to_string()));
        if !self.canonical.iter().any(|name| name == canonical) {
            self.canonical.push(canonical.to_string());
        }
    }

    pub fn targets(&self, original: &str) -> &[Target] {
        self.entries
            .get(original)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn is_canonical(&self, name: &str) -> bool {
        self.canonical.iter().any(|canonical| canonical == name)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Load `<maps_dir>/<map_id>.csv` with columns
    /// `original_name,event,canonical_name`.
    pub fn load(maps_dir: &Utf8Path, map_id: &str) -> Result<Self, PipelineError> {
        let path = maps_dir.join(format!("{map_id}.csv"));
        if !path.as_std_path().exists() {
            return Err(PipelineError::MappingNotFound(path.to_string()));
        }
        let frame = DataFile::new(path).read()?;
        Self::from_frame(&frame)
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, PipelineError> {
        let mut mapping = Mapping::default();
        for row in 0..frame.n_rows() {
            let (Some(original), Some(event), Some(canonical)) = (
                frame.get(row, "original_name"),
                frame.get(row, "event"),
                frame.get(row, "canonical_name"),
            ) else {
                continue;
            };
            let event: Event = event.parse()?;
            mapping.insert(original, event, canonical);
        }
        Ok(mapping)
    }
}

/// Per-source-column translation entry; `targets` is non-empty once the
/// fallback has been applied.
#[derive(Debug, Clone, PartialEq)]
pub struct TranslationEntry {
    pub source: String,
    pub targets: Vec<Target>,
}

/// Materialized mapping for one concrete column list.
#[derive(Debug, Clone, Default)]
pub struct TranslationTable {
    entries: Vec<TranslationEntry>,
}

impl TranslationTable {
    pub fn entries(&self) -> &[TranslationEntry] {
        &self.entries
    }

    /// Source columns whose every target fell back to the unmapped bucket.
    pub fn unmapped_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| {
                entry
                    .targets
                    .iter()
                    .all(|(event, _)| *event == Event::Unmapped)
            })
            .count()
    }

    /// Targets claimed by more than one source column.
    pub fn non_unique(&self) -> Vec<(Target, Vec<String>)> {
        let mut seen: Vec<(Target, Vec<String>)> = Vec::new();
        for entry in &self.entries {
            for target in &entry.targets {
                match seen.iter_mut().find(|(known, _)| known == target) {
                    Some((_, sources)) => sources.push(entry.source.clone()),
                    None => seen.push((target.clone(), vec![entry.source.clone()])),
                }
            }
        }
        seen.into_iter()
            .filter(|(_, sources)| sources.len() > 1)
            .collect()
    }

    pub fn all_unique(&self) -> bool {
        self.non_unique().is_empty()
    }

    /// Keep only the first source column per target, in column order.
    pub fn force_unique(&mut self) {
        let mut claimed: Vec<Target> = Vec::new();
        for entry in &mut self.entries {
            entry.targets.retain(|target| {
                if claimed.contains(target) {
                    false
                } else {
                    claimed.push(target.clone());
                    true
                }
            });
        }
        self.entries.retain(|entry| !entry.targets.is_empty());
    }

    /// Route a frame's columns into per-event frames, with every routed
    /// column carrying its canonical name. Row order is preserved within
    /// every event frame.
    pub fn apply(&self, frame: &Frame) -> Result<BTreeMap<Event, Frame>, PipelineError> {
        let mut per_event: BTreeMap<Event, Vec<(String, String)>> = BTreeMap::new();
        for entry in &self.entries {
            for (event, canonical) in &entry.targets {
                per_event
                    .entry(*event)
                    .or_default()
                    .push((entry.source.clone(), canonical.clone()));
            }
        }

        let mut out = BTreeMap::new();
        for (event, pairs) in per_event {
            // One output column per (source, canonical) pair, so a source
            // column feeding several targets lands under each canonical name.
            let kept: Vec<&(String, String)> = pairs
                .iter()
                .filter(|(source, _)| frame.has_column(source))
                .collect();
            let mut routed =
                Frame::new(kept.iter().map(|(_, canonical)| canonical.clone()).collect());
            for row_idx in 0..frame.n_rows() {
                let row = kept
                    .iter()
                    .map(|(source, _)| frame.get(row_idx, source).map(str::to_string))
                    .collect();
                routed.push_row(row)?;
            }
            out.insert(event, routed);
        }
        Ok(out)
    }
}

/// Builds translation tables from a primary mapping plus an optional custom
/// overlay, applying the preserve/prefix policies for columns the maps do
/// not cover.
#[derive(Debug, Clone)]
pub struct Remapper {
    primary: Mapping,
    overlay: Option<Mapping>,
    location: String,
    preserve_dwc_match: bool,
    prefix_missing: bool,
}

impl Remapper {
    pub fn new(
        primary: Mapping,
        overlay: Option<Mapping>,
        location: &str,
        preserve_dwc_match: bool,
        prefix_missing: bool,
    ) -> Self {
        Self {
            primary,
            overlay,
            location: location.to_string(),
            preserve_dwc_match,
            prefix_missing,
        }
    }

    pub fn build_table(&self, columns: &[String], skip_remap: &[String]) -> TranslationTable {
        let mut table = TranslationTable::default();
        for column in columns {
            if skip_remap.contains(column) {
                debug!(column = %column, "skipping remap");
                continue;
            }
            let mut targets: Vec<Target> = Vec::new();
            targets.extend(self.primary.targets(column).iter().cloned());
            if let Some(overlay) = &self.overlay {
                targets.extend(overlay.targets(column).iter().cloned());
            }
            if self.preserve_dwc_match && self.primary.is_canonical(column) {
                targets.push((
                    Event::Preserved,
                    format!("{}_{column}", self.location),
                ));
            }
            if targets.is_empty() {
                let name = if self.prefix_missing {
                    format!("{}_{column}", self.location)
                } else {
                    column.clone()
                };
                targets.push((Event::Unmapped, name));
            }
            table.entries.push(TranslationEntry {
                source: column.clone(),
                targets,
            });
        }
        table
    }
}
