//! Dataset manifests and the label vocabulary.
//!
//! A manifest lists one sample per line as `<image path><sep><label>`, where
//! the separator is a comma, a tab or plain whitespace and the label is
//! either an index into the vocabulary or one of its class names. The
//! vocabulary lives in `labels.txt` next to the manifest, one name per line.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;
use vision_core::{Error, ImageSample, Result, SplitMode};

/// File name of the label vocabulary beside every manifest
pub const LABELS_FILE: &str = "labels.txt";

/// Immutable index to class-name mapping for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelVocabulary {
    names: Vec<String>,
    index: HashMap<String, usize>,
}

impl LabelVocabulary {
    pub fn new(names: Vec<String>) -> Result<Self> {
        let mut index = HashMap::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            if index.insert(name.clone(), i).is_some() {
                return Err(Error::Dataset(format!("duplicate class name '{name}'")));
            }
        }
        Ok(Self { names, index })
    }

    /// Reads a line-oriented label file, skipping blank lines
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::Dataset(format!("Failed to read label file {}: {e}", path.display()))
        })?;
        let names: Vec<String> = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        if names.is_empty() {
            return Err(Error::Dataset(format!("label file {} is empty", path.display())));
        }
        Self::new(names)
    }

    /// Loads `labels.txt` from the directory of `manifest`
    pub fn for_manifest(manifest: &Path) -> Result<Self> {
        Self::load(&labels_path(manifest))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn name(&self, label: usize) -> Option<&str> {
        self.names.get(label).map(String::as_str)
    }

    /// Index to name mapping, used to relabel reports
    pub fn as_map(&self) -> BTreeMap<usize, String> {
        self.names.iter().cloned().enumerate().collect()
    }

    /// Resolves a manifest label field, numeric index or class name
    pub fn resolve(&self, field: &str) -> Option<usize> {
        match field.parse::<usize>() {
            Ok(label) if label < self.names.len() => Some(label),
            Ok(_) => None,
            Err(_) => self.index.get(field).copied(),
        }
    }
}

/// Path of the label vocabulary for a manifest
pub fn labels_path(manifest: &Path) -> PathBuf {
    manifest
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(LABELS_FILE)
}

/// Parsed dataset manifest
#[derive(Debug, Clone)]
pub struct Manifest {
    samples: Vec<ImageSample>,
}

impl Manifest {
    /// Reads a manifest file, resolving labels against `vocabulary`
    pub fn load(path: &Path, vocabulary: &LabelVocabulary) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::Dataset(format!("Failed to read manifest {}: {e}", path.display()))
        })?;
        let root = path.parent().unwrap_or_else(|| Path::new("."));
        let manifest = Self::parse(&content, root, vocabulary)?;
        debug!(
            "Loaded {} samples from {}",
            manifest.samples.len(),
            path.display()
        );
        Ok(manifest)
    }

    /// Parses manifest text; relative paths are joined onto `root`
    pub fn parse(content: &str, root: &Path, vocabulary: &LabelVocabulary) -> Result<Self> {
        let mut samples = Vec::new();

        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (path, label) = split_line(line).ok_or_else(|| {
                Error::Dataset(format!(
                    "line {}: expected '<path> <label>', got '{line}'",
                    line_no + 1
                ))
            })?;
            let label = vocabulary.resolve(label).ok_or_else(|| {
                Error::Dataset(format!("line {}: unknown label '{label}'", line_no + 1))
            })?;

            let path = Path::new(path);
            let path = if path.is_absolute() {
                path.to_path_buf()
            } else {
                root.join(path)
            };
            samples.push(ImageSample::new(path, label));
        }

        Ok(Self { samples })
    }

    pub fn samples(&self) -> &[ImageSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Selects the samples of one split.
    ///
    /// `Train` takes the first `ceil(ratio * n)` samples of every class in
    /// manifest order and `Val` the rest, so the two never overlap.
    pub fn split(&self, mode: SplitMode, ratio: f64) -> Vec<ImageSample> {
        if mode == SplitMode::Test {
            return self.samples.clone();
        }

        let mut per_class: BTreeMap<usize, usize> = BTreeMap::new();
        for sample in &self.samples {
            *per_class.entry(sample.label).or_default() += 1;
        }
        let quota: BTreeMap<usize, usize> = per_class
            .into_iter()
            .map(|(label, count)| (label, (ratio * count as f64 - 1e-9).ceil() as usize))
            .collect();

        let mut seen: BTreeMap<usize, usize> = BTreeMap::new();
        self.samples
            .iter()
            .filter(|sample| {
                let position = seen.entry(sample.label).or_default();
                let in_train = *position < quota[&sample.label];
                *position += 1;
                match mode {
                    SplitMode::Train => in_train,
                    _ => !in_train,
                }
            })
            .cloned()
            .collect()
    }
}

fn split_line(line: &str) -> Option<(&str, &str)> {
    let (at, sep) = line
        .char_indices()
        .rev()
        .find(|&(_, c)| c == ',' || c.is_whitespace())?;
    let path = line[..at].trim_end_matches(|c: char| c == ',' || c.is_whitespace());
    let label = line[at + sep.len_utf8()..].trim();
    if path.is_empty() || label.is_empty() {
        return None;
    }
    Some((path, label))
}
