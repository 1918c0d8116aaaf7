use crate::config::LabelsConfig;
use std::{
    fs::File,
    io::{self, BufRead},
    path::Path,
};

/// Ordered class identifiers; position `i` names output `i` of the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassLabels {
    labels: Vec<String>,
}

impl ClassLabels {
    pub fn new(labels: Vec<String>) -> Result<Self, String> {
        if labels.is_empty() {
            return Err("Label set is empty".to_string());
        }
        Ok(Self { labels })
    }

    pub fn from_config(labels_cfg: &LabelsConfig) -> Result<Self, String> {
        match load_labels(&labels_cfg.get_path()) {
            Ok(labels) => Self::new(labels),
            Err(e) => Err(format!("Failed to load labels: {}", e)),
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    pub fn position(&self, label: &str) -> Option<usize> {
        self.labels.iter().position(|l| l == label)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(String::as_str)
    }
}

pub fn load_labels(filepath: &Path) -> io::Result<Vec<String>> {
    let file = File::open(filepath)?;
    let reader = io::BufReader::new(file);
    let mut labels = Vec::new();

    for line_result in reader.lines() {
        let line = line_result?;
        let label = line.trim();
        if label.is_empty() {
            continue;
        }
        if label.contains(char::is_whitespace) || label.contains(',') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Invalid label: {}", line),
            ));
        }
        if labels.iter().any(|l: &String| l == label) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Duplicate label: {}", label),
            ));
        }
        labels.push(label.to_string());
    }

    Ok(labels)
}
