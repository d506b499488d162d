//! Read-only data injected into worker processes.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::error::{Error, Result};

/// Named byte arrays made available to every task on a machine without
/// copying them into each call.
///
/// Workers receive shared data when they are (re)started and hand it out
/// read-only through the task context. Nothing prevents a task from keeping
/// its own modified copy, but the original is never written back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SharedData {
    entries: BTreeMap<String, Vec<u8>>,
}

impl SharedData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, bytes: Vec<u8>) {
        self.entries.insert(name.to_string(), bytes);
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries.get(name).map(|b| b.as_slice())
    }

    /// Stores an array of floats in little-endian layout.
    pub fn insert_f64s(&mut self, name: &str, values: &[f64]) {
        let mut bytes = Vec::with_capacity(values.len() * 8);
        for v in values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        self.insert(name, bytes);
    }

    pub fn get_f64s(&self, name: &str) -> Result<Vec<f64>> {
        let bytes = self
            .get(name)
            .ok_or_else(|| Error::Other(format!("no shared entry named: {}", name)))?;
        if bytes.len() % 8 != 0 {
            return Err(Error::ParsingError(format!(
                "shared entry {} is {} bytes long, not a multiple of 8",
                name,
                bytes.len()
            )));
        }
        Ok(bytes
            .chunks_exact(8)
            .map(|c| {
                let mut arr = [0u8; 8];
                arr.copy_from_slice(c);
                f64::from_le_bytes(arr)
            })
            .collect())
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(|s| s.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total size of all entries in bytes.
    pub fn size(&self) -> usize {
        self.entries.values().map(|b| b.len()).sum()
    }

    pub fn to_file(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        bincode::serialize_into(BufWriter::new(file), self)?;
        debug!(
            "wrote {} bytes of shared data to {}",
            self.size(),
            path.display()
        );
        Ok(())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(bincode::deserialize_from(BufReader::new(file))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_arrays() {
        let mut shared = SharedData::new();
        shared.insert_f64s("weights", &[0.5, -1.25, 3.0]);
        assert_eq!(shared.get_f64s("weights").unwrap(), vec![0.5, -1.25, 3.0]);
        shared.insert("odd", vec![1, 2, 3]);
        assert!(shared.get_f64s("odd").is_err());
        assert!(shared.get_f64s("missing").is_err());
    }

    #[test]
    fn file_round_trip() {
        let mut shared = SharedData::new();
        shared.insert("blob", vec![7; 1024]);
        let path = std::env::temp_dir().join(format!("spindle-shared-{}", std::process::id()));
        shared.to_file(&path).unwrap();
        let loaded = SharedData::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(shared, loaded);
    }
}
