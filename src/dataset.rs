use log::debug;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::*;

/// One image of a dataset.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Root-relative path with `/` separators; stable across machines.
    pub key: String,
    pub class: String,
    pub path: PathBuf,
}

impl Record {
    pub fn read(&self) -> PhowResult<Vec<u8>> {
        Ok(std::fs::read(&self.path)?)
    }
}

/// Images grouped by class, one group per directory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupedDataset {
    groups: BTreeMap<String, Vec<Record>>,
}

impl GroupedDataset {
    /// Every subdirectory of `root` is a class, every file in it an image.
    /// Hidden entries are skipped.
    pub fn from_dir<P: AsRef<Path>>(root: P) -> PhowResult<Self> {
        let root = root.as_ref();
        let mut groups = BTreeMap::new();
        for entry in root.read_dir()? {
            let entry = entry?;
            let class = entry.file_name().to_string_lossy().into_owned();
            if class.starts_with('.') || !entry.path().is_dir() {
                continue;
            }
            let mut files: Vec<PathBuf> = entry
                .path()
                .read_dir()?
                .filter_map(|e| e.ok())
                .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
                .map(|e| e.path())
                .filter(|p| p.is_file())
                .collect();
            files.sort();
            let records: Vec<Record> = files
                .into_iter()
                .map(|path| {
                    let name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    Record {
                        key: format!("{}/{}", class, name),
                        class: class.clone(),
                        path,
                    }
                })
                .collect();
            debug!("Class {:?}: {} images", class, records.len());
            groups.insert(class, records);
        }
        Ok(Self { groups })
    }

    pub fn from_records(records: impl IntoIterator<Item = Record>) -> Self {
        let mut groups: BTreeMap<String, Vec<Record>> = BTreeMap::new();
        for r in records {
            groups.entry(r.class.clone()).or_default().push(r);
        }
        Self { groups }
    }

    /// Class names in order.
    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    pub fn group(&self, class: &str) -> Option<&[Record]> {
        self.groups.get(class).map(Vec::as_slice)
    }

    /// All records, grouped, in class then file order.
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.groups.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The first `n` classes by name.
    pub fn sample_groups(&self, n: usize) -> Self {
        Self {
            groups: self
                .groups
                .iter()
                .take(n)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Up to `per_group` records drawn at random from every class.
    pub fn sample_uniform(&self, per_group: usize, seed: u64) -> Vec<Record> {
        let mut rng = StdRng::seed_from_u64(seed);
        self.groups
            .values()
            .flat_map(|records| {
                records
                    .choose_multiple(&mut rng, per_group.min(records.len()))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Per class, shuffle then deal `train` records to the training set and
    /// the following `test` to the test set. Short classes fill training first.
    pub fn split(&self, train: usize, test: usize, seed: u64) -> (Self, Self) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut training = BTreeMap::new();
        let mut testing = BTreeMap::new();
        for (class, records) in &self.groups {
            let mut shuffled = records.clone();
            shuffled.shuffle(&mut rng);
            let n_train = train.min(shuffled.len());
            let n_test = test.min(shuffled.len() - n_train);
            let rest = shuffled.split_off(n_train);
            training.insert(class.clone(), shuffled);
            testing.insert(class.clone(), rest.into_iter().take(n_test).collect());
        }
        (Self { groups: training }, Self { groups: testing })
    }
}
