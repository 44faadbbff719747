use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

/// Which branch identifiers were hit under which label during one test.
///
/// Probes may run on any thread of the agent process.
#[derive(Debug, Default)]
pub struct LocationTable {
    hits: Mutex<BTreeMap<String, BTreeSet<u32>>>,
}

impl LocationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, id: u32, label: &str) {
        let mut hits = self.hits.lock().unwrap_or_else(|e| e.into_inner());
        match hits.get_mut(label) {
            Some(ids) => {
                ids.insert(id);
            }
            None => {
                hits.insert(label.to_string(), BTreeSet::from([id]));
            }
        }
    }

    pub fn clear(&self) {
        self.hits.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn is_empty(&self) -> bool {
        self.hits.lock().unwrap_or_else(|e| e.into_inner()).is_empty()
    }

    /// One `label;count` line per label, where count is the number of
    /// distinct identifiers hit.
    pub fn render(&self) -> String {
        self.hits
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(label, ids)| format!("{label};{}", ids.len()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
