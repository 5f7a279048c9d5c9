//! The TCP listener port table.
//!
//! Every TCP user-service port is assigned a listener port on the mesh
//! nodes from a fixed range. The assignment must survive restarts, so the
//! table is serializable to the flat `"<listener>" -> "<ns>/<name>:<port>"`
//! mapping persisted by the controller.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The user service port a listener is assigned to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePortRef {
    pub namespace: String,
    pub name: String,
    pub port: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum PortsError {
    #[error("TCP listener port range {0}-{1} is exhausted")]
    PortsExhausted(u16, u16),

    #[error("malformed port-state entry {key:?} -> {value:?}")]
    MalformedEntry { key: String, value: String },
}

/// In-memory listener port assignments over an inclusive range.
#[derive(Clone, Debug)]
pub struct PortStateTable {
    min: u16,
    max: u16,
    entries: BTreeMap<u16, ServicePortRef>,
}

// === impl PortStateTable ===

impl PortStateTable {
    pub fn new(min: u16, max: u16) -> Self {
        Self {
            min,
            max,
            entries: BTreeMap::new(),
        }
    }

    /// Returns the listener already assigned to the given service port.
    pub fn find(&self, name: &str, namespace: &str, port: u16) -> Option<u16> {
        self.entries
            .iter()
            .find(|(_, sp)| sp.name == name && sp.namespace == namespace && sp.port == port)
            .map(|(listener, _)| *listener)
    }

    /// Assigns the smallest unused listener in the range to the given
    /// service port. An existing assignment is returned as-is.
    pub fn add(&mut self, name: &str, namespace: &str, port: u16) -> Result<u16, PortsError> {
        if let Some(listener) = self.find(name, namespace, port) {
            return Ok(listener);
        }

        let listener = (self.min..=self.max)
            .find(|candidate| !self.entries.contains_key(candidate))
            .ok_or(PortsError::PortsExhausted(self.min, self.max))?;
        self.entries.insert(
            listener,
            ServicePortRef {
                namespace: namespace.to_string(),
                name: name.to_string(),
                port,
            },
        );
        Ok(listener)
    }

    /// Purges every assignment held by the given service. Returns the
    /// listeners that were released.
    pub fn remove(&mut self, name: &str, namespace: &str) -> Vec<u16> {
        let released: Vec<u16> = self
            .entries
            .iter()
            .filter(|(_, sp)| sp.name == name && sp.namespace == namespace)
            .map(|(listener, _)| *listener)
            .collect();
        for listener in &released {
            self.entries.remove(listener);
        }
        released
    }

    pub fn entries(&self) -> impl Iterator<Item = (u16, &ServicePortRef)> {
        self.entries.iter().map(|(listener, sp)| (*listener, sp))
    }

    /// Serializes to the persisted flat mapping.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|(listener, sp)| {
                (
                    listener.to_string(),
                    format!("{}/{}:{}", sp.namespace, sp.name, sp.port),
                )
            })
            .collect()
    }

    /// Restores a table from the persisted flat mapping. Entries outside
    /// the configured range are kept so that an operator shrinking the
    /// range does not orphan live assignments.
    pub fn from_map(
        min: u16,
        max: u16,
        map: &BTreeMap<String, String>,
    ) -> Result<Self, PortsError> {
        let mut table = Self::new(min, max);
        for (key, value) in map {
            let malformed = || PortsError::MalformedEntry {
                key: key.clone(),
                value: value.clone(),
            };

            let listener: u16 = key.parse().map_err(|_| malformed())?;
            let (namespace, rest) = value.split_once('/').ok_or_else(malformed)?;
            let (name, port) = rest.rsplit_once(':').ok_or_else(malformed)?;
            let port: u16 = port.parse().map_err(|_| malformed())?;
            if namespace.is_empty() || name.is_empty() {
                return Err(malformed());
            }

            table.entries.insert(
                listener,
                ServicePortRef {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    port,
                },
            );
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_first_unused_slot() {
        let mut table = PortStateTable::new(10000, 10200);
        assert_eq!(table.add("db", "default", 5432).unwrap(), 10000);
        assert_eq!(table.add("cache", "default", 6379).unwrap(), 10001);

        // Existing assignments are reused, not reallocated.
        assert_eq!(table.add("db", "default", 5432).unwrap(), 10000);
        assert_eq!(table.find("db", "default", 5432), Some(10000));
    }

    #[test]
    fn add_remove_add_reuses_slot() {
        let mut table = PortStateTable::new(10000, 10200);
        assert_eq!(table.add("db", "default", 5432).unwrap(), 10000);
        assert_eq!(table.remove("db", "default"), vec![10000]);
        assert_eq!(table.add("db", "default", 5432).unwrap(), 10000);
    }

    #[test]
    fn remove_purges_all_ports_of_a_service() {
        let mut table = PortStateTable::new(10000, 10200);
        table.add("db", "default", 5432).unwrap();
        table.add("db", "default", 5433).unwrap();
        table.add("cache", "default", 6379).unwrap();

        assert_eq!(table.remove("db", "default"), vec![10000, 10001]);
        assert_eq!(table.find("cache", "default", 6379), Some(10002));
        assert_eq!(table.find("db", "default", 5432), None);
    }

    #[test]
    fn exhausted_range_is_an_error() {
        let mut table = PortStateTable::new(10000, 10001);
        table.add("a", "default", 1).unwrap();
        table.add("b", "default", 2).unwrap();
        assert!(matches!(
            table.add("c", "default", 3),
            Err(PortsError::PortsExhausted(10000, 10001))
        ));
    }

    #[test]
    fn map_roundtrip() {
        let mut table = PortStateTable::new(10000, 10200);
        table.add("db", "default", 5432).unwrap();
        table.add("cache", "prod", 6379).unwrap();

        let map = table.to_map();
        assert_eq!(map.get("10000").unwrap(), "default/db:5432");
        assert_eq!(map.get("10001").unwrap(), "prod/cache:6379");

        let restored = PortStateTable::from_map(10000, 10200, &map).unwrap();
        assert_eq!(restored.find("db", "default", 5432), Some(10000));
        assert_eq!(restored.find("cache", "prod", 6379), Some(10001));
    }

    #[test]
    fn malformed_entries_are_rejected() {
        let mut map = BTreeMap::new();
        map.insert("not-a-port".to_string(), "default/db:5432".to_string());
        assert!(PortStateTable::from_map(10000, 10200, &map).is_err());

        let mut map = BTreeMap::new();
        map.insert("10000".to_string(), "missing-separator".to_string());
        assert!(PortStateTable::from_map(10000, 10200, &map).is_err());
    }
}
