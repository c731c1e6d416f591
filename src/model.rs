use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

/// One row of the source table.
///
/// `coordinates` is absent until the geocoder resolves `raw_address`; the
/// latitude and longitude always travel together.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AddressRecord {
    pub name: String,
    pub raw_address: String,
    pub rich_address: String,
    pub hint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
}

impl AddressRecord {
    pub fn is_resolved(&self) -> bool {
        self.coordinates.is_some()
    }

    pub fn with_coordinates(self, coordinates: Coordinates) -> Self {
        Self {
            coordinates: Some(coordinates),
            ..self
        }
    }
}

/// Display-facing view of a resolved record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MapEntry {
    pub name: String,
    pub address: String,
    pub hint: String,
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resource {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PageData {
    pub resources: Vec<Resource>,
    pub addresses: Vec<MapEntry>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub source_key: String,
    pub rows_extracted: usize,
    pub extraction_cache_hit: bool,
    pub geocode_requests: usize,
    pub geocode_cache_hits: usize,
    pub failed_lookups: usize,
    pub resolved: usize,
    pub unresolved: usize,
}
