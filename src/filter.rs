use crate::model::{AddressRecord, MapEntry};

/// Keeps the records that carry coordinates, in their original order.
pub fn select(records: Vec<AddressRecord>) -> Vec<AddressRecord> {
    records.into_iter().filter(AddressRecord::is_resolved).collect()
}

pub fn to_map_entries(records: Vec<AddressRecord>) -> Vec<MapEntry> {
    records
        .into_iter()
        .filter_map(|record| {
            let coordinates = record.coordinates?;
            Some(MapEntry {
                name: record.name,
                address: record.rich_address,
                hint: record.hint,
                lat: coordinates.lat,
                lng: coordinates.lng,
            })
        })
        .collect()
}
