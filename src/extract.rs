use crate::config::ExtractConfig;
use crate::error::PipelineError;
use crate::model::AddressRecord;
use scraper::{ElementRef, Html, Selector};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

const KVHH_PRACTICE_TABLE_V1: &str = "kvhh_practice_table_v1";
const KNOWN_LAYOUTS: &[&str] = &[KVHH_PRACTICE_TABLE_V1];

/// Maps one table row of a known source layout to a record.
///
/// Returns `None` when the row does not have the shape the layout expects
/// (header rows, spacer rows); such rows are not counted as records.
pub trait RowDecoder: Send + Sync {
    fn key(&self) -> &'static str;
    fn default_row_selector(&self) -> &'static str;
    fn decode(&self, row: ElementRef<'_>) -> Option<AddressRecord>;
}

pub fn is_known_layout(key: &str) -> bool {
    KNOWN_LAYOUTS.contains(&key)
}

pub fn decoder_for_layout(key: &str) -> Result<Box<dyn RowDecoder>, PipelineError> {
    match key {
        KVHH_PRACTICE_TABLE_V1 => Ok(Box::new(KvhhPracticeTable::new()?)),
        other => Err(PipelineError::Extraction(format!(
            "no row decoder for layout {other}"
        ))),
    }
}

/// SHA-256 of the raw document, hex encoded.
pub fn fingerprint(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

pub struct Extractor {
    decoder: Box<dyn RowDecoder>,
    row_selector: Selector,
    allow_empty: bool,
}

impl Extractor {
    pub fn new(
        decoder: Box<dyn RowDecoder>,
        row_selector: Option<&str>,
        allow_empty: bool,
    ) -> Result<Self, PipelineError> {
        let selector_text = row_selector.unwrap_or_else(|| decoder.default_row_selector());
        let row_selector = parse_selector(selector_text)?;
        Ok(Self {
            decoder,
            row_selector,
            allow_empty,
        })
    }

    pub fn from_config(config: &ExtractConfig) -> Result<Self, PipelineError> {
        let decoder = decoder_for_layout(&config.layout)?;
        Self::new(decoder, config.row_selector.as_deref(), config.allow_empty)
    }

    /// Decodes every matching row, in document order.
    ///
    /// An empty result is an error unless the extractor was built with
    /// `allow_empty`.
    pub fn extract(&self, document_text: &str) -> Result<Vec<AddressRecord>, PipelineError> {
        let parsed = Html::parse_document(document_text);

        let mut records = Vec::new();
        let mut skipped = 0usize;
        for row in parsed.select(&self.row_selector) {
            match self.decoder.decode(row) {
                Some(record) => records.push(record),
                None => skipped += 1,
            }
        }

        if skipped > 0 {
            debug!(
                layout = self.decoder.key(),
                skipped, "rows did not match layout; skipped"
            );
        }

        if records.is_empty() && !self.allow_empty {
            return Err(PipelineError::Extraction("no records found".to_string()));
        }

        info!(
            layout = self.decoder.key(),
            records = records.len(),
            "extracted address records"
        );
        Ok(records)
    }
}

/// Practice table published by the KVHH:
/// `[running number][name][address as two paragraphs][hint]`.
struct KvhhPracticeTable {
    first_line: Selector,
    second_line: Selector,
}

impl KvhhPracticeTable {
    fn new() -> Result<Self, PipelineError> {
        Ok(Self {
            first_line: parse_selector("p:first-child")?,
            second_line: parse_selector("p:nth-child(2)")?,
        })
    }
}

impl RowDecoder for KvhhPracticeTable {
    fn key(&self) -> &'static str {
        KVHH_PRACTICE_TABLE_V1
    }

    fn default_row_selector(&self) -> &'static str {
        "figure.table table tbody tr"
    }

    fn decode(&self, row: ElementRef<'_>) -> Option<AddressRecord> {
        let cells: Vec<ElementRef<'_>> = row
            .children()
            .filter_map(ElementRef::wrap)
            .filter(|el| el.value().name() == "td")
            .collect();
        if cells.len() < 4 {
            return None;
        }

        let address_cell = cells[2];
        let line1 = matched_text(address_cell, &self.first_line);
        let line2 = matched_text(address_cell, &self.second_line);

        Some(AddressRecord {
            name: element_text(cells[1]),
            raw_address: format!("{} {}", line1.trim(), line2.trim()),
            rich_address: address_cell.inner_html(),
            hint: element_text(cells[3]),
            coordinates: None,
        })
    }
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

fn matched_text(cell: ElementRef<'_>, selector: &Selector) -> String {
    cell.select(selector)
        .flat_map(|el| el.text())
        .collect::<String>()
}

fn parse_selector(selector: &str) -> Result<Selector, PipelineError> {
    Selector::parse(selector)
        .map_err(|err| PipelineError::Extraction(format!("invalid selector {selector}: {err:?}")))
}
