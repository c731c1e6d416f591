use crate::cache::Cache;
use crate::config::{LoadedConfig, load_config, resolve_path};
use crate::error::PipelineError;
use crate::extract::{Extractor, fingerprint};
use crate::fetch::{FetchedDocument, fetch_source_document};
use crate::filter::{select, to_map_entries};
use crate::geocode::{GeocodeBackend, Geocoder, HttpGeocoder};
use crate::model::{AddressRecord, PageData, RunReport};
use crate::store::CacheFile;
use anyhow::{Context, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub page: PageData,
    pub report: RunReport,
}

/// Fetch, extract, geocode and filter one configured source.
///
/// A `Pipeline` can be run repeatedly; its in-memory cache carries over
/// between runs.
pub struct Pipeline {
    source: LoadedConfig,
    extractor: Extractor,
    geocoder: Geocoder,
    cache: Option<Cache>,
}

impl Pipeline {
    /// Builds a pipeline that geocodes over HTTP. The api key is read from
    /// the environment here, before any request is made.
    pub fn from_config(source: LoadedConfig) -> Result<Self> {
        let backend = HttpGeocoder::from_config(&source.config.geocode)
            .with_context(|| format!("geocoder setup failed for {}", source.config.source.key))?;
        Self::with_backend(source, Box::new(backend))
    }

    pub fn with_backend(source: LoadedConfig, backend: Box<dyn GeocodeBackend>) -> Result<Self> {
        let extractor = Extractor::from_config(&source.config.extract)?;
        let geocode = &source.config.geocode;
        let geocoder = Geocoder::new(backend, geocode.max_concurrency, geocode.on_lookup_failure)?;
        let cache = source
            .config
            .cache
            .enabled
            .then(|| Cache::new(source.config.cache.ttl_secs));

        Ok(Self {
            source,
            extractor,
            geocoder,
            cache,
        })
    }

    /// Replaces the in-memory cache, e.g. with one loaded from disk. Ignored
    /// when caching is disabled.
    pub fn with_cache(mut self, cache: Cache) -> Self {
        if self.cache.is_some() {
            self.cache = Some(cache);
        }
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.cache = None;
        self
    }

    pub fn cache(&self) -> Option<&Cache> {
        self.cache.as_ref()
    }

    pub fn cache_mut(&mut self) -> Option<&mut Cache> {
        self.cache.as_mut()
    }

    pub fn run(&mut self) -> Result<PipelineOutput, PipelineError> {
        let key = self.source.config.source.key.clone();
        info!(source = %key, "pipeline start");

        let doc = fetch_source_document(&self.source)?;
        let (records, extraction_cache_hit) = self.extract_records(&doc)?;
        let rows_extracted = records.len();

        let enrichment = self.geocoder.enrich(records, self.cache.as_mut())?;
        let selected = select(enrichment.records);
        let resolved = selected.len();

        let report = RunReport {
            source_key: key.clone(),
            rows_extracted,
            extraction_cache_hit,
            geocode_requests: enrichment.requests,
            geocode_cache_hits: enrichment.cache_hits,
            failed_lookups: enrichment.failed,
            resolved,
            unresolved: rows_extracted - resolved,
        };

        info!(
            source = %key,
            rows = report.rows_extracted,
            resolved = report.resolved,
            unresolved = report.unresolved,
            policy = ?self.geocoder.policy(),
            "pipeline complete"
        );

        Ok(PipelineOutput {
            page: PageData {
                resources: self.source.config.resources(),
                addresses: to_map_entries(selected),
            },
            report,
        })
    }

    fn extract_records(
        &mut self,
        doc: &FetchedDocument,
    ) -> Result<(Vec<AddressRecord>, bool), PipelineError> {
        let now = Utc::now();
        let digest = fingerprint(&doc.body);

        if let Some(records) = self
            .cache
            .as_ref()
            .and_then(|cache| cache.document(&digest, now))
        {
            info!(
                source = %self.source.config.source.key,
                fingerprint = %digest,
                records = records.len(),
                "document unchanged; reusing cached extraction"
            );
            return Ok((records, true));
        }

        let records = self.extractor.extract(&doc.text())?;
        if let Some(cache) = self.cache.as_mut() {
            cache.store_document(&digest, &records, now);
        }
        Ok((records, false))
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub config_path: PathBuf,
    pub use_cache: bool,
}

/// Loads config and the persisted cache, runs once, and writes the cache
/// back on success.
pub fn run_configured(options: &RunOptions) -> Result<PipelineOutput> {
    let source = load_config(&options.config_path)?;
    let cache_file = cache_file_for(&source)?;
    let key = source.config.source.key.clone();

    let mut pipeline = Pipeline::from_config(source)?;
    if !options.use_cache {
        pipeline = pipeline.without_cache();
    } else if let Some(file) = &cache_file {
        pipeline = pipeline.with_cache(file.load_or_empty());
    }

    let output = pipeline
        .run()
        .with_context(|| format!("pipeline run failed for source {key}"))?;

    if let (Some(file), Some(cache)) = (&cache_file, pipeline.cache_mut()) {
        let pruned = file.save(cache, Utc::now())?;
        info!(cache = %file.path().display(), pruned, "cache written");
    }

    Ok(output)
}

pub fn extract_configured(config_path: &Path) -> Result<Vec<AddressRecord>> {
    let source = load_config(config_path)?;
    let key = source.config.source.key.clone();
    let extractor = Extractor::from_config(&source.config.extract)?;
    let doc = fetch_source_document(&source)
        .with_context(|| format!("fetch failed for source {key}"))?;
    let records = extractor
        .extract(&doc.text())
        .with_context(|| format!("extraction failed for source {key}"))?;
    Ok(records)
}

pub fn validate_config(config_path: &Path) -> Result<String> {
    let source = load_config(config_path)?;
    Extractor::from_config(&source.config.extract)?;
    if source.config.geocode.resolve_api_key().is_err() {
        warn!(
            env = %source.config.geocode.api_key_env,
            "geocoding api key is not set; `run` will fail"
        );
    }
    Ok(format!(
        "OK: {} ({})",
        source.config.source.key,
        source.path.display()
    ))
}

fn cache_file_for(source: &LoadedConfig) -> Result<Option<CacheFile>> {
    let cache = &source.config.cache;
    if !cache.enabled {
        return Ok(None);
    }
    cache
        .path
        .as_ref()
        .map(|path| {
            resolve_path(&source.path, path).map(|path| CacheFile::new(path, cache.ttl_secs))
        })
        .transpose()
}
