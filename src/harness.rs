use crate::config::load_config;
use crate::geocode::GeocodeBackend;
use crate::pipeline::Pipeline;
use anyhow::Result;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct HarnessOptions {
    pub config_path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct HarnessReport {
    pub first_run_rows: usize,
    pub first_run_resolved: usize,
    pub first_run_geocode_requests: usize,
    pub second_run_extraction_cache_hit: bool,
    pub second_run_geocode_requests: usize,
    pub second_run_geocode_cache_hits: usize,
    pub outputs_identical: bool,
}

/// Runs the configured pipeline twice against one in-memory cache. A stable
/// source should produce identical output and no second-run lookups.
pub fn run_harness(options: &HarnessOptions) -> Result<HarnessReport> {
    let source = load_config(&options.config_path)?;
    let pipeline = Pipeline::from_config(source)?;
    run_twice(pipeline)
}

pub fn run_harness_with_backend(
    options: &HarnessOptions,
    backend: Box<dyn GeocodeBackend>,
) -> Result<HarnessReport> {
    let source = load_config(&options.config_path)?;
    let pipeline = Pipeline::with_backend(source, backend)?;
    run_twice(pipeline)
}

fn run_twice(mut pipeline: Pipeline) -> Result<HarnessReport> {
    let first = pipeline.run()?;
    let second = pipeline.run()?;

    Ok(HarnessReport {
        first_run_rows: first.report.rows_extracted,
        first_run_resolved: first.report.resolved,
        first_run_geocode_requests: first.report.geocode_requests,
        second_run_extraction_cache_hit: second.report.extraction_cache_hit,
        second_run_geocode_requests: second.report.geocode_requests,
        second_run_geocode_cache_hits: second.report.geocode_cache_hits,
        outputs_identical: first.page == second.page,
    })
}
