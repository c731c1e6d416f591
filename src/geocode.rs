use crate::cache::Cache;
use crate::config::{FailurePolicy, GeocodeConfig};
use crate::error::PipelineError;
use crate::model::{AddressRecord, Coordinates};
use anyhow::{Context, Result};
use chrono::Utc;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use reqwest::blocking::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Answer of a lookup that reached the service.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LookupOutcome {
    Resolved(Coordinates),
    /// The service has no usable location for the address.
    NotFound,
    /// The service answered with an error status (bad key, quota). The
    /// record stays unresolved and the outcome is not cached.
    Unavailable,
}

impl LookupOutcome {
    pub fn coordinates(self) -> Option<Coordinates> {
        match self {
            LookupOutcome::Resolved(coordinates) => Some(coordinates),
            LookupOutcome::NotFound | LookupOutcome::Unavailable => None,
        }
    }

    pub fn is_cacheable(self) -> bool {
        !matches!(self, LookupOutcome::Unavailable)
    }
}

/// Resolves a single postal address.
///
/// Only transport failures, non-success HTTP statuses and undecodable bodies
/// are errors; everything else is a [`LookupOutcome`].
pub trait GeocodeBackend: Send + Sync {
    fn lookup(&self, address: &str) -> Result<LookupOutcome, PipelineError>;
}

impl<T: GeocodeBackend + ?Sized> GeocodeBackend for Arc<T> {
    fn lookup(&self, address: &str) -> Result<LookupOutcome, PipelineError> {
        (**self).lookup(address)
    }
}

/// Google-style geocoding endpoint: `GET <endpoint>?address=..&key=..`.
pub struct HttpGeocoder {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl HttpGeocoder {
    pub fn new(config: &GeocodeConfig, api_key: String) -> Result<Self> {
        let mut builder = Client::builder().timeout(Duration::from_secs(config.timeout_secs));
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder
            .build()
            .context("failed to build geocoding http client")?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key,
        })
    }

    pub fn from_config(config: &GeocodeConfig) -> Result<Self> {
        let api_key = config.resolve_api_key()?;
        Self::new(config, api_key)
    }
}

impl GeocodeBackend for HttpGeocoder {
    fn lookup(&self, address: &str) -> Result<LookupOutcome, PipelineError> {
        // The request url carries the api key, so it is stripped from errors.
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("address", address), ("key", self.api_key.as_str())])
            .send()
            .map_err(|err| PipelineError::geocode(address, err.without_url()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::geocode(
                address,
                format!("geocoding service returned {status}"),
            ));
        }

        let payload = response
            .json::<GeocodeResponse>()
            .map_err(|err| PipelineError::geocode(address, err.without_url()))?;

        Ok(payload.outcome(address))
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct GeocodeResponse {
    #[serde(default)]
    pub results: Option<Vec<GeocodeCandidate>>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeocodeCandidate {
    #[serde(default)]
    pub geometry: Option<Geometry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Geometry {
    #[serde(default)]
    pub location: Option<WireLocation>,
}

/// `location` as sent; either half may be missing.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct WireLocation {
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lng: Option<f64>,
}

impl GeocodeResponse {
    /// Location of the first candidate, if it carries both coordinates.
    pub fn first_location(&self) -> Option<Coordinates> {
        let location = self
            .results
            .as_ref()?
            .first()?
            .geometry
            .as_ref()?
            .location?;
        Some(Coordinates {
            lat: location.lat?,
            lng: location.lng?,
        })
    }

    /// `status` absent, `OK` or `ZERO_RESULTS` means the answer is final.
    pub fn outcome(&self, address: &str) -> LookupOutcome {
        if let Some(service_status) = self.status.as_deref()
            && !matches!(service_status, "OK" | "ZERO_RESULTS")
        {
            warn!(
                %address,
                status = service_status,
                message = self.error_message.as_deref().unwrap_or(""),
                "geocoding service reported a non-ok status"
            );
            return LookupOutcome::Unavailable;
        }

        match self.first_location() {
            Some(coordinates) => LookupOutcome::Resolved(coordinates),
            None => LookupOutcome::NotFound,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Enrichment {
    pub records: Vec<AddressRecord>,
    pub requests: usize,
    pub cache_hits: usize,
    pub failed: usize,
}

enum Origin {
    Cache,
    Remote(LookupOutcome),
    Failed,
}

struct Resolved {
    record: AddressRecord,
    origin: Origin,
}

type Lookup = (AddressRecord, Option<Option<Coordinates>>);

pub struct Geocoder {
    backend: Box<dyn GeocodeBackend>,
    pool: ThreadPool,
    policy: FailurePolicy,
    workers: usize,
}

impl Geocoder {
    pub fn new(
        backend: Box<dyn GeocodeBackend>,
        max_concurrency: usize,
        policy: FailurePolicy,
    ) -> Result<Self, PipelineError> {
        let workers = max_concurrency.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|index| format!("geocode-{index}"))
            .build()
            .map_err(|err| PipelineError::WorkerPool(err.to_string()))?;

        Ok(Self {
            backend,
            pool,
            policy,
            workers,
        })
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Adds coordinates to every record the backend can resolve.
    ///
    /// Cache reads happen before dispatch and cache writes after the join,
    /// both on the calling thread. Output order equals input order.
    pub fn enrich(
        &self,
        records: Vec<AddressRecord>,
        mut cache: Option<&mut Cache>,
    ) -> Result<Enrichment, PipelineError> {
        let now = Utc::now();
        let lookups: Vec<Lookup> = records
            .into_iter()
            .map(|record| {
                let cached = cache
                    .as_deref()
                    .and_then(|c| c.address(&record.raw_address, now));
                (record, cached)
            })
            .collect();

        debug!(
            records = lookups.len(),
            workers = self.workers,
            policy = ?self.policy,
            "dispatching geocode lookups"
        );

        let resolved: Vec<Resolved> = match self.policy {
            FailurePolicy::Abort => self.pool.install(|| {
                lookups
                    .into_par_iter()
                    .map(|lookup| self.resolve(lookup).map_err(|(_, err)| err))
                    .collect::<Result<Vec<_>, _>>()
            })?,
            FailurePolicy::Isolate => self.pool.install(|| {
                lookups
                    .into_par_iter()
                    .map(|lookup| {
                        self.resolve(lookup).unwrap_or_else(|(record, err)| {
                            warn!(error = %err, "geocode lookup failed; record left unresolved");
                            Resolved {
                                record,
                                origin: Origin::Failed,
                            }
                        })
                    })
                    .collect()
            }),
        };

        let mut enrichment = Enrichment::default();
        for Resolved { record, origin } in resolved {
            match origin {
                Origin::Cache => enrichment.cache_hits += 1,
                Origin::Remote(outcome) => {
                    enrichment.requests += 1;
                    if outcome.is_cacheable()
                        && let Some(cache) = cache.as_deref_mut()
                    {
                        cache.store_address(&record.raw_address, outcome.coordinates(), now);
                    }
                }
                Origin::Failed => {
                    enrichment.requests += 1;
                    enrichment.failed += 1;
                }
            }
            enrichment.records.push(record);
        }

        info!(
            records = enrichment.records.len(),
            requests = enrichment.requests,
            cache_hits = enrichment.cache_hits,
            failed = enrichment.failed,
            "geocoding complete"
        );

        Ok(enrichment)
    }

    fn resolve(
        &self,
        (record, cached): Lookup,
    ) -> Result<Resolved, (AddressRecord, PipelineError)> {
        if let Some(coordinates) = cached {
            return Ok(Resolved {
                record: apply(record, coordinates),
                origin: Origin::Cache,
            });
        }

        match self.backend.lookup(&record.raw_address) {
            Ok(outcome) => {
                debug!(
                    address = %record.raw_address,
                    ?outcome,
                    "geocode lookup finished"
                );
                Ok(Resolved {
                    record: apply(record, outcome.coordinates()),
                    origin: Origin::Remote(outcome),
                })
            }
            Err(err) => Err((record, err)),
        }
    }
}

fn apply(record: AddressRecord, coordinates: Option<Coordinates>) -> AddressRecord {
    match coordinates {
        Some(coordinates) => record.with_coordinates(coordinates),
        None => record,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    enum Answer {
        Found(f64, f64),
        Empty,
        Denied,
        Fail,
    }

    struct StubBackend {
        answers: HashMap<String, Answer>,
        calls: AtomicUsize,
    }

    impl StubBackend {
        fn new(answers: Vec<(String, Answer)>) -> Arc<Self> {
            Arc::new(Self {
                answers: answers.into_iter().collect(),
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl GeocodeBackend for StubBackend {
        fn lookup(&self, address: &str) -> Result<LookupOutcome, PipelineError> {
            let index = self.calls.fetch_add(1, Ordering::SeqCst) as u64;
            // earlier lookups finish later
            thread::sleep(Duration::from_millis(20u64.saturating_sub(index * 2)));
            match self.answers.get(address) {
                Some(Answer::Found(lat, lng)) => Ok(LookupOutcome::Resolved(Coordinates {
                    lat: *lat,
                    lng: *lng,
                })),
                Some(Answer::Empty) | None => Ok(LookupOutcome::NotFound),
                Some(Answer::Denied) => Ok(LookupOutcome::Unavailable),
                Some(Answer::Fail) => Err(PipelineError::geocode(address, "status 403")),
            }
        }
    }

    fn record(name: &str, address: &str) -> AddressRecord {
        AddressRecord {
            name: name.to_string(),
            raw_address: address.to_string(),
            rich_address: format!("<p>{address}</p>"),
            hint: String::new(),
            coordinates: None,
        }
    }

    fn geocoder(backend: &Arc<StubBackend>, policy: FailurePolicy) -> Geocoder {
        Geocoder::new(Box::new(Arc::clone(backend)), 4, policy).expect("pool builds")
    }

    #[test]
    fn preserves_input_order_under_concurrency() {
        let backend = StubBackend::new(
            (0..8)
                .map(|i| (format!("Street {i}"), Answer::Found(i as f64, 10.0)))
                .collect(),
        );
        let records = (0..8)
            .map(|i| record(&format!("r{i}"), &format!("Street {i}")))
            .collect();

        let enrichment = geocoder(&backend, FailurePolicy::Abort)
            .enrich(records, None)
            .expect("all lookups succeed");

        let names: Vec<_> = enrichment.records.iter().map(|r| r.name.clone()).collect();
        assert_eq!(names, (0..8).map(|i| format!("r{i}")).collect::<Vec<_>>());
        for (i, record) in enrichment.records.iter().enumerate() {
            assert_eq!(record.coordinates.map(|c| c.lat), Some(i as f64));
        }
        assert_eq!(enrichment.requests, 8);
    }

    #[test]
    fn empty_payload_leaves_record_unresolved() {
        let backend = StubBackend::new(vec![("Nowhere 1".to_string(), Answer::Empty)]);

        let enrichment = geocoder(&backend, FailurePolicy::Abort)
            .enrich(vec![record("a", "Nowhere 1")], None)
            .expect("empty payload is not an error");

        assert_eq!(enrichment.records.len(), 1);
        assert_eq!(enrichment.records[0].coordinates, None);
    }

    #[test]
    fn abort_policy_fails_the_batch() {
        let backend = StubBackend::new(vec![
            ("Street 1".to_string(), Answer::Found(53.55, 9.99)),
            ("Street 2".to_string(), Answer::Fail),
        ]);

        let err = geocoder(&backend, FailurePolicy::Abort)
            .enrich(vec![record("a", "Street 1"), record("b", "Street 2")], None)
            .expect_err("second lookup fails");

        match err {
            PipelineError::Geocode { address, .. } => assert_eq!(address, "Street 2"),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn isolate_policy_keeps_the_batch() {
        let backend = StubBackend::new(vec![
            ("Street 1".to_string(), Answer::Found(53.55, 9.99)),
            ("Street 2".to_string(), Answer::Fail),
        ]);

        let enrichment = geocoder(&backend, FailurePolicy::Isolate)
            .enrich(vec![record("a", "Street 1"), record("b", "Street 2")], None)
            .expect("failures are isolated");

        assert_eq!(enrichment.failed, 1);
        assert_eq!(
            enrichment.records[0].coordinates,
            Some(Coordinates {
                lat: 53.55,
                lng: 9.99
            })
        );
        assert_eq!(enrichment.records[1].coordinates, None);
    }

    #[test]
    fn cached_addresses_skip_the_backend() {
        let backend = StubBackend::new(vec![
            ("Street 1".to_string(), Answer::Found(1.0, 2.0)),
            ("Street 2".to_string(), Answer::Empty),
        ]);
        let geocoder = geocoder(&backend, FailurePolicy::Abort);
        let mut cache = Cache::new(3600);

        let first = geocoder
            .enrich(
                vec![record("a", "Street 1"), record("b", "Street 2")],
                Some(&mut cache),
            )
            .expect("first run");
        assert_eq!(first.requests, 2);

        let second = geocoder
            .enrich(
                vec![record("a", "  street   1 "), record("b", "Street 2")],
                Some(&mut cache),
            )
            .expect("second run");

        assert_eq!(second.requests, 0);
        assert_eq!(second.cache_hits, 2);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            second.records[0].coordinates,
            Some(Coordinates { lat: 1.0, lng: 2.0 })
        );
        assert_eq!(second.records[1].coordinates, None);
    }

    #[test]
    fn failed_lookups_are_not_cached() {
        let backend = StubBackend::new(vec![("Street 2".to_string(), Answer::Fail)]);
        let geocoder = geocoder(&backend, FailurePolicy::Isolate);
        let mut cache = Cache::new(3600);

        geocoder
            .enrich(vec![record("b", "Street 2")], Some(&mut cache))
            .expect("isolated");

        assert_eq!(cache.address("Street 2", Utc::now()), None);
    }

    #[test]
    fn service_error_status_is_not_cached() {
        let backend = StubBackend::new(vec![("Street 3".to_string(), Answer::Denied)]);
        let geocoder = geocoder(&backend, FailurePolicy::Abort);
        let mut cache = Cache::new(3600);

        let first = geocoder
            .enrich(vec![record("c", "Street 3")], Some(&mut cache))
            .expect("error status is not a lookup failure");
        assert_eq!(first.records[0].coordinates, None);
        assert_eq!(cache.address("Street 3", Utc::now()), None);

        let second = geocoder
            .enrich(vec![record("c", "Street 3")], Some(&mut cache))
            .expect("second run");
        assert_eq!(second.requests, 1);
        assert_eq!(second.cache_hits, 0);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn outcome_follows_service_status() {
        let denied: GeocodeResponse = serde_json::from_str(
            r#"{"results":[],"status":"REQUEST_DENIED","error_message":"bad key"}"#,
        )
        .expect("valid");
        assert_eq!(denied.outcome("a"), LookupOutcome::Unavailable);

        let zero: GeocodeResponse =
            serde_json::from_str(r#"{"results":[],"status":"ZERO_RESULTS"}"#).expect("valid");
        assert_eq!(zero.outcome("a"), LookupOutcome::NotFound);

        let bare: GeocodeResponse = serde_json::from_str(
            r#"{"results":[{"geometry":{"location":{"lat":1.0,"lng":2.0}}}]}"#,
        )
        .expect("valid");
        assert_eq!(
            bare.outcome("a"),
            LookupOutcome::Resolved(Coordinates { lat: 1.0, lng: 2.0 })
        );
    }

    #[test]
    fn first_candidate_wins() {
        let payload: GeocodeResponse = serde_json::from_str(
            r#"{"results":[
                {"geometry":{"location":{"lat":53.55,"lng":9.99}}},
                {"geometry":{"location":{"lat":1.0,"lng":1.0}}}
            ],"status":"OK"}"#,
        )
        .expect("valid payload");
        assert_eq!(
            payload.first_location(),
            Some(Coordinates {
                lat: 53.55,
                lng: 9.99
            })
        );

        let empty: GeocodeResponse =
            serde_json::from_str(r#"{"results":[],"status":"ZERO_RESULTS"}"#).expect("valid");
        assert_eq!(empty.first_location(), None);

        let no_geometry: GeocodeResponse =
            serde_json::from_str(r#"{"results":[{}]}"#).expect("valid");
        assert_eq!(no_geometry.first_location(), None);

        let half: GeocodeResponse = serde_json::from_str(
            r#"{"results":[{"geometry":{"location":{"lat":53.55}}}],"status":"OK"}"#,
        )
        .expect("partial location still decodes");
        assert_eq!(half.first_location(), None);
        assert_eq!(half.outcome("a"), LookupOutcome::NotFound);
    }
}
