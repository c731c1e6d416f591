use crate::config::{FetchMode, LoadedConfig, resolve_path};
use crate::error::PipelineError;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub source_url: String,
    pub body: Vec<u8>,
}

impl FetchedDocument {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

/// Retrieves the source document once. There is no retry and no caching at
/// this layer; every call goes to the source.
pub fn fetch_source_document(source: &LoadedConfig) -> Result<FetchedDocument, PipelineError> {
    match source.config.fetch.mode {
        FetchMode::Http => fetch_http_document(source),
        FetchMode::File => fetch_file_document(source),
        FetchMode::Inline => fetch_inline_document(source),
    }
}

fn fetch_http_document(source: &LoadedConfig) -> Result<FetchedDocument, PipelineError> {
    let fetch = &source.config.fetch;
    let url = fetch
        .url
        .as_deref()
        .ok_or_else(|| PipelineError::network("<unset>", "fetch.url missing"))?;

    let mut headers = HeaderMap::new();
    for (k, v) in &fetch.headers {
        let name = HeaderName::from_bytes(k.as_bytes())
            .map_err(|err| PipelineError::network(url, format!("invalid header name {k}: {err}")))?;
        let value = HeaderValue::from_str(v).map_err(|err| {
            PipelineError::network(url, format!("invalid header value for {k}: {err}"))
        })?;
        headers.insert(name, value);
    }
    if let Some(user_agent) = &fetch.user_agent {
        let value = HeaderValue::from_str(user_agent)
            .map_err(|err| PipelineError::network(url, format!("invalid user agent: {err}")))?;
        headers.insert(USER_AGENT, value);
    }

    let client = Client::builder()
        .timeout(Duration::from_secs(fetch.timeout_secs))
        .default_headers(headers)
        .build()
        .map_err(|err| PipelineError::network(url, format!("failed to build http client: {err}")))?;

    let response = client
        .get(url)
        .send()
        .map_err(|err| PipelineError::network(url, err))?;
    let status = response.status();
    if !status.is_success() {
        return Err(PipelineError::network(
            url,
            format!("request failed with status {status}"),
        ));
    }
    let body = response
        .bytes()
        .map_err(|err| PipelineError::network(url, err))?
        .to_vec();

    info!(
        source = %source.config.source.key,
        bytes = body.len(),
        %url,
        "fetched source document"
    );

    Ok(FetchedDocument {
        source_url: url.to_string(),
        body,
    })
}

fn fetch_file_document(source: &LoadedConfig) -> Result<FetchedDocument, PipelineError> {
    let file_path = source
        .config
        .fetch
        .file_path
        .as_ref()
        .ok_or_else(|| PipelineError::network("<unset>", "fetch.file_path missing"))?;
    let resolved = resolve_path(&source.path, file_path)
        .map_err(|err| PipelineError::network(file_path.display().to_string(), err))?;
    let source_url = format!("file://{}", resolved.display());
    let body = std::fs::read(&resolved).map_err(|err| PipelineError::network(&source_url, err))?;

    info!(
        source = %source.config.source.key,
        file = %resolved.display(),
        bytes = body.len(),
        "loaded file source"
    );

    Ok(FetchedDocument { source_url, body })
}

fn fetch_inline_document(source: &LoadedConfig) -> Result<FetchedDocument, PipelineError> {
    let inline = source
        .config
        .fetch
        .inline_data
        .as_ref()
        .ok_or_else(|| PipelineError::network("<unset>", "fetch.inline_data missing"))?;

    debug!(
        source = %source.config.source.key,
        bytes = inline.len(),
        "loaded inline source"
    );

    Ok(FetchedDocument {
        source_url: format!("inline://{}", source.config.source.key),
        body: inline.as_bytes().to_vec(),
    })
}
