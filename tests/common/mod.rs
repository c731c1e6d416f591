#![allow(dead_code)]

use anyhow::Result;
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use url::Url;
use vaxmap::config::{LoadedConfig, load_config};

pub type Query = BTreeMap<String, String>;

/// Minimal HTTP/1.1 responder on a random local port. Each connection gets
/// one response and is closed.
pub struct TestServer {
    pub base_url: String,
    requests: Arc<Mutex<Vec<(String, Query)>>>,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    pub fn requests_to(&self, path: &str) -> Vec<Query> {
        self.requests
            .lock()
            .expect("request log lock")
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, q)| q.clone())
            .collect()
    }
}

pub fn serve<F>(handler: F) -> Result<TestServer>
where
    F: Fn(&str, &Query) -> (u16, String) + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let handler = Arc::new(handler);
    let requests = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&requests);

    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else {
                continue;
            };
            let handler = Arc::clone(&handler);
            let log = Arc::clone(&log);
            thread::spawn(move || {
                let _ = respond(stream, handler.as_ref(), &log);
            });
        }
    });

    Ok(TestServer {
        base_url: format!("http://{addr}"),
        requests,
    })
}

fn respond<F>(
    mut stream: TcpStream,
    handler: &F,
    log: &Mutex<Vec<(String, Query)>>,
) -> std::io::Result<()>
where
    F: Fn(&str, &Query) -> (u16, String),
{
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;
    loop {
        let mut line = String::new();
        let read = reader.read_line(&mut line)?;
        if read == 0 || line == "\r\n" {
            break;
        }
    }

    let target = request_line.split_whitespace().nth(1).unwrap_or("/");
    let url = Url::parse(&format!("http://127.0.0.1{target}"))
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err))?;
    let path = url.path().to_string();
    let query: Query = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if let Ok(mut entries) = log.lock() {
        entries.push((path.clone(), query.clone()));
    }

    let (status, body) = handler(&path, &query);
    write!(
        stream,
        "HTTP/1.1 {status} STATUS\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )?;
    stream.write_all(body.as_bytes())?;
    stream.flush()
}

pub struct Row<'a> {
    pub name: &'a str,
    pub line1: &'a str,
    pub line2: &'a str,
    pub hint: &'a str,
}

pub fn practice_table(rows: &[Row<'_>]) -> String {
    let mut body = String::new();
    for (index, row) in rows.iter().enumerate() {
        body.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td><p>{}</p><p>{}</p></td><td>{}</td></tr>",
            index + 1,
            row.name,
            row.line1,
            row.line2,
            row.hint
        ));
    }
    format!(
        "<!DOCTYPE html><html><body><figure class=\"table\"><table><tbody>{body}</tbody></table></figure></body></html>"
    )
}

pub fn location(lat: f64, lng: f64) -> String {
    format!(r#"{{"results":[{{"geometry":{{"location":{{"lat":{lat},"lng":{lng}}}}}}}],"status":"OK"}}"#)
}

pub fn no_results() -> String {
    r#"{"results":[],"status":"ZERO_RESULTS"}"#.to_string()
}

pub fn write_config(dir: &Path, body: &str) -> Result<LoadedConfig> {
    let path = config_file(dir, body)?;
    load_config(&path)
}

pub fn config_file(dir: &Path, body: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join("vaxmap.toml");
    std::fs::write(&path, body)?;
    Ok(path)
}

pub fn http_config(server: &TestServer, extra: &str) -> String {
    format!(
        r#"
[source]
key = "test.kvhh"
name = "Liste der KVHH"

[fetch]
url = "{page}"
timeout_secs = 5

[geocode]
endpoint = "{geocode}"
api_key_env = "VAXMAP_TEST_API_KEY"
max_concurrency = 4
timeout_secs = 5
{extra}
"#,
        page = server.url("/page"),
        geocode = server.url("/geocode"),
    )
}
