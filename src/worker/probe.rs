//! Probe executor - one instrumented HTTP transaction per task
//!
//! Every probe must measure cold-start DNS, TCP and TLS, so the executor
//! owns its transport instead of going through a pooled client: the six
//! trace instants are captured directly around the await points they
//! describe, and the connection is closed after every transaction.
//!
//! Transport failure is a value, not an error: DNS failures, refused
//! connections, handshake failures and timeouts all produce a DOWN
//! observation and the task acks. Store and publish failures are logged
//! without failing the task - re-running the probe would just produce a
//! different observation.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, error, instrument, warn};
use url::Url;
use uuid::Uuid;

use crate::bus::MessageBus;
use crate::queue::TaskHandler;
use crate::store::CatalogStore;
use crate::types::{Observation, ProbeTask, STATUS_DOWN};
use crate::LIVE_TOPIC;

/// Ceiling for one probe transaction, connect to last byte.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Body bytes read before the probe stops: `download` measures
/// time-to-first-kilobyte, not full content length.
const BODY_SAMPLE_BYTES: usize = 1024;

/// Give up on responses whose head alone exceeds this.
const MAX_HEAD_BYTES: usize = 16 * 1024;

const USER_AGENT: &str = "Pulsar-Monitor/1.0";

/// The trace instants of one transaction. A pair stays unset when its
/// phase did not occur (TLS on plain http, DNS on an IP literal).
#[derive(Debug, Default, Clone, Copy)]
struct TraceInstants {
    dns_start: Option<Instant>,
    dns_done: Option<Instant>,
    conn_start: Option<Instant>,
    conn_done: Option<Instant>,
    tls_start: Option<Instant>,
    tls_done: Option<Instant>,
    first_byte: Option<Instant>,
}

/// Parsed response status line.
#[derive(Debug)]
struct ResponseHead {
    code: u16,
    reason: String,
}

/// Consumes probe tasks: executes the transaction, persists the
/// observation, publishes the live update.
pub struct ProbeExecutor {
    store: Arc<dyn CatalogStore>,
    bus: Arc<dyn MessageBus>,
    timeout: Duration,
}

impl ProbeExecutor {
    pub fn new(store: Arc<dyn CatalogStore>, bus: Arc<dyn MessageBus>) -> Self {
        Self {
            store,
            bus,
            timeout: PROBE_TIMEOUT,
        }
    }

    /// Override the transaction ceiling (tests).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run one probe end to end. Returns the observation that was recorded,
    /// or `None` when the task is a no-op (empty or unparsable URL).
    #[instrument(skip(self, task), fields(monitor_id = %task.monitor_id, url = %task.url))]
    pub async fn probe(&self, task: &ProbeTask) -> Option<Observation> {
        if task.url.is_empty() {
            return None;
        }

        let target = normalize_url(&task.url);
        let url = match Url::parse(&target) {
            Ok(url) => url,
            Err(e) => {
                warn!("unparsable probe url {target}: {e}");
                return None;
            }
        };

        let mut trace = TraceInstants::default();
        let started = Instant::now();

        let outcome = tokio::time::timeout(self.timeout, execute(&url, &mut trace)).await;
        let ended = Instant::now();
        let latency_ms = millis(ended.duration_since(started));

        let observation = match outcome {
            Ok(Ok(head)) => {
                let (dns, tcp, tls, ttfb, download) = compute_phases(&trace, started, ended);
                debug!(
                    "probe ok: {} {} | total {latency_ms}ms dns {dns}ms tcp {tcp}ms \
                     tls {tls}ms ttfb {ttfb}ms dl {download}ms",
                    head.code, head.reason
                );
                Observation {
                    id: Uuid::new_v4(),
                    monitor_id: task.monitor_id,
                    created_at: Utc::now(),
                    status_code: i32::from(head.code),
                    status: head.reason,
                    latency_ms,
                    timing_dns: dns,
                    timing_tcp: tcp,
                    timing_tls: tls,
                    timing_ttfb: ttfb,
                    timing_download: download,
                }
            }
            Ok(Err(e)) => {
                debug!("probe failed after {latency_ms}ms: {e:#}");
                down_observation(task.monitor_id, latency_ms)
            }
            Err(_) => {
                debug!("probe timed out after {latency_ms}ms");
                down_observation(task.monitor_id, latency_ms)
            }
        };

        // Strict order: persist, then publish. Either failure leaves the
        // task acked - the next probe supersedes this one.
        if let Err(e) = self.store.append_observation(&observation).await {
            error!("failed to persist observation: {e}");
        }

        match serde_json::to_vec(&observation.to_live_message()) {
            Ok(payload) => {
                if let Err(e) = self.bus.publish(LIVE_TOPIC, payload).await {
                    warn!("failed to publish monitor update: {e}");
                }
            }
            Err(e) => error!("failed to encode monitor update: {e}"),
        }

        Some(observation)
    }
}

#[async_trait]
impl TaskHandler for ProbeExecutor {
    async fn handle(&self, task: ProbeTask) -> anyhow::Result<()> {
        // Transport failures are observations, not handler errors; the
        // task acks either way.
        self.probe(&task).await;
        Ok(())
    }
}

fn normalize_url(raw: &str) -> String {
    if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.to_string()
    } else {
        format!("https://{raw}")
    }
}

fn down_observation(monitor_id: Uuid, latency_ms: u32) -> Observation {
    Observation {
        id: Uuid::new_v4(),
        monitor_id,
        created_at: Utc::now(),
        status_code: 0,
        status: STATUS_DOWN.to_string(),
        latency_ms,
        timing_dns: 0,
        timing_tcp: 0,
        timing_tls: 0,
        timing_ttfb: 0,
        timing_download: 0,
    }
}

fn millis(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}

/// Phase durations in whole milliseconds, each 0 when its instants are
/// unset. TTFB runs from the latest pre-response event; `saturating`
/// keeps it at 0 if the first byte somehow predates that event.
fn compute_phases(
    trace: &TraceInstants,
    started: Instant,
    ended: Instant,
) -> (u32, u32, u32, u32, u32) {
    let span = |start: Option<Instant>, end: Option<Instant>| match (start, end) {
        (Some(start), Some(end)) => millis(end.saturating_duration_since(start)),
        _ => 0,
    };

    let dns = span(trace.dns_start, trace.dns_done);
    let tcp = span(trace.conn_start, trace.conn_done);
    let tls = span(trace.tls_start, trace.tls_done);

    let ttfb = match trace.first_byte {
        Some(first_byte) => {
            let base = trace.tls_done.or(trace.conn_done).unwrap_or(started);
            millis(first_byte.saturating_duration_since(base))
        }
        None => 0,
    };

    let download = match trace.first_byte {
        Some(first_byte) => millis(ended.saturating_duration_since(first_byte)),
        None => 0,
    };

    (dns, tcp, tls, ttfb, download)
}

/// Resolve, connect, handshake, send the request and read the response
/// head plus at most [`BODY_SAMPLE_BYTES`] of body.
async fn execute(url: &Url, trace: &mut TraceInstants) -> Result<ResponseHead> {
    let scheme = url.scheme();
    let port = url
        .port_or_known_default()
        .context("url has no usable port")?;

    let (addr, host) = resolve(url, port, trace).await?;

    trace.conn_start = Some(Instant::now());
    let tcp = TcpStream::connect(addr)
        .await
        .with_context(|| format!("tcp connect to {addr} failed"))?;
    trace.conn_done = Some(Instant::now());

    let host_header = host_header(scheme, &host, port);
    let target = request_target(url);

    match scheme {
        "https" => {
            let server_name =
                ServerName::try_from(host.clone()).context("host is not a valid server name")?;

            trace.tls_start = Some(Instant::now());
            let mut stream = tls_connector()
                .connect(server_name, tcp)
                .await
                .context("tls handshake failed")?;
            trace.tls_done = Some(Instant::now());

            transact(&mut stream, &host_header, &target, trace).await
        }
        "http" => {
            let mut stream = tcp;
            transact(&mut stream, &host_header, &target, trace).await
        }
        other => bail!("unsupported scheme {other}"),
    }
}

/// DNS phase. IP literals skip resolution entirely, leaving the DNS
/// instants unset.
async fn resolve(url: &Url, port: u16, trace: &mut TraceInstants) -> Result<(SocketAddr, String)> {
    match url.host().context("url has no host")? {
        url::Host::Ipv4(ip) => Ok((SocketAddr::new(IpAddr::V4(ip), port), ip.to_string())),
        url::Host::Ipv6(ip) => Ok((SocketAddr::new(IpAddr::V6(ip), port), ip.to_string())),
        url::Host::Domain(domain) => {
            let domain = domain.to_string();

            trace.dns_start = Some(Instant::now());
            let addr = lookup_host((domain.as_str(), port))
                .await
                .with_context(|| format!("dns lookup for {domain} failed"))?
                .next()
                .with_context(|| format!("dns lookup for {domain} returned no addresses"))?;
            trace.dns_done = Some(Instant::now());

            Ok((addr, domain))
        }
    }
}

fn host_header(scheme: &str, host: &str, port: u16) -> String {
    match (scheme, port) {
        ("http", 80) | ("https", 443) => host.to_string(),
        _ => format!("{host}:{port}"),
    }
}

fn request_target(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{query}", url.path()),
        None => url.path().to_string(),
    }
}

/// Write the request and read the response: head fully, body up to the
/// 1 KiB sample. EOF before the sample fills is not an error.
async fn transact<S>(
    stream: &mut S,
    host_header: &str,
    target: &str,
    trace: &mut TraceInstants,
) -> Result<ResponseHead>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!(
        "GET {target} HTTP/1.1\r\n\
         Host: {host_header}\r\n\
         User-Agent: {USER_AGENT}\r\n\
         Accept: */*\r\n\
         Connection: close\r\n\r\n"
    );
    stream
        .write_all(request.as_bytes())
        .await
        .context("failed to send request")?;

    let mut head = Vec::with_capacity(2048);
    let mut chunk = [0u8; 2048];

    // Read until the end of the response head.
    let body_start = loop {
        let n = stream.read(&mut chunk).await.context("read failed")?;
        if n == 0 {
            bail!("connection closed before response head completed");
        }
        if trace.first_byte.is_none() {
            trace.first_byte = Some(Instant::now());
        }

        head.extend_from_slice(&chunk[..n]);

        if let Some(pos) = find_head_end(&head) {
            break pos;
        }
        if head.len() > MAX_HEAD_BYTES {
            bail!("response head exceeded {MAX_HEAD_BYTES} bytes");
        }
    };

    let response = parse_status_line(&head)?;

    // Discard up to the body sample, then stop reading.
    let mut body_seen = head.len() - body_start;
    while body_seen < BODY_SAMPLE_BYTES {
        let n = stream.read(&mut chunk).await.context("body read failed")?;
        if n == 0 {
            break;
        }
        body_seen += n;
    }

    Ok(response)
}

/// Offset of the first body byte, if the blank line has arrived.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// Parse `HTTP/1.1 200 OK` into code and reason phrase.
fn parse_status_line(head: &[u8]) -> Result<ResponseHead> {
    let line_end = head
        .windows(2)
        .position(|window| window == b"\r\n")
        .context("no status line")?;
    let line = std::str::from_utf8(&head[..line_end]).context("status line is not utf-8")?;

    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        bail!("malformed status line: {line}");
    }

    let code: u16 = parts
        .next()
        .context("status line has no code")?
        .parse()
        .with_context(|| format!("malformed status code in: {line}"))?;

    let reason = match parts.next() {
        Some(reason) if !reason.is_empty() => reason.to_string(),
        _ => code.to_string(),
    };

    Ok(ResponseHead { code, reason })
}

fn tls_connector() -> TlsConnector {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();
    let config = CONFIG.get_or_init(|| {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Arc::new(
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        )
    });
    TlsConnector::from(config.clone())
}
