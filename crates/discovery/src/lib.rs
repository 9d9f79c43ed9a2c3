//! Controller discovery over multicast DNS.
//!
//! The agent only browses; it never advertises itself. Each controller
//! instance advertises `_allow2automate._tcp` with a TXT `uuid` record; we
//! resolve the one whose uuid equals the configured identifier.

use std::net::IpAddr;
use std::time::Duration;

use futures_util::{pin_mut, StreamExt};
use mdns::RecordKind;

use pw_domain::{Error, Result};

/// Well-known service type the controller advertises.
pub const SERVICE_TYPE: &str = "_allow2automate._tcp.local";

/// TXT record key carrying the controller identifier.
const TXT_UUID_KEY: &str = "uuid";

/// Default browse window.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(10);

/// How often the browser re-sends its query while the window is open.
const QUERY_INTERVAL: Duration = Duration::from_secs(1);

/// A resolved controller endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

/// Browse the LAN for the controller advertising `identifier`.
///
/// Returns the first endpoint whose TXT `uuid` matches, or
/// [`Error::ControllerNotFound`] once `window` is exhausted. The mDNS
/// stream is dropped before returning, releasing the multicast socket, so
/// this is safe to call on every sync cycle.
pub async fn find_controller(identifier: &str, window: Duration) -> Result<Endpoint> {
    let discovery = mdns::discover::all(SERVICE_TYPE, QUERY_INTERVAL)
        .map_err(|e| Error::DiscoveryUnavailable(e.to_string()))?;

    let search = async {
        let stream = discovery.listen();
        pin_mut!(stream);
        while let Some(item) = stream.next().await {
            let response = match item {
                Ok(r) => r,
                Err(e) => return Err(Error::DiscoveryUnavailable(e.to_string())),
            };
            if let Some(endpoint) = match_response(identifier, &response) {
                return Ok(endpoint);
            }
        }
        Err(Error::DiscoveryUnavailable(
            "mDNS stream ended unexpectedly".into(),
        ))
    };

    match tokio::time::timeout(window, search).await {
        Ok(result) => result,
        Err(_) => Err(Error::ControllerNotFound(format!(
            "no controller advertising '{identifier}' within {}s",
            window.as_secs()
        ))),
    }
}

/// Extract an endpoint from one mDNS response if its TXT uuid matches.
fn match_response(identifier: &str, response: &mdns::Response) -> Option<Endpoint> {
    let mut uuid: Option<String> = None;
    let mut port: Option<u16> = None;
    let mut addr: Option<IpAddr> = None;
    let mut srv_target: Option<String> = None;

    for record in response.records() {
        match &record.kind {
            RecordKind::TXT(entries) => {
                if uuid.is_none() {
                    uuid = txt_value(entries, TXT_UUID_KEY);
                }
            }
            RecordKind::SRV { port: p, target, .. } => {
                port = Some(*p);
                srv_target = Some(target.clone());
            }
            RecordKind::A(v4) => addr = addr.or(Some(IpAddr::V4(*v4))),
            RecordKind::AAAA(v6) => addr = addr.or(Some(IpAddr::V6(*v6))),
            _ => {}
        }
    }

    match uuid {
        Some(u) if u == identifier => {}
        _ => return None,
    }
    let port = port?;
    // Prefer a resolved address; fall back to the SRV target name.
    let host = match addr {
        Some(ip) => ip.to_string(),
        None => srv_target?.trim_end_matches('.').to_owned(),
    };
    tracing::info!(%host, port, identifier, "controller resolved via mDNS");
    Some(Endpoint { host, port })
}

/// Look up `key=value` in a TXT record's entries.
fn txt_value(entries: &[String], key: &str) -> Option<String> {
    entries.iter().find_map(|e| {
        let (k, v) = e.split_once('=')?;
        (k.eq_ignore_ascii_case(key)).then(|| v.to_owned())
    })
}
