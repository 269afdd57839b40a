//! mDNS discovery: advertise and browse `_shadowbox<code>._tcp.local.`.
//!
//! The code is four uppercase letters (456 976 values). It keeps two public
//! boxes from colliding in the service namespace, and doubles as the shared
//! secret of the AUTH handshake for private boxes. Service types are
//! lowercase on the wire; codes are surfaced uppercase everywhere else.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use dashmap::DashMap;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use shadowbox_core::ids::BoxId;
use shadowbox_core::{Error, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Service-type prefix all ShadowBox advertisements share.
pub const SERVICE_PREFIX: &str = "_shadowbox";
const SERVICE_SUFFIX: &str = "._tcp.local.";
const META_QUERY: &str = "_services._dns-sd._udp.local.";

/// Default single-shot resolve timeout.
pub const RESOLVE_TIMEOUT: Duration = Duration::from_secs(3);

const CODE_LEN: usize = 4;
const CODE_RETRIES: usize = 64;

/// A 4-letter uppercase rendezvous code.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShareCode(String);

impl ShareCode {
    /// Fresh random code.
    pub fn generate() -> Result<Self> {
        let mut raw = [0u8; CODE_LEN];
        getrandom::getrandom(&mut raw)
            .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
        let code: String = raw.iter().map(|b| char::from(b'A' + b % 26)).collect();
        Ok(Self(code))
    }

    /// The code as text, e.g. `QWER`.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// mDNS service type for this code, e.g. `_shadowboxqwer._tcp.local.`.
    pub fn service_type(&self) -> String {
        format!("{SERVICE_PREFIX}{}{SERVICE_SUFFIX}", self.0.to_lowercase())
    }

    /// Recover a code from a service type string, if it is one of ours.
    pub fn from_service_type(ty: &str) -> Option<Self> {
        let rest = ty.strip_prefix(SERVICE_PREFIX)?.strip_suffix(SERVICE_SUFFIX)?;
        if rest.len() == CODE_LEN && rest.bytes().all(|b| b.is_ascii_lowercase()) {
            Some(Self(rest.to_uppercase()))
        } else {
            None
        }
    }
}

impl FromStr for ShareCode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let up = s.trim().to_uppercase();
        if up.len() == CODE_LEN && up.bytes().all(|b| b.is_ascii_uppercase()) {
            Ok(Self(up))
        } else {
            Err(Error::NotFound(format!("malformed code {s:?}")))
        }
    }
}

impl fmt::Display for ShareCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A resolved peer advertisement.
#[derive(Debug, Clone)]
pub struct Peer {
    /// The peer's rendezvous code.
    pub code: ShareCode,
    /// Address the share server listens on.
    pub host: IpAddr,
    /// TCP port of the share server.
    pub port: u16,
    /// Advertised box id, if the TXT record parses.
    pub box_id: Option<BoxId>,
    /// Advertised owner name.
    pub owner: String,
    /// Advertised box name.
    pub name: String,
    /// Whether AUTH is skipped for this box.
    pub public: bool,
}

impl Peer {
    fn from_info(code: ShareCode, info: &ServiceInfo) -> Option<Self> {
        let host = info.get_addresses().iter().next().copied()?;
        let txt = |key: &str| info.get_property_val_str(key).unwrap_or_default().to_string();
        Some(Self {
            code,
            host: host.into(),
            port: info.get_port(),
            box_id: txt("box_id").parse().ok(),
            owner: txt("owner"),
            name: txt("name"),
            public: txt("public") == "1",
        })
    }
}

/// Browse stream events.
#[derive(Debug, Clone)]
pub enum BrowseEvent {
    /// A new peer appeared.
    Added(Peer),
    /// A known peer re-resolved with new data.
    Updated(Peer),
    /// A peer withdrew or expired.
    Removed(ShareCode),
}

/// Process-wide discovery service. Lifecycle: construct, then any number of
/// advertise/browse/resolve calls, then `shutdown` (withdraws everything).
pub struct Discovery {
    daemon: ServiceDaemon,
    // code -> registered fullname
    active: DashMap<ShareCode, String>,
    cancel: CancellationToken,
}

impl Discovery {
    /// Start the mDNS daemon.
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new().map_err(mdns_err)?;
        Ok(Self { daemon, active: DashMap::new(), cancel: CancellationToken::new() })
    }

    /// Publish an advertisement for a hosted box and return its code.
    /// Retries generation until the code collides with no active local
    /// advertisement.
    pub fn advertise(
        &self,
        box_id: BoxId,
        owner: &str,
        box_name: &str,
        port: u16,
        public: bool,
    ) -> Result<ShareCode> {
        let mut code = ShareCode::generate()?;
        let mut tries = CODE_RETRIES;
        while self.active.contains_key(&code) {
            tries -= 1;
            if tries == 0 {
                return Err(Error::Conflict("no free rendezvous code".into()));
            }
            code = ShareCode::generate()?;
        }
        let instance = code.as_str().to_lowercase();
        let hostname = format!("{instance}.shadowbox.local.");
        let props: std::collections::HashMap<String, String> = [
            ("box_id".to_string(), box_id.to_string()),
            ("owner".to_string(), owner.to_string()),
            ("name".to_string(), box_name.to_string()),
            ("public".to_string(), if public { "1" } else { "0" }.to_string()),
        ]
        .into();
        let info = ServiceInfo::new(&code.service_type(), &instance, &hostname, "", port, props)
            .map_err(mdns_err)?
            .enable_addr_auto();
        let fullname = info.get_fullname().to_string();
        self.daemon.register(info).map_err(mdns_err)?;
        self.active.insert(code.clone(), fullname);
        info!(%box_id, %code, port, public, "advertising box");
        Ok(code)
    }

    /// Withdraw one advertisement.
    pub fn withdraw(&self, code: &ShareCode) -> Result<()> {
        let Some((_, fullname)) = self.active.remove(code) else {
            return Err(Error::NotFound(format!("advertisement {code}")));
        };
        self.daemon.unregister(&fullname).map_err(mdns_err)?;
        info!(%code, "advertisement withdrawn");
        Ok(())
    }

    /// Single-shot lookup of a code, bounded by `timeout`.
    pub async fn resolve(&self, code: &ShareCode, timeout: Duration) -> Result<Peer> {
        let ty = code.service_type();
        let rx = self.daemon.browse(&ty).map_err(mdns_err)?;
        let found = tokio::time::timeout(timeout, async {
            loop {
                match rx.recv_async().await {
                    Ok(ServiceEvent::ServiceResolved(info)) => {
                        if let Some(peer) = Peer::from_info(code.clone(), &info) {
                            return Ok(peer);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => return Err(Error::Io(std::io::Error::other(e.to_string()))),
                }
            }
        })
        .await;
        let _ = self.daemon.stop_browse(&ty);
        match found {
            Ok(result) => result,
            Err(_) => Err(Error::NotFound(format!("code {code}"))),
        }
    }

    /// Continuous browse of every ShadowBox advertisement on the subnet.
    /// Spawns a pump task feeding the returned channel until shutdown.
    pub fn browse(&self) -> Result<mpsc::Receiver<BrowseEvent>> {
        let (tx, rx) = mpsc::channel(64);
        let meta_rx = self.daemon.browse(META_QUERY).map_err(mdns_err)?;
        let daemon = self.daemon.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut seen_types: Vec<String> = Vec::new();
            let mut resolved: Vec<String> = Vec::new();
            let mut per_type: Vec<flume_recv::TypeBrowse> = Vec::new();
            loop {
                // Pump the meta query and every per-type browse in turn.
                tokio::select! {
                    () = cancel.cancelled() => break,
                    event = meta_rx.recv_async() => {
                        let Ok(event) = event else { break };
                        if let ServiceEvent::ServiceFound(_, ty) = event {
                            if ShareCode::from_service_type(&ty).is_some()
                                && !seen_types.contains(&ty)
                            {
                                debug!(%ty, "shadowbox service type discovered");
                                seen_types.push(ty.clone());
                                match daemon.browse(&ty) {
                                    Ok(rx) => per_type.push(flume_recv::TypeBrowse { rx }),
                                    Err(e) => warn!(%ty, error = %e, "browse failed"),
                                }
                            }
                        }
                    }
                    Some(event) = flume_recv::next(&mut per_type) => {
                        let forward = match event {
                            ServiceEvent::ServiceResolved(info) => {
                                ShareCode::from_service_type(info.get_type()).and_then(|code| {
                                    let peer = Peer::from_info(code, &info)?;
                                    let fullname = info.get_fullname().to_string();
                                    if resolved.contains(&fullname) {
                                        Some(BrowseEvent::Updated(peer))
                                    } else {
                                        resolved.push(fullname);
                                        Some(BrowseEvent::Added(peer))
                                    }
                                })
                            }
                            ServiceEvent::ServiceRemoved(ty, fullname) => {
                                resolved.retain(|f| f != &fullname);
                                ShareCode::from_service_type(&ty).map(BrowseEvent::Removed)
                            }
                            _ => None,
                        };
                        if let Some(event) = forward {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });
        Ok(rx)
    }

    /// Withdraw every advertisement and stop the daemon.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        let codes: Vec<ShareCode> = self.active.iter().map(|e| e.key().clone()).collect();
        for code in codes {
            if let Err(e) = self.withdraw(&code) {
                warn!(%code, error = %e, "withdraw on shutdown failed");
            }
        }
        if let Err(e) = self.daemon.shutdown() {
            warn!(error = %e, "mdns daemon shutdown failed");
        }
    }
}

impl fmt::Debug for Discovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Discovery").field("active", &self.active.len()).finish_non_exhaustive()
    }
}

// Fair polling over a dynamic set of flume receivers.
mod flume_recv {
    use mdns_sd::ServiceEvent;

    pub struct TypeBrowse {
        pub rx: mdns_sd::Receiver<ServiceEvent>,
    }

    /// Await the next event from any receiver. Resolves to `None` only when
    /// the set is empty (keeps the enclosing `select!` biased to the meta
    /// query in that case).
    pub async fn next(set: &mut Vec<TypeBrowse>) -> Option<ServiceEvent> {
        if set.is_empty() {
            return std::future::pending().await;
        }
        let futures: Vec<_> = set.iter().map(|b| Box::pin(b.rx.recv_async())).collect();
        let (result, idx, _) = futures::future::select_all(futures).await;
        match result {
            Ok(event) => Some(event),
            Err(_) => {
                set.swap_remove(idx);
                None
            }
        }
    }
}

fn mdns_err(e: mdns_sd::Error) -> Error {
    Error::Io(std::io::Error::other(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_codes_are_well_formed() {
        for _ in 0..32 {
            let code = ShareCode::generate().unwrap();
            assert_eq!(code.as_str().len(), CODE_LEN);
            assert!(code.as_str().bytes().all(|b| b.is_ascii_uppercase()));
        }
    }

    #[test]
    fn service_type_roundtrip() {
        let code: ShareCode = "QWER".parse().unwrap();
        assert_eq!(code.service_type(), "_shadowboxqwer._tcp.local.");
        assert_eq!(ShareCode::from_service_type("_shadowboxqwer._tcp.local."), Some(code));
        assert_eq!(ShareCode::from_service_type("_http._tcp.local."), None);
        assert_eq!(ShareCode::from_service_type("_shadowboxtoolong._tcp.local."), None);
    }

    #[test]
    fn code_parsing_normalizes_case() {
        let code: ShareCode = " qwer ".parse().unwrap();
        assert_eq!(code.as_str(), "QWER");
        assert!("QW".parse::<ShareCode>().is_err());
        assert!("QW3R".parse::<ShareCode>().is_err());
    }
}
