//! The service discovery collaborator.
//!
//! Padlink does not speak DNS-SD itself. A browser publishes its service
//! through a [`Discovery`] implementation, and a client searches and
//! resolves through one. [`MemoryDiscovery`] is an in-process
//! implementation for tests and single-host setups.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::SessionError;

/// DNS-SD service type for a service identifier: `_<id>._tcp`.
pub fn service_type(identifier: &str) -> String {
    format!("_{identifier}._tcp")
}

/// A service seen on the network, not yet resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceInfo {
    pub name: String,
    pub service_type: String,
}

impl fmt::Display for ServiceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.service_type)
    }
}

/// A resolved service: where to connect and its TXT record bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedService {
    pub service: ServiceInfo,
    pub addresses: Vec<SocketAddr>,
    pub txt: Bytes,
}

/// What a search reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    ServiceFound(ServiceInfo),
    ServiceLost(ServiceInfo),
}

/// Publishes, finds and resolves services.
pub trait Discovery: Send + Sync + 'static {
    /// Advertises a service of `service_type` named `name` on `port`.
    fn publish(&self, service_type: &str, name: &str, port: u16, txt: Bytes) -> Result<(), SessionError>;

    /// Starts a search. Services already visible are reported first.
    fn search(&self, service_type: &str) -> Result<mpsc::UnboundedReceiver<DiscoveryEvent>, SessionError>;

    /// Resolves a found service to addresses and its TXT record.
    fn resolve(&self, service: &ServiceInfo)
    -> impl Future<Output = Result<ResolvedService, SessionError>> + Send;

    /// Withdraws everything this handle published and ends its searches.
    fn stop(&self);
}

// ---------------------------------------------------------------------------
// MemoryDiscovery
// ---------------------------------------------------------------------------

struct Published {
    owner: u64,
    port: u16,
    txt: Bytes,
}

struct Searcher {
    owner: u64,
    service_type: String,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
}

#[derive(Default)]
struct Network {
    services: BTreeMap<ServiceInfo, Published>,
    searchers: Vec<Searcher>,
}

impl Network {
    fn announce(&mut self, event: &DiscoveryEvent, service_type: &str) {
        self.searchers.retain(|searcher| {
            searcher.service_type != service_type || searcher.events.send(event.clone()).is_ok()
        });
    }
}

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

/// In-process discovery. Handles made with [`peer`](Self::peer) share one
/// network; each handle's [`stop`](Discovery::stop) only withdraws its own
/// services and searches.
pub struct MemoryDiscovery {
    network: Arc<Mutex<Network>>,
    owner: u64,
    host: IpAddr,
}

impl MemoryDiscovery {
    /// A new, empty network whose services resolve to `127.0.0.1`.
    pub fn new() -> Self {
        Self::with_host(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    /// A new, empty network whose services resolve to `host`.
    pub fn with_host(host: IpAddr) -> Self {
        Self {
            network: Arc::new(Mutex::new(Network::default())),
            owner: NEXT_OWNER.fetch_add(1, Ordering::Relaxed),
            host,
        }
    }

    /// Another participant on the same network.
    pub fn peer(&self) -> Self {
        Self {
            network: Arc::clone(&self.network),
            owner: NEXT_OWNER.fetch_add(1, Ordering::Relaxed),
            host: self.host,
        }
    }

    /// Number of services currently published on the network.
    pub fn service_count(&self) -> usize {
        self.network().services.len()
    }

    fn network(&self) -> MutexGuard<'_, Network> {
        self.network.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryDiscovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryDiscovery")
            .field("owner", &self.owner)
            .field("host", &self.host)
            .finish()
    }
}

impl Discovery for MemoryDiscovery {
    fn publish(&self, service_type: &str, name: &str, port: u16, txt: Bytes) -> Result<(), SessionError> {
        let info = ServiceInfo {
            name: name.to_owned(),
            service_type: service_type.to_owned(),
        };
        let mut network = self.network();
        if network.services.get(&info).is_some_and(|p| p.owner != self.owner) {
            return Err(SessionError::Discovery(format!("{info} is already published")));
        }
        network.services.insert(
            info.clone(),
            Published {
                owner: self.owner,
                port,
                txt,
            },
        );
        info!(service = %info, port, "service published");
        network.announce(&DiscoveryEvent::ServiceFound(info), service_type);
        Ok(())
    }

    fn search(&self, service_type: &str) -> Result<mpsc::UnboundedReceiver<DiscoveryEvent>, SessionError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut network = self.network();
        for info in network.services.keys().filter(|i| i.service_type == service_type) {
            let _ = tx.send(DiscoveryEvent::ServiceFound(info.clone()));
        }
        network.searchers.push(Searcher {
            owner: self.owner,
            service_type: service_type.to_owned(),
            events: tx,
        });
        debug!(service_type, "search started");
        Ok(rx)
    }

    async fn resolve(&self, service: &ServiceInfo) -> Result<ResolvedService, SessionError> {
        let network = self.network();
        let published = network
            .services
            .get(service)
            .ok_or_else(|| SessionError::Discovery(format!("{service} could not be resolved")))?;
        Ok(ResolvedService {
            service: service.clone(),
            addresses: vec![SocketAddr::new(self.host, published.port)],
            txt: published.txt.clone(),
        })
    }

    fn stop(&self) {
        let mut network = self.network();
        let owned: Vec<ServiceInfo> = network
            .services
            .iter()
            .filter(|(_, p)| p.owner == self.owner)
            .map(|(info, _)| info.clone())
            .collect();
        for info in owned {
            network.services.remove(&info);
            let service_type = info.service_type.clone();
            network.announce(&DiscoveryEvent::ServiceLost(info), &service_type);
        }
        network.searchers.retain(|s| s.owner != self.owner);
        debug!(owner = self.owner, "discovery stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TYPE: &str = "_controllerkit._tcp";

    #[test]
    fn test_service_type_format() {
        assert_eq!(service_type("controllerkit"), TYPE);
    }

    #[tokio::test]
    async fn test_search_sees_existing_and_new_services() {
        let server = MemoryDiscovery::new();
        let client = server.peer();
        server.publish(TYPE, "early", 1000, Bytes::new()).unwrap();

        let mut events = client.search(TYPE).unwrap();
        server.publish(TYPE, "late", 1001, Bytes::new()).unwrap();
        server.publish("_other._tcp", "ignored", 1002, Bytes::new()).unwrap();

        let names: Vec<String> = [events.recv().await.unwrap(), events.recv().await.unwrap()]
            .into_iter()
            .map(|e| match e {
                DiscoveryEvent::ServiceFound(info) => info.name,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(names, vec!["early", "late"]);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_resolve_returns_port_and_txt() {
        let server = MemoryDiscovery::new();
        let txt = Bytes::from_static(b"\x0dINPUT_PORT=\x39\x30");
        server.publish(TYPE, "living room", 4242, txt.clone()).unwrap();

        let info = ServiceInfo {
            name: "living room".into(),
            service_type: TYPE.into(),
        };
        let resolved = server.peer().resolve(&info).await.unwrap();
        assert_eq!(resolved.addresses, vec![SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 4242)]);
        assert_eq!(resolved.txt, txt);
    }

    #[tokio::test]
    async fn test_resolve_unknown_service_fails() {
        let discovery = MemoryDiscovery::new();
        let info = ServiceInfo {
            name: "ghost".into(),
            service_type: TYPE.into(),
        };
        assert!(matches!(
            discovery.resolve(&info).await,
            Err(SessionError::Discovery(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_withdraws_own_services() {
        let server = MemoryDiscovery::new();
        let other = server.peer();
        let client = server.peer();
        server.publish(TYPE, "a", 1, Bytes::new()).unwrap();
        other.publish(TYPE, "b", 2, Bytes::new()).unwrap();

        let mut events = client.search(TYPE).unwrap();
        events.recv().await.unwrap();
        events.recv().await.unwrap();

        server.stop();
        assert_eq!(
            events.recv().await.unwrap(),
            DiscoveryEvent::ServiceLost(ServiceInfo {
                name: "a".into(),
                service_type: TYPE.into(),
            })
        );
        assert_eq!(server.service_count(), 1);

        client.stop();
        assert!(events.recv().await.is_none());
    }

    #[test]
    fn test_publish_name_taken_by_other_owner_fails() {
        let first = MemoryDiscovery::new();
        let second = first.peer();
        first.publish(TYPE, "pad", 1, Bytes::new()).unwrap();
        assert!(second.publish(TYPE, "pad", 2, Bytes::new()).is_err());
        first.publish(TYPE, "pad", 3, Bytes::new()).unwrap();
    }
}
