//! End-to-end replication between domains and a replication server over the
//! in-process network.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ldsync_repl::backend::{BatchOp, ExportIter, Key, KvBackend, KvPair, MemoryBackend, Value};
use ldsync_repl::protocol::AssuredMode;
use ldsync_repl::entry_store::EntryStore;
use ldsync_repl::replay::ReplayEngine;
use ldsync_repl::session::{Connector, InProcessNetwork};
use ldsync_repl::update_msg::{Attributes, EntryUuid, UpdatePayload};
use ldsync_repl::{
    BrokerConfig, Csn, Dn, DomainConfig, LocalChange, Modification, ReplError, ReplicaStatus,
    ReplicationDomain, ReplicationServer, Result, ServerId, UpdateMsg,
};

const BASE: &str = "dc=example,dc=com";
const BROKER_ADDR: &str = "rs-1";

struct Topology {
    network: InProcessNetwork,
    server: ReplicationServer,
    domains: Vec<ReplicationDomain>,
}

impl Topology {
    fn new() -> Self {
        let network = InProcessNetwork::new();
        let mut config = BrokerConfig::new(100);
        config.heartbeat_interval_ms = 1000;
        let server = ReplicationServer::open(config, Arc::new(MemoryBackend::new())).unwrap();
        let listener = network.listen(BROKER_ADDR);
        let serving = server.clone();
        tokio::spawn(async move { serving.serve_links(listener).await });
        Self {
            network,
            server,
            domains: Vec::new(),
        }
    }

    fn config(sid: u32) -> DomainConfig {
        let mut config = DomainConfig::new(BASE, sid);
        config.replication_servers = vec![BROKER_ADDR.to_string()];
        config.heartbeat_interval_ms = 1000;
        config.reconnect.initial_backoff_ms = 10;
        config.reconnect.max_backoff_ms = 50;
        config
    }

    fn start(&mut self, sid: u32, backend: Arc<dyn KvBackend>) -> ReplicationDomain {
        self.start_with(Self::config(sid), backend)
    }

    fn start_with(&mut self, config: DomainConfig, backend: Arc<dyn KvBackend>) -> ReplicationDomain {
        let domain = ReplicationDomain::open(config, backend).unwrap();
        let runner = domain.clone();
        let connector: Arc<dyn Connector> = Arc::new(self.network.clone());
        tokio::spawn(async move { runner.run(connector).await });
        self.domains.push(domain.clone());
        domain
    }

    async fn stop(self) {
        for domain in &self.domains {
            domain.shutdown().await;
        }
        self.server.shutdown();
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..1000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn dn(name: &str) -> Dn {
    Dn::new(&format!("cn={},{}", name, BASE))
}

fn person(name: &str) -> LocalChange {
    let mut attributes = Attributes::new();
    attributes.insert("cn".into(), vec![name.into()]);
    attributes.insert("objectclass".into(), vec!["person".into()]);
    LocalChange::Add {
        dn: dn(name),
        attributes,
    }
}

fn has_entry(domain: &ReplicationDomain, name: &str) -> bool {
    matches!(domain.find(&dn(name)), Ok(Some(_)))
}

/// Memory backend whose entry writes can be switched off.
#[derive(Default)]
struct FlakyBackend {
    inner: MemoryBackend,
    failing: AtomicBool,
}

impl FlakyBackend {
    fn fail_entry_writes(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl KvBackend for FlakyBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        self.inner.get(key)
    }

    fn put(&self, key: Key, value: Value) -> Result<()> {
        self.inner.put(key, value)
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.inner.delete(key)
    }

    fn read_modify_write(
        &self,
        key: &[u8],
        f: &mut dyn FnMut(Option<&[u8]>) -> Result<Vec<BatchOp>>,
    ) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ReplError::backend("entry writes disabled"));
        }
        self.inner.read_modify_write(key, f)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>> {
        self.inner.scan_prefix(prefix)
    }

    fn scan_page(&self, prefix: &[u8], after: Option<&[u8]>, limit: usize) -> Result<Vec<KvPair>> {
        self.inner.scan_page(prefix, after, limit)
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        self.inner.write_batch(ops)
    }

    fn import_all(&self, prefix: &[u8], pairs: Vec<KvPair>) -> Result<()> {
        self.inner.import_all(prefix, pairs)
    }

    fn export_all(&self, prefix: &[u8]) -> ExportIter<'_> {
        ExportIter::new(self, prefix)
    }
}

#[tokio::test]
async fn test_changes_flow_both_ways() {
    let mut topology = Topology::new();
    let first = topology.start(1, Arc::new(MemoryBackend::new()));
    let second = topology.start(2, Arc::new(MemoryBackend::new()));
    wait_for("sessions", || {
        first.status() == ReplicaStatus::Normal && second.status() == ReplicaStatus::Normal
    })
    .await;

    first.publish(person("alice")).await.unwrap();
    second.publish(person("bob")).await.unwrap();
    wait_for("adds relayed", || {
        has_entry(&first, "bob") && has_entry(&second, "alice")
    })
    .await;

    second
        .publish(LocalChange::Modify {
            dn: dn("alice"),
            modifications: vec![Modification::Replace {
                attribute: "mail".into(),
                values: vec!["alice@example.com".into()],
            }],
        })
        .await
        .unwrap();
    first
        .publish(LocalChange::Delete { dn: dn("bob") })
        .await
        .unwrap();
    wait_for("modify and delete relayed", || {
        let mail = first
            .find(&dn("alice"))
            .ok()
            .flatten()
            .and_then(|e| e.attributes.get("mail").cloned());
        mail == Some(vec!["alice@example.com".to_string()]) && !has_entry(&second, "bob")
    })
    .await;

    assert_eq!(first.entries().unwrap(), second.entries().unwrap());
    wait_for("states agree", || first.server_state() == second.server_state()).await;

    let monitor = topology
        .server
        .monitor(&Dn::new(BASE))
        .unwrap()
        .expect("domain known to the server");
    assert_eq!(monitor.peers.len(), 2);

    topology.stop().await;
}

#[tokio::test]
async fn test_forced_resync_copies_source_data() {
    let mut topology = Topology::new();
    let source = topology.start(1, Arc::new(MemoryBackend::new()));
    let target = topology.start(2, Arc::new(MemoryBackend::new()));
    wait_for("sessions", || {
        source.status() == ReplicaStatus::Normal && target.status() == ReplicaStatus::Normal
    })
    .await;

    for name in ["alice", "bob", "carol"] {
        source.publish(person(name)).await.unwrap();
    }
    wait_for("adds relayed", || has_entry(&target, "carol")).await;

    let records = target.resynchronize().await.unwrap();
    assert!(records > 0);
    assert_eq!(source.entries().unwrap(), target.entries().unwrap());
    assert_eq!(target.generation_id(), source.generation_id());

    wait_for("target back to normal", || {
        target.status() == ReplicaStatus::Normal
    })
    .await;
    source.publish(person("dave")).await.unwrap();
    wait_for("post-resync relay", || has_entry(&target, "dave")).await;

    topology.stop().await;
}

#[tokio::test]
async fn test_mismatched_generation_is_reinitialized() {
    let mut topology = Topology::new();
    let source = topology.start(1, Arc::new(MemoryBackend::new()));
    wait_for("source session", || source.status() == ReplicaStatus::Normal).await;
    source.publish(person("alice")).await.unwrap();

    // Data loaded outside replication gives the second replica its own generation.
    let backend: Arc<dyn KvBackend> = Arc::new(MemoryBackend::new());
    let seeded = ReplayEngine::new(EntryStore::new(Arc::clone(&backend), Dn::new(BASE)), 16);
    let mut attributes = Attributes::new();
    attributes.insert("cn".into(), vec!["stale".into()]);
    seeded
        .apply(&UpdateMsg {
            csn: Csn::new(1, ServerId::new(9), 0),
            entry_uuid: EntryUuid::from_u128(99),
            dn: dn("stale"),
            payload: UpdatePayload::Add { attributes },
        })
        .await
        .unwrap();

    let target = topology.start(2, backend);
    assert_ne!(target.generation_id(), source.generation_id());
    wait_for("reinitialized target", || {
        target.status() == ReplicaStatus::Normal && has_entry(&target, "alice")
    })
    .await;
    assert!(!has_entry(&target, "stale"));
    assert_eq!(target.generation_id(), source.generation_id());

    topology.stop().await;
}

#[tokio::test]
async fn test_apply_failure_recovers_without_loss() {
    let mut topology = Topology::new();
    let source = topology.start(1, Arc::new(MemoryBackend::new()));
    let backend = Arc::new(FlakyBackend::default());
    let mut config = Topology::config(2);
    config.apply_retry.max_retries = 1;
    config.apply_retry.initial_backoff_ms = 1;
    let target = topology.start_with(config, backend.clone());
    wait_for("sessions", || {
        source.status() == ReplicaStatus::Normal && target.status() == ReplicaStatus::Normal
    })
    .await;

    let mut changes = target.subscribe_status();
    backend.fail_entry_writes(true);
    for name in ["alice", "bob", "carol"] {
        source.publish(person(name)).await.unwrap();
    }
    let degraded = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if changes.recv().await.unwrap().to == ReplicaStatus::Degraded {
                break;
            }
        }
    })
    .await;
    assert!(degraded.is_ok(), "target never turned degraded");
    assert!(!has_entry(&target, "alice"));
    assert_eq!(target.server_state().max_csn(ServerId::new(1)), None);

    backend.fail_entry_writes(false);
    wait_for("every change applied", || {
        ["alice", "bob", "carol"]
            .iter()
            .all(|name| has_entry(&target, name))
            && target.status() == ReplicaStatus::Normal
    })
    .await;
    assert_eq!(source.entries().unwrap(), target.entries().unwrap());
    wait_for("states agree", || source.server_state() == target.server_state()).await;
    let monitor = target.monitor().unwrap();
    assert!(monitor.apply_failures >= 1);
    assert!(monitor.sessions >= 2);

    topology.stop().await;
}

#[tokio::test]
async fn test_safe_read_publish_waits_for_other_replicas() {
    let mut topology = Topology::new();
    let mut config = Topology::config(1);
    config.assured = Some(AssuredMode::SafeRead);
    config.assured_timeout_ms = 10_000;
    let writer = topology.start_with(config, Arc::new(MemoryBackend::new()));
    let readers = [
        topology.start(2, Arc::new(MemoryBackend::new())),
        topology.start(3, Arc::new(MemoryBackend::new())),
    ];
    wait_for("sessions", || {
        writer.status() == ReplicaStatus::Normal
            && readers.iter().all(|r| r.status() == ReplicaStatus::Normal)
    })
    .await;
    wait_for("server sees every replica", || {
        topology
            .server
            .monitor(&Dn::new(BASE))
            .unwrap()
            .is_some_and(|m| {
                m.peers.len() == 3 && m.peers.iter().all(|p| p.status == ReplicaStatus::Normal)
            })
    })
    .await;

    writer.publish(person("alice")).await.unwrap();
    // Returned only once every reader applied it.
    assert!(readers.iter().all(|reader| has_entry(reader, "alice")));
    let monitor = writer.monitor().unwrap();
    assert_eq!(monitor.assured_updates, 1);
    assert_eq!(monitor.assured_failures, 0);

    topology.stop().await;
}
