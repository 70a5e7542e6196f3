use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};
use tokio::time::Duration;

use causeway::protocol::IceCandidate;
use causeway::upstream::{
    ElementKind, ElementRef, EndpointEvent, GroupRef, MediaServer, UpstreamError,
};

/// Scriptable stand-in for the remote media server. Records every mutating
/// call so tests can assert on ordering and single-release.
#[derive(Default)]
pub struct MockMediaServer {
    pub topology: Mutex<Vec<(GroupRef, Vec<ElementRef>)>>,
    pub names: Mutex<HashMap<String, String>>,
    pub connected: Mutex<Vec<(String, String)>>,
    pub released: Mutex<Vec<String>>,
    pub delivered: Mutex<Vec<(String, IceCandidate)>>,
    pub events: Mutex<HashMap<String, mpsc::UnboundedSender<EndpointEvent>>>,
    pub latency_enabled: Mutex<Vec<String>>,
    pub fail_groups: AtomicBool,
    pub fail_connect: AtomicBool,
    pub fail_offer: AtomicBool,
    pub fail_gather: AtomicBool,
    pub fail_candidate: AtomicBool,
    pub hang_offer: AtomicBool,
    pub hang_release: AtomicBool,
    /// When set, `connect` parks until `connect_gate` is notified, signalling
    /// `connect_entered` first so the test can interleave other work.
    pub gate_connect: AtomicBool,
    pub connect_entered: Notify,
    pub connect_gate: Notify,
    next_sink: AtomicU64,
}

pub fn group(id: &str) -> GroupRef {
    GroupRef { id: id.to_string() }
}

pub fn source(id: &str) -> ElementRef {
    ElementRef {
        id: id.to_string(),
        kind: ElementKind::Source,
    }
}

pub fn relay(id: &str) -> ElementRef {
    ElementRef {
        id: id.to_string(),
        kind: ElementKind::RelaySink,
    }
}

pub fn candidate(n: u32) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{n} 1 UDP 1 127.0.0.1 9 typ host"),
        sdp_mid: Some("0".to_string()),
        sdp_m_line_index: Some(0),
    }
}

impl MockMediaServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_group(&self, group: GroupRef, children: Vec<ElementRef>) {
        self.topology.lock().unwrap().push((group, children));
    }

    pub fn set_name(&self, element_id: &str, name: &str) {
        self.names
            .lock()
            .unwrap()
            .insert(element_id.to_string(), name.to_string());
    }

    pub fn released_ids(&self) -> Vec<String> {
        self.released.lock().unwrap().clone()
    }

    pub fn delivered_candidates(&self) -> Vec<(String, IceCandidate)> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn push_event(&self, element_id: &str, event: EndpointEvent) {
        let feeds = self.events.lock().unwrap();
        let feed = feeds.get(element_id).expect("no subscriber for element");
        feed.send(event).expect("event feed closed");
    }
}

#[async_trait]
impl MediaServer for MockMediaServer {
    async fn groups(&self) -> Result<Vec<GroupRef>, UpstreamError> {
        if self.fail_groups.load(Ordering::SeqCst) {
            return Err(UpstreamError::Unavailable("mock is down".to_string()));
        }
        Ok(self
            .topology
            .lock()
            .unwrap()
            .iter()
            .map(|(group, _)| group.clone())
            .collect())
    }

    async fn children(&self, group: &GroupRef) -> Result<Vec<ElementRef>, UpstreamError> {
        self.topology
            .lock()
            .unwrap()
            .iter()
            .find(|(candidate, _)| candidate == group)
            .map(|(_, children)| children.clone())
            .ok_or_else(|| UpstreamError::Rpc(format!("unknown group {}", group.id)))
    }

    async fn element_name(
        &self,
        element: &ElementRef,
    ) -> Result<Option<String>, UpstreamError> {
        Ok(self.names.lock().unwrap().get(&element.id).cloned())
    }

    async fn enable_latency_stats(&self, group: &GroupRef) -> Result<(), UpstreamError> {
        self.latency_enabled.lock().unwrap().push(group.id.clone());
        Ok(())
    }

    async fn create_sink(&self, _group: &GroupRef) -> Result<ElementRef, UpstreamError> {
        let n = self.next_sink.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(relay(&format!("sink-{n}")))
    }

    async fn connect(
        &self,
        source: &ElementRef,
        sink: &ElementRef,
    ) -> Result<(), UpstreamError> {
        if self.gate_connect.load(Ordering::SeqCst) {
            self.connect_entered.notify_one();
            self.connect_gate.notified().await;
        }
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(UpstreamError::Rpc("connect refused".to_string()));
        }
        self.connected
            .lock()
            .unwrap()
            .push((source.id.clone(), sink.id.clone()));
        Ok(())
    }

    async fn process_offer(
        &self,
        _sink: &ElementRef,
        _offer: &str,
    ) -> Result<String, UpstreamError> {
        if self.hang_offer.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        if self.fail_offer.load(Ordering::SeqCst) {
            return Err(UpstreamError::Rpc("offer rejected".to_string()));
        }
        Ok("A".to_string())
    }

    async fn gather_candidates(&self, _sink: &ElementRef) -> Result<(), UpstreamError> {
        if self.fail_gather.load(Ordering::SeqCst) {
            return Err(UpstreamError::Rpc("gathering refused".to_string()));
        }
        Ok(())
    }

    async fn add_candidate(
        &self,
        sink: &ElementRef,
        candidate: &IceCandidate,
    ) -> Result<(), UpstreamError> {
        if self.fail_candidate.load(Ordering::SeqCst) {
            return Err(UpstreamError::Rpc("candidate refused".to_string()));
        }
        self.delivered
            .lock()
            .unwrap()
            .push((sink.id.clone(), candidate.clone()));
        Ok(())
    }

    async fn release(&self, element: &ElementRef) -> Result<(), UpstreamError> {
        if self.hang_release.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        self.events.lock().unwrap().remove(&element.id);
        self.released.lock().unwrap().push(element.id.clone());
        Ok(())
    }

    async fn subscribe(
        &self,
        element: &ElementRef,
    ) -> Result<mpsc::UnboundedReceiver<EndpointEvent>, UpstreamError> {
        let (feed, events) = mpsc::unbounded_channel();
        self.events
            .lock()
            .unwrap()
            .insert(element.id.clone(), feed);
        Ok(events)
    }

    async fn element_stats(
        &self,
        _element: &ElementRef,
        _media_type: &str,
    ) -> Result<Value, UpstreamError> {
        Ok(json!({
            "stat-1": { "type": "endpoint", "videoE2ELatency": 7 },
        }))
    }
}
