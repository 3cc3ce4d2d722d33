use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::event::EventRecord;
use crate::transport::{Destination, Transport, TransportError};

/// Lets a test hold a transport call open: `entered` fires when `send`
/// starts, and the call finishes only after `release`.
#[derive(Default)]
pub struct Gate {
    pub entered: Notify,
    pub release: Notify,
}

#[derive(Default)]
pub struct MockState {
    pub calls: AtomicU32,
    pub batches: Mutex<Vec<Vec<String>>>,
    pub destinations: Mutex<Vec<Destination>>,
    /// Scripted results, consumed one per call. Empty means succeed.
    pub results: Mutex<VecDeque<bool>>,
}

/// Records each batch by event name and answers from a script.
#[derive(Clone, Default)]
pub struct MockTransport {
    pub state: Arc<MockState>,
    pub gate: Option<Arc<Gate>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call.
    pub fn failing() -> Self {
        Self::new().with_results(std::iter::repeat_n(false, 64))
    }

    pub fn with_results(self, results: impl IntoIterator<Item = bool>) -> Self {
        self.state.results.lock().unwrap().extend(results);
        self
    }

    pub fn gated(mut self) -> (Self, Arc<Gate>) {
        let gate = Arc::new(Gate::default());
        self.gate = Some(Arc::clone(&gate));
        (self, gate)
    }

    pub fn calls(&self) -> u32 {
        self.state.calls.load(Ordering::SeqCst)
    }

    pub fn batches(&self) -> Vec<Vec<String>> {
        self.state.batches.lock().unwrap().clone()
    }
}

impl Transport for MockTransport {
    async fn send(
        &self,
        destination: &Destination,
        batch: &[EventRecord],
    ) -> Result<(), TransportError> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        self.state
            .batches
            .lock()
            .unwrap()
            .push(batch.iter().map(|e| e.event_name().to_owned()).collect());
        self.state
            .destinations
            .lock()
            .unwrap()
            .push(destination.clone());

        if let Some(gate) = &self.gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        let ok = self.state.results.lock().unwrap().pop_front().unwrap_or(true);
        if ok {
            Ok(())
        } else {
            Err(TransportError::Rejected {
                status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            })
        }
    }
}

pub fn destination() -> Destination {
    Destination::parse("http://collector.test/v1/events", Some("test-key")).unwrap()
}

pub fn events(names: &[&str]) -> Vec<EventRecord> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| EventRecord::new(*name, None, i as u64, None))
        .collect()
}

pub fn names(events: &[EventRecord]) -> Vec<&str> {
    events.iter().map(EventRecord::event_name).collect()
}

pub fn install_crypto() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Bind to port 0 and return the OS-assigned port.
/// The listener is dropped, freeing the port for the caller to rebind.
pub async fn free_port() -> u16 {
    tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}
