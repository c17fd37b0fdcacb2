//! Correlates outgoing requests with responses and aggregates cluster/fetch
//! fan-outs, timing them out on a deadline.
//!
//! A tracker key is a 16-byte BLAKE3 hash of an outbound parcel's invariant
//! fields (source, destination, route, payload): the same request always
//! derives the same key, so callers may deduplicate on it. Trackers move
//! `Pending` -> (`Fulfilled` | `Expired`) -> `Ready` -> `Completed`; expired
//! trackers are promoted to `Ready` with whatever partial data they have
//! rather than dropped.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Instant;

use brypt_identifier::NodeId;
use brypt_message::{ApplicationParcel, AwaitableBinding, Extension};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TrackingError {
    #[error("no tracker is registered for this key")]
    UnknownTracker,
    #[error("tracker deadline has passed")]
    TrackerExpired,
}

/// A 16-byte stable identity for one outstanding correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackerKey([u8; 16]);

impl TrackerKey {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for TrackerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Hashes an outbound parcel's invariant fields so the same logical request always
/// derives the same key.
pub fn derive_tracker_key(parcel: &ApplicationParcel) -> TrackerKey {
    let mut hasher = blake3::Hasher::new();
    hasher.update(parcel.header.source.as_bytes());
    hasher.update(match &parcel.header.destination {
        brypt_message::Destination::Node(id) => id.as_bytes(),
        brypt_message::Destination::Cluster => b"cluster",
        brypt_message::Destination::Network => b"network",
    });
    hasher.update(parcel.route.as_bytes());
    hasher.update(&parcel.payload);
    let digest = hasher.finalize();
    let mut key = [0u8; 16];
    key.copy_from_slice(&digest.as_bytes()[..16]);
    TrackerKey(key)
}

/// Delivered to a deferred continuation, or folded into an aggregated response.
#[derive(Debug, Clone)]
pub struct Response {
    pub key: TrackerKey,
    pub source: NodeId,
    pub payload: Vec<u8>,
    pub status_code: Option<u32>,
    /// Responders still outstanding at delivery time; zero for a deferred tracker.
    pub remaining: usize,
}

type ResponseContinuation = Box<dyn FnOnce(Response) + Send>;
type ErrorContinuation = Box<dyn FnOnce(TrackingError) + Send>;
type AggregateFinalizer = Box<dyn FnOnce(BTreeMap<NodeId, AggregatedEntry>) -> ApplicationParcel + Send>;
type ResponseSink = Box<dyn FnOnce(ApplicationParcel) + Send>;
type NoticeSink = Box<dyn Fn(&NodeId, ApplicationParcel) + Send>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregatedEntry {
    Payload(Vec<u8>),
    StatusCode(u32),
}

// Completed trackers are removed from the table outright rather than tagged,
// so this only needs to distinguish the two pre-removal states.
enum TrackerState {
    Pending,
    Ready,
}

struct DeferredTracker {
    state: TrackerState,
    on_response: Option<ResponseContinuation>,
    on_error: Option<ErrorContinuation>,
    resolved: Option<Response>,
    deadline: Instant,
}

struct AggregatedTracker {
    state: TrackerState,
    expected: Vec<NodeId>,
    responses: BTreeMap<NodeId, AggregatedEntry>,
    deadline: Instant,
    finalize: Option<AggregateFinalizer>,
    send: Option<ResponseSink>,
}

enum Tracker {
    Deferred(DeferredTracker),
    Aggregated(AggregatedTracker),
}

impl Tracker {
    fn state(&self) -> &TrackerState {
        match self {
            Tracker::Deferred(t) => &t.state,
            Tracker::Aggregated(t) => &t.state,
        }
    }

    fn deadline(&self) -> Instant {
        match self {
            Tracker::Deferred(t) => t.deadline,
            Tracker::Aggregated(t) => t.deadline,
        }
    }
}

/// The awaitable tracking service: owns the table of outstanding trackers and
/// reports queue sizes and completions to the scheduler.
#[derive(Default)]
pub struct TrackingService {
    table: Mutex<HashMap<TrackerKey, Tracker>>,
    order: Mutex<Vec<TrackerKey>>,
}

impl TrackingService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a single-responder tracker, stamping `parcel`'s Awaitable extension
    /// with `Request` binding, and returns the key alongside the stamped parcel.
    pub fn stage_request(
        &self,
        mut parcel: ApplicationParcel,
        deadline: Instant,
        on_response: ResponseContinuation,
        on_error: ErrorContinuation,
    ) -> (TrackerKey, ApplicationParcel) {
        let key = derive_tracker_key(&parcel);
        parcel.extensions.push(brypt_message::Extension::Awaitable {
            tracker_key: *key.as_bytes(),
            binding: AwaitableBinding::Request,
        });

        self.table.lock().insert(
            key,
            Tracker::Deferred(DeferredTracker {
                state: TrackerState::Pending,
                on_response: Some(on_response),
                on_error: Some(on_error),
                resolved: None,
                deadline,
            }),
        );
        self.order.lock().push(key);
        (key, parcel)
    }

    /// Registers a fan-out tracker and actually transmits `notice` to every
    /// member of `expected`: each copy is addressed to its recipient and stamped
    /// with this tracker's key in Request binding, then handed to `send_notice`.
    /// `finalize` builds the response once every responder has replied or the
    /// deadline passes, and `send_response` delivers it to the original requester.
    pub fn defer(
        &self,
        notice: ApplicationParcel,
        expected: Vec<NodeId>,
        deadline: Instant,
        finalize: AggregateFinalizer,
        send_notice: NoticeSink,
        send_response: ResponseSink,
    ) -> TrackerKey {
        let mut hasher = blake3::Hasher::new();
        for id in &expected {
            hasher.update(id.as_bytes());
        }
        hasher.update(&deadline.elapsed().as_nanos().to_le_bytes());
        let digest = hasher.finalize();
        let mut raw = [0u8; 16];
        raw.copy_from_slice(&digest.as_bytes()[..16]);
        let key = TrackerKey(raw);

        for id in &expected {
            let mut addressed = notice.clone();
            addressed.header.destination = brypt_message::Destination::Node(id.clone());
            addressed.extensions.push(Extension::Awaitable { tracker_key: raw, binding: AwaitableBinding::Request });
            send_notice(id, addressed);
        }

        self.table.lock().insert(
            key,
            Tracker::Aggregated(AggregatedTracker {
                state: TrackerState::Pending,
                expected,
                responses: BTreeMap::new(),
                deadline,
                finalize: Some(finalize),
                send: Some(send_response),
            }),
        );
        self.order.lock().push(key);
        key
    }

    /// Feeds an incoming `Awaitable(Response, key)` parcel to its tracker. Returns
    /// `false` if no tracker matches the key (already completed, or unknown).
    pub fn on_response_arrived(&self, parcel: &ApplicationParcel) -> bool {
        let Some((tracker_key, binding)) = parcel.awaitable() else {
            return false;
        };
        if binding != AwaitableBinding::Response {
            return false;
        }
        let key = TrackerKey(*tracker_key);

        let mut table = self.table.lock();
        let Some(tracker) = table.get_mut(&key) else {
            debug!(%key, "response arrived for unknown or completed tracker");
            return false;
        };

        match tracker {
            Tracker::Deferred(deferred) => {
                deferred.resolved = Some(Response {
                    key,
                    source: parcel.header.source.clone(),
                    payload: parcel.payload.clone(),
                    status_code: parcel.status(),
                    remaining: 0,
                });
                deferred.state = TrackerState::Ready;
                true
            }
            Tracker::Aggregated(aggregated) => {
                let entry = match parcel.status() {
                    Some(code) => AggregatedEntry::StatusCode(code),
                    None => AggregatedEntry::Payload(parcel.payload.clone()),
                };
                aggregated.responses.insert(parcel.header.source.clone(), entry);
                if aggregated.responses.len() >= aggregated.expected.len() {
                    aggregated.state = TrackerState::Ready;
                }
                true
            }
        }
    }

    /// Count of trackers still waiting on responses.
    pub fn waiting(&self) -> usize {
        self.table
            .lock()
            .values()
            .filter(|tracker| matches!(tracker.state(), TrackerState::Pending))
            .count()
    }

    /// Count of trackers eligible for execution (fulfilled or expired).
    pub fn ready(&self) -> usize {
        self.table
            .lock()
            .values()
            .filter(|tracker| matches!(tracker.state(), TrackerState::Ready))
            .count()
    }

    /// Promotes any Pending tracker past its deadline to Ready, then drains every
    /// Ready tracker in arrival order, invoking its continuation. Returns the number
    /// of trackers completed this call.
    pub fn execute(&self, now: Instant) -> usize {
        {
            let mut table = self.table.lock();
            for tracker in table.values_mut() {
                if matches!(tracker.state(), TrackerState::Pending) && tracker.deadline() <= now {
                    match tracker {
                        Tracker::Deferred(t) => t.state = TrackerState::Ready,
                        Tracker::Aggregated(t) => t.state = TrackerState::Ready,
                    }
                }
            }
        }

        let mut order = self.order.lock();
        let mut completed = 0;
        order.retain(|key| {
            let tracker = {
                let mut table = self.table.lock();
                match table.get_mut(key) {
                    Some(tracker) if matches!(tracker.state(), TrackerState::Ready) => table.remove(key),
                    _ => None,
                }
            };
            match tracker {
                Some(tracker) => {
                    Self::complete(*key, tracker);
                    completed += 1;
                    false
                }
                None => true,
            }
        });
        completed
    }

    fn complete(key: TrackerKey, tracker: Tracker) {
        match tracker {
            Tracker::Deferred(mut deferred) => match deferred.resolved.take() {
                Some(response) => {
                    if let Some(on_response) = deferred.on_response.take() {
                        on_response(response);
                    }
                }
                None => {
                    if let Some(on_error) = deferred.on_error.take() {
                        on_error(TrackingError::TrackerExpired);
                    }
                }
            },
            Tracker::Aggregated(mut aggregated) => {
                if aggregated.responses.len() < aggregated.expected.len() {
                    warn!(%key, expected = aggregated.expected.len(), received = aggregated.responses.len(), "aggregated tracker expired with partial responses");
                }
                if let (Some(finalize), Some(send)) = (aggregated.finalize.take(), aggregated.send.take()) {
                    let response = finalize(aggregated.responses);
                    send(response);
                }
            }
        }
    }

    /// Explicit removal, used when a Peer Proxy whose trackers captured only a weak
    /// reference to it is dropped.
    pub fn cancel(&self, key: TrackerKey) {
        self.table.lock().remove(&key);
        self.order.lock().retain(|existing| *existing != key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brypt_message::Destination;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn node(seed: u8) -> NodeId {
        NodeId::new(vec![seed; 20]).unwrap()
    }

    fn sample_parcel(route: &str) -> ApplicationParcel {
        ApplicationParcel::builder()
            .source(node(1))
            .destination(Destination::Node(node(2)))
            .route(route)
            .payload(b"payload".to_vec())
            .build()
            .unwrap()
    }

    #[test]
    fn same_parcel_contents_derive_the_same_key() {
        assert_eq!(derive_tracker_key(&sample_parcel("/a")), derive_tracker_key(&sample_parcel("/a")));
        assert_ne!(derive_tracker_key(&sample_parcel("/a")), derive_tracker_key(&sample_parcel("/b")));
    }

    #[test]
    fn deferred_tracker_fires_on_matching_response() {
        let service = TrackingService::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();

        let (key, _stamped) = service.stage_request(
            sample_parcel("/echo"),
            Instant::now() + Duration::from_secs(10),
            Box::new(move |_response| fired_clone.store(true, Ordering::SeqCst)),
            Box::new(|_err| panic!("on_error should not fire")),
        );
        assert_eq!(service.waiting(), 1);

        let response_parcel = ApplicationParcel::builder()
            .source(node(2))
            .destination(Destination::Node(node(1)))
            .route("/echo")
            .payload(b"reply".to_vec())
            .extension(brypt_message::Extension::Awaitable {
                tracker_key: *key.as_bytes(),
                binding: AwaitableBinding::Response,
            })
            .build()
            .unwrap();

        assert!(service.on_response_arrived(&response_parcel));
        assert_eq!(service.ready(), 1);
        assert_eq!(service.execute(Instant::now()), 1);
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn deferred_tracker_expires_and_invokes_on_error() {
        let service = TrackingService::new();
        let errored = Arc::new(AtomicBool::new(false));
        let errored_clone = errored.clone();

        service.stage_request(
            sample_parcel("/slow"),
            Instant::now(),
            Box::new(|_response| panic!("on_response should not fire")),
            Box::new(move |_err| errored_clone.store(true, Ordering::SeqCst)),
        );

        assert_eq!(service.execute(Instant::now() + Duration::from_millis(1)), 1);
        assert!(errored.load(Ordering::SeqCst));
    }

    #[test]
    fn aggregated_tracker_completes_once_every_expected_responder_replies() {
        let service = TrackingService::new();
        let sent = Arc::new(AtomicBool::new(false));
        let sent_clone = sent.clone();
        let notices_sent = Arc::new(Mutex::new(Vec::new()));
        let notices_sent_clone = notices_sent.clone();

        let expected = vec![node(10), node(20)];
        let notice = sample_parcel("/info/node");
        let key = service.defer(
            notice,
            expected.clone(),
            Instant::now() + Duration::from_secs(10),
            Box::new(|responses| {
                assert_eq!(responses.len(), 2);
                ApplicationParcel::builder()
                    .source(node(1))
                    .route("/aggregate")
                    .payload(b"done".to_vec())
                    .build()
                    .unwrap()
            }),
            Box::new(move |id, parcel| notices_sent_clone.lock().push((id.clone(), parcel))),
            Box::new(move |_parcel| sent_clone.store(true, Ordering::SeqCst)),
        );

        assert_eq!(notices_sent.lock().len(), 2);
        for (id, parcel) in notices_sent.lock().iter() {
            assert_eq!(parcel.header.destination, Destination::Node(id.clone()));
            assert_eq!(parcel.awaitable(), Some((key.as_bytes(), AwaitableBinding::Request)));
        }

        for responder in &expected {
            let response = ApplicationParcel::builder()
                .source(responder.clone())
                .route("/aggregate")
                .payload(b"ok".to_vec())
                .extension(brypt_message::Extension::Awaitable {
                    tracker_key: *key.as_bytes(),
                    binding: AwaitableBinding::Response,
                })
                .build()
                .unwrap();
            service.on_response_arrived(&response);
        }

        assert_eq!(service.ready(), 1);
        assert_eq!(service.execute(Instant::now()), 1);
        assert!(sent.load(Ordering::SeqCst));
    }

    #[test]
    fn cancel_removes_tracker_without_invoking_continuations() {
        let service = TrackingService::new();
        let (key, _) = service.stage_request(
            sample_parcel("/cancel-me"),
            Instant::now() + Duration::from_secs(10),
            Box::new(|_| panic!("should not fire")),
            Box::new(|_| panic!("should not fire")),
        );
        service.cancel(key);
        assert_eq!(service.waiting(), 0);
        assert_eq!(service.execute(Instant::now()), 0);
    }
}
