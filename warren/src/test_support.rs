//! Scripted fakes shared by the unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use n0_future::boxed::BoxFuture;
use warren_base::{ChannelKey, ContentId};

use crate::access::{self, WriteAccess};
use crate::docs::Document;
use crate::error::{
    ConnectionError, NoRecordSnafu, ResolveError, SizeLimitSnafu, SyncError, TimeoutSnafu,
    UnreachableSnafu,
};
use crate::followees::FolloweeSet;
use crate::net::NetworkOps;
use crate::prefs::Prefs;
use crate::txn::StateResolver;

pub(crate) fn cid(n: u8) -> ContentId {
    ContentId::from([n; 32])
}

pub(crate) fn key(n: u8) -> ChannelKey {
    ChannelKey::from([n; 32])
}

/// Every operation the fake network observed, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NetCall {
    Pin(ContentId),
    Unpin(ContentId),
    Size(ContentId),
    Load(ContentId),
    Fetch(ContentId),
    Resolve(ChannelKey),
}

#[derive(Debug, Default)]
struct FakeNetState {
    blobs: HashMap<ContentId, Bytes>,
    sizes: HashMap<ContentId, u64>,
    keys: HashMap<ChannelKey, ContentId>,
    pinned: HashSet<ContentId>,
    fail_pins: HashSet<ContentId>,
    fail_sizes: HashSet<ContentId>,
    calls: Vec<NetCall>,
}

/// In-memory store with scripted failures.  All futures resolve
/// immediately, which trivially satisfies the hot-future contract.
#[derive(Debug, Default)]
pub(crate) struct FakeNet {
    state: Mutex<FakeNetState>,
}

impl FakeNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put_doc<T: Document>(&self, cid: ContentId, doc: &T) {
        let bytes = doc.encode();
        let mut state = self.state.lock().unwrap();
        state.sizes.insert(cid, bytes.len() as u64);
        state.blobs.insert(cid, bytes);
    }

    /// Registers a blob of the given size whose content is filler bytes
    /// (deliberately not decodable as any document).
    pub fn put_blob(&self, cid: ContentId, size: u64) {
        let mut state = self.state.lock().unwrap();
        state.sizes.insert(cid, size);
        state
            .blobs
            .insert(cid, Bytes::from(vec![0xff; size.min(64) as usize]));
    }

    pub fn set_key(&self, key: ChannelKey, root: ContentId) {
        self.state.lock().unwrap().keys.insert(key, root);
    }

    pub fn fail_pin(&self, cid: ContentId) {
        self.state.lock().unwrap().fail_pins.insert(cid);
    }

    pub fn fail_size(&self, cid: ContentId) {
        self.state.lock().unwrap().fail_sizes.insert(cid);
    }

    pub fn clear_pin_failures(&self) {
        self.state.lock().unwrap().fail_pins.clear();
    }

    /// Marks a cid pinned without going through the recorded surface,
    /// for seeding pre-existing state.
    pub fn force_pin(&self, cid: ContentId) {
        self.state.lock().unwrap().pinned.insert(cid);
    }

    pub fn is_pinned(&self, cid: ContentId) -> bool {
        self.state.lock().unwrap().pinned.contains(&cid)
    }

    pub fn calls(&self) -> Vec<NetCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count_calls(&self, filter: impl Fn(&NetCall) -> bool) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .copied()
            .filter(|call| filter(call))
            .count()
    }
}

fn ready<T: Send + 'static>(value: T) -> BoxFuture<T> {
    Box::pin(std::future::ready(value))
}

impl NetworkOps for FakeNet {
    fn pin(&self, cid: ContentId) -> BoxFuture<Result<(), ConnectionError>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(NetCall::Pin(cid));
        if state.fail_pins.contains(&cid) {
            return ready(Err(TimeoutSnafu { op: "pin" }.build()));
        }
        state.pinned.insert(cid);
        ready(Ok(()))
    }

    fn unpin(&self, cid: ContentId) -> Result<(), ConnectionError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(NetCall::Unpin(cid));
        state.pinned.remove(&cid);
        Ok(())
    }

    fn size_bytes(&self, cid: ContentId) -> BoxFuture<Result<u64, ConnectionError>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(NetCall::Size(cid));
        if state.fail_sizes.contains(&cid) {
            return ready(Err(TimeoutSnafu { op: "size" }.build()));
        }
        ready(
            state
                .sizes
                .get(&cid)
                .copied()
                .ok_or_else(|| UnreachableSnafu.build()),
        )
    }

    fn load_cached(&self, cid: ContentId) -> BoxFuture<Result<Bytes, ConnectionError>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(NetCall::Load(cid));
        ready(
            state
                .blobs
                .get(&cid)
                .cloned()
                .ok_or_else(|| UnreachableSnafu.build()),
        )
    }

    fn load_not_cached(
        &self,
        cid: ContentId,
        context: &'static str,
        max_bytes: u64,
    ) -> BoxFuture<Result<Bytes, SyncError>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(NetCall::Fetch(cid));
        let result = match (state.sizes.get(&cid), state.blobs.get(&cid)) {
            (Some(&size), _) if size > max_bytes => Err(SizeLimitSnafu {
                context,
                size_bytes: size,
                limit_bytes: max_bytes,
            }
            .build()
            .into()),
            (_, Some(bytes)) => Ok(bytes.clone()),
            _ => Err(SyncError::from(UnreachableSnafu.build())),
        };
        ready(result)
    }

    fn resolve_key(&self, key: ChannelKey) -> BoxFuture<Result<ContentId, ResolveError>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(NetCall::Resolve(key));
        ready(
            state
                .keys
                .get(&key)
                .copied()
                .ok_or_else(|| NoRecordSnafu { key }.build()),
        )
    }
}

/// Authoritative state for tests: a reference-count pin table plus the
/// followee projections, resolving transactions through
/// [`access::apply_pin_deltas`].
#[derive(Debug)]
pub(crate) struct FakeAccess {
    pub net: Arc<FakeNet>,
    pub prefs: Prefs,
    pub followees: FolloweeSet,
    pub pin_counts: HashMap<ContentId, u64>,
}

impl FakeAccess {
    pub fn new(net: Arc<FakeNet>) -> Self {
        Self {
            net,
            prefs: Prefs::default(),
            followees: FolloweeSet::new(),
            pin_counts: HashMap::new(),
        }
    }

    /// Seeds an authoritative pin, as if an earlier refresh created it.
    pub fn seed_pin(&mut self, cid: ContentId) {
        *self.pin_counts.entry(cid).or_insert(0) += 1;
        self.net.force_pin(cid);
    }
}

impl StateResolver for FakeAccess {
    fn apply_pin_changes(
        &mut self,
        deltas: HashMap<ContentId, i64>,
        false_pins: HashSet<ContentId>,
    ) {
        let net = self.net.clone();
        access::apply_pin_deltas(&mut self.pin_counts, deltas, false_pins, |cid| {
            let _ = net.unpin(cid);
        });
    }
}

impl WriteAccess for FakeAccess {
    fn net(&self) -> Arc<dyn NetworkOps> {
        self.net.clone()
    }

    fn prefs(&self) -> &Prefs {
        &self.prefs
    }

    fn pinned_snapshot(&self) -> HashSet<ContentId> {
        self.pin_counts.keys().copied().collect()
    }

    fn followees(&mut self) -> &mut FolloweeSet {
        &mut self.followees
    }

    fn unpin_now(&mut self, cid: ContentId) -> Result<(), ConnectionError> {
        self.pin_counts.remove(&cid);
        self.net.unpin(cid)
    }
}
