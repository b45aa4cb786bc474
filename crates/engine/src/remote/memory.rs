use std::collections::HashMap;
use std::ops::Range;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::{ChunkAck, RemoteEntry, RemoteError, RemoteErrorKind, RemoteStorage, UploadTarget};

/// Remote operation names, used to aim injected faults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    Stat,
    Download,
    UploadSmall,
    OpenSession,
    UploadChunk,
    SessionOffset,
    CancelSession,
}

/// One logged call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteRequest {
    Stat { id: String },
    Download { id: String, range: Range<u64> },
    UploadSmall { id: String, len: u64 },
    OpenSession { id: String, total: u64 },
    UploadChunk { id: String, session: String, offset: u64, len: u64 },
    SessionOffset { session: String },
    CancelSession { session: String },
}

/// A failure to inject into matching calls
#[derive(Debug, Clone)]
pub struct Fault {
    op: RemoteOp,
    kind: RemoteErrorKind,
    id: Option<String>,
    offset: Option<u64>,
    remaining: usize,
}

impl Fault {
    /// Fail the next matching call once
    pub fn new(op: RemoteOp, kind: RemoteErrorKind) -> Self {
        Self {
            op,
            kind,
            id: None,
            offset: None,
            remaining: 1,
        }
    }

    pub fn times(mut self, n: usize) -> Self {
        self.remaining = n;
        self
    }

    pub fn for_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Only calls starting at this byte offset (downloads and chunks)
    pub fn at_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    fn matches(&self, op: RemoteOp, id: &str, offset: Option<u64>) -> bool {
        self.remaining > 0
            && self.op == op
            && self.id.as_deref().map_or(true, |f| f == id)
            && self.offset.map_or(true, |f| Some(f) == offset)
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    etag: String,
}

#[derive(Debug)]
struct Session {
    target: UploadTarget,
    total: u64,
    received: Vec<u8>,
}

#[derive(Debug, Default)]
struct State {
    objects: HashMap<String, StoredObject>,
    sessions: HashMap<String, Session>,
    next_etag: u64,
    next_session: u64,
    faults: Vec<Fault>,
    requests: Vec<RemoteRequest>,
    latency: Option<Duration>,
}

impl State {
    fn new_etag(&mut self) -> String {
        self.next_etag += 1;
        format!("etag-{}", self.next_etag)
    }

    fn store(&mut self, id: &str, data: Bytes) -> RemoteEntry {
        let etag = self.new_etag();
        let size = data.len() as u64;
        self.objects.insert(
            id.to_string(),
            StoredObject {
                data,
                etag: etag.clone(),
            },
        );
        RemoteEntry {
            id: id.to_string(),
            etag,
            size,
        }
    }

    fn check_fault(&mut self, op: RemoteOp, id: &str, offset: Option<u64>) -> Result<(), RemoteError> {
        if let Some(fault) = self.faults.iter_mut().find(|f| f.matches(op, id, offset)) {
            fault.remaining -= 1;
            return Err(RemoteError::new(
                fault.kind,
                format!("injected {:?} on {:?}", fault.kind, op),
            ));
        }
        Ok(())
    }

    fn session_id(&self, session: &str) -> String {
        self.sessions
            .get(session)
            .map(|s| s.target.id.clone())
            .unwrap_or_default()
    }
}

/// In-memory remote storage with fault injection and a request log
#[derive(Debug, Default)]
pub struct MemoryRemote {
    state: Mutex<State>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace an object, returning its new etag
    pub fn insert(&self, id: &str, data: impl Into<Bytes>) -> String {
        self.state.lock().store(id, data.into()).etag
    }

    pub fn remove(&self, id: &str) -> bool {
        self.state.lock().objects.remove(id).is_some()
    }

    pub fn content(&self, id: &str) -> Option<Bytes> {
        self.state.lock().objects.get(id).map(|o| o.data.clone())
    }

    pub fn etag(&self, id: &str) -> Option<String> {
        self.state.lock().objects.get(id).map(|o| o.etag.clone())
    }

    pub fn inject(&self, fault: Fault) {
        self.state.lock().faults.push(fault);
    }

    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().latency = latency;
    }

    /// Forget every open session, as a service does when sessions time out
    pub fn expire_sessions(&self) {
        self.state.lock().sessions.clear();
    }

    pub fn open_sessions(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn requests(&self) -> Vec<RemoteRequest> {
        self.state.lock().requests.clone()
    }

    pub fn clear_requests(&self) {
        self.state.lock().requests.clear();
    }

    /// Offsets of every chunk sent for `id`, in call order
    pub fn chunk_offsets(&self, id: &str) -> Vec<u64> {
        self.state
            .lock()
            .requests
            .iter()
            .filter_map(|r| match r {
                RemoteRequest::UploadChunk { id: rid, offset, .. } if rid == id => Some(*offset),
                _ => None,
            })
            .collect()
    }

    /// Number of download calls made for `id`
    pub fn download_count(&self, id: &str) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| matches!(r, RemoteRequest::Download { id: rid, .. } if rid == id))
            .count()
    }

    async fn delay(&self) {
        let latency = self.state.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl RemoteStorage for MemoryRemote {
    async fn stat(&self, id: &str) -> Result<RemoteEntry, RemoteError> {
        self.delay().await;
        let mut state = self.state.lock();
        state.requests.push(RemoteRequest::Stat { id: id.to_string() });
        state.check_fault(RemoteOp::Stat, id, None)?;
        state
            .objects
            .get(id)
            .map(|o| RemoteEntry {
                id: id.to_string(),
                etag: o.etag.clone(),
                size: o.data.len() as u64,
            })
            .ok_or_else(|| RemoteError::not_found(id))
    }

    async fn download_chunk(
        &self,
        id: &str,
        etag: &str,
        range: Range<u64>,
    ) -> Result<Bytes, RemoteError> {
        self.delay().await;
        let mut state = self.state.lock();
        state.requests.push(RemoteRequest::Download {
            id: id.to_string(),
            range: range.clone(),
        });
        state.check_fault(RemoteOp::Download, id, Some(range.start))?;

        let object = state.objects.get(id).ok_or_else(|| RemoteError::not_found(id))?;
        if object.etag != etag {
            return Err(RemoteError::new(
                RemoteErrorKind::PreconditionFailed,
                format!("{id} is at {}, not {etag}", object.etag),
            ));
        }
        let len = object.data.len() as u64;
        if range.start > len || range.start > range.end {
            return Err(RemoteError::new(
                RemoteErrorKind::Rejected,
                format!("range {range:?} outside {len} bytes"),
            ));
        }
        let end = range.end.min(len);
        Ok(object.data.slice(range.start as usize..end as usize))
    }

    async fn upload_small(
        &self,
        target: &UploadTarget,
        data: Bytes,
    ) -> Result<RemoteEntry, RemoteError> {
        self.delay().await;
        let mut state = self.state.lock();
        state.requests.push(RemoteRequest::UploadSmall {
            id: target.id.clone(),
            len: data.len() as u64,
        });
        state.check_fault(RemoteOp::UploadSmall, &target.id, None)?;
        Ok(state.store(&target.id, data))
    }

    async fn open_upload_session(
        &self,
        target: &UploadTarget,
        total: u64,
    ) -> Result<String, RemoteError> {
        self.delay().await;
        let mut state = self.state.lock();
        state.requests.push(RemoteRequest::OpenSession {
            id: target.id.clone(),
            total,
        });
        state.check_fault(RemoteOp::OpenSession, &target.id, None)?;

        state.next_session += 1;
        let session = format!("session-{}", state.next_session);
        state.sessions.insert(
            session.clone(),
            Session {
                target: target.clone(),
                total,
                received: Vec::new(),
            },
        );
        Ok(session)
    }

    async fn upload_chunk(
        &self,
        session: &str,
        offset: u64,
        data: Bytes,
        total: u64,
    ) -> Result<ChunkAck, RemoteError> {
        self.delay().await;
        let mut state = self.state.lock();
        let id = state.session_id(session);
        state.requests.push(RemoteRequest::UploadChunk {
            id: id.clone(),
            session: session.to_string(),
            offset,
            len: data.len() as u64,
        });
        state.check_fault(RemoteOp::UploadChunk, &id, Some(offset))?;

        let upload = state.sessions.get_mut(session).ok_or_else(|| {
            RemoteError::new(RemoteErrorKind::SessionExpired, format!("{session} is unknown"))
        })?;
        if upload.total != total {
            return Err(RemoteError::new(
                RemoteErrorKind::Rejected,
                format!("session total is {}, got {total}", upload.total),
            ));
        }
        let received = upload.received.len() as u64;
        if offset > received {
            return Err(RemoteError::new(
                RemoteErrorKind::Rejected,
                format!("chunk at {offset} leaves a gap after {received}"),
            ));
        }
        upload.received.truncate(offset as usize);
        upload.received.extend_from_slice(&data);
        let received = upload.received.len() as u64;

        if received < upload.total {
            return Ok(ChunkAck::Accepted {
                next_offset: received,
            });
        }

        let finished = state
            .sessions
            .remove(session)
            .ok_or_else(|| RemoteError::new(RemoteErrorKind::SessionExpired, session))?;
        let entry = state.store(&finished.target.id, Bytes::from(finished.received));
        Ok(ChunkAck::Completed(entry))
    }

    async fn session_offset(&self, session: &str) -> Result<u64, RemoteError> {
        self.delay().await;
        let mut state = self.state.lock();
        let id = state.session_id(session);
        state.requests.push(RemoteRequest::SessionOffset {
            session: session.to_string(),
        });
        state.check_fault(RemoteOp::SessionOffset, &id, None)?;
        state
            .sessions
            .get(session)
            .map(|s| s.received.len() as u64)
            .ok_or_else(|| {
                RemoteError::new(RemoteErrorKind::SessionExpired, format!("{session} is unknown"))
            })
    }

    async fn cancel_upload_session(&self, session: &str) -> Result<(), RemoteError> {
        self.delay().await;
        let mut state = self.state.lock();
        let id = state.session_id(session);
        state.requests.push(RemoteRequest::CancelSession {
            session: session.to_string(),
        });
        state.check_fault(RemoteOp::CancelSession, &id, None)?;
        state.sessions.remove(session);
        Ok(())
    }
}
