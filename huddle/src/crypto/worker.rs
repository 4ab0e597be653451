//! Isolated crypto worker.
//!
//! Codec work runs on a dedicated OS thread that owns the group key and
//! sender key. Callers talk to it through [`CryptoClient`]: every request
//! carries a fresh id, and the reply is routed back to the pending call
//! registered under that id. Overlapping calls therefore cannot receive
//! each other's results, whatever order the worker answers in.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::thread;

use huddle_proto::packed::PUBLIC_KEY_LEN;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::codec::{self, Unpacked};
use super::keys::{GroupKey, SenderKeyPair};
use super::CryptoError;

/// Work the thread can do.
#[derive(Debug)]
enum Request {
    Pack(Vec<u8>),
    Unpack(Vec<u8>),
}

/// Worker answer for one request.
#[derive(Debug)]
enum Response {
    Packed(Result<Vec<u8>, CryptoError>),
    Unpacked(Result<Unpacked, CryptoError>),
}

/// A request tagged with its correlation id.
#[derive(Debug)]
struct Envelope {
    id: u64,
    request: Request,
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>;

struct Inner {
    requests: std_mpsc::Sender<Envelope>,
    pending: Pending,
    next_id: AtomicU64,
    public_key: [u8; PUBLIC_KEY_LEN],
}

/// Handle to the crypto worker thread. Cheap to clone.
///
/// The thread exits once every clone has been dropped.
#[derive(Clone)]
pub struct CryptoClient {
    inner: Arc<Inner>,
}

impl CryptoClient {
    /// Starts the worker thread, moving the keys into it.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Worker`] if the OS refuses to spawn the thread.
    pub fn spawn(group_key: GroupKey, sender: SenderKeyPair) -> Result<Self, CryptoError> {
        let (tx, rx) = std_mpsc::channel::<Envelope>();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let public_key = sender.public_key();

        let worker_pending = Arc::clone(&pending);
        thread::Builder::new()
            .name("huddle-crypto".to_string())
            .spawn(move || run_worker(&rx, &worker_pending, &group_key, &sender))
            .map_err(|e| CryptoError::Worker(format!("failed to spawn worker: {e}")))?;

        tracing::debug!("crypto worker started");
        Ok(Self {
            inner: Arc::new(Inner {
                requests: tx,
                pending,
                next_id: AtomicU64::new(1),
                public_key,
            }),
        })
    }

    /// Public half of the sender key held by the worker.
    #[must_use]
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.inner.public_key
    }

    /// Encrypts and signs `plaintext` on the worker.
    ///
    /// # Errors
    ///
    /// Returns the codec's error, or [`CryptoError::Worker`] if the worker
    /// has gone away.
    pub async fn pack(&self, plaintext: Vec<u8>) -> Result<Vec<u8>, CryptoError> {
        match self.call(Request::Pack(plaintext)).await? {
            Response::Packed(result) => result,
            Response::Unpacked(_) => Err(mismatched()),
        }
    }

    /// Verifies and decrypts `bytes` on the worker.
    ///
    /// # Errors
    ///
    /// Returns the codec's error, or [`CryptoError::Worker`] if the worker
    /// has gone away.
    pub async fn unpack(&self, bytes: Vec<u8>) -> Result<Unpacked, CryptoError> {
        match self.call(Request::Unpack(bytes)).await? {
            Response::Unpacked(result) => result,
            Response::Packed(_) => Err(mismatched()),
        }
    }

    /// Number of calls awaiting a reply.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.pending.lock().len()
    }

    async fn call(&self, request: Request) -> Result<Response, CryptoError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(id, tx);

        if self
            .inner
            .requests
            .send(Envelope { id, request })
            .is_err()
        {
            self.inner.pending.lock().remove(&id);
            return Err(CryptoError::Worker("worker thread has exited".to_string()));
        }

        rx.await
            .map_err(|_| CryptoError::Worker(format!("request {id} was dropped")))
    }
}

impl std::fmt::Debug for CryptoClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoClient")
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

fn mismatched() -> CryptoError {
    CryptoError::Worker("reply kind does not match request".to_string())
}

/// Worker thread body: serve requests until every client is dropped.
fn run_worker(
    requests: &std_mpsc::Receiver<Envelope>,
    pending: &Pending,
    group_key: &GroupKey,
    sender: &SenderKeyPair,
) {
    while let Ok(Envelope { id, request }) = requests.recv() {
        let response = match request {
            Request::Pack(plaintext) => {
                Response::Packed(codec::pack(group_key, sender, &plaintext))
            }
            Request::Unpack(bytes) => Response::Unpacked(codec::unpack(group_key, &bytes)),
        };

        let Some(reply) = pending.lock().remove(&id) else {
            tracing::debug!(id, "no pending call for crypto reply");
            continue;
        };
        // The caller may have given up; nothing to do then.
        let _ = reply.send(response);
    }
    tracing::debug!("crypto worker exiting");
}
