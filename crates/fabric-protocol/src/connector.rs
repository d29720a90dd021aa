// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistent, auto-reconnecting channel to a single worker.
//!
//! A [`MessengerConnector`] owns one TCP connection to its worker and a FIFO
//! of outbound requests. At most one request is in flight at any time; the
//! next one is written only after the previous response has been read (or
//! the request was cancelled).
//!
//! ```text
//!            ┌──────────┐ connect ok ┌───────────────┐
//!   send ──► │ Initial  ├──────────► │ Communicating │
//!            │/Connecting│ ◄──────────┤               │
//!            └────┬─────┘ I/O error  └───────────────┘
//!                 │ connect failed       (in-flight request goes
//!                 ▼                       back to the queue front)
//!        wait retry_timeout_sec
//! ```
//!
//! Delivery is at-least-once: a request whose response was lost to a
//! transport error is written again, byte for byte, on the next connection.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use fabric_config::Configuration;
use prost::Message;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::frame::{FrameError, ProtocolBuffer, read_frame, read_message, write_buffer};
use crate::messages::ResponseHeader;

#[derive(Debug, Error)]
pub enum ConnectorError {
    /// The caller reused an id that is still pending or in flight.
    #[error("request id {0} is already registered")]
    DuplicateId(String),

    #[error("no tokio runtime available to drive the connector")]
    NoRuntime,

    /// The worker answered a different request than the one in flight.
    #[error("response id {got} does not match request id {expected}")]
    IdMismatch { expected: String, got: String },

    #[error("cannot resolve worker address: {0}")]
    Resolve(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Initial,
    Connecting,
    Communicating,
}

/// Type-erased completion: receives the raw response body, or `None` when
/// the request failed at the transport level.
type Completion = Box<dyn FnOnce(Option<Bytes>) + Send>;

struct Wrapper {
    id: String,
    request: Bytes,
    on_finish: Completion,
}

struct Inner {
    state: ConnectorState,
    queue: VecDeque<Wrapper>,
    current: Option<Wrapper>,
    /// Ids of everything in `queue` and `current`.
    ids: HashSet<String>,
    /// Bumped by `stop()`; a driver from an older generation exits.
    generation: u64,
    driver_running: bool,
    /// Cancelled to tear down the current connection.
    session: CancellationToken,
}

struct Shared {
    worker: String,
    config: Arc<Configuration>,
    inner: Mutex<Inner>,
    wakeup: Notify,
}

/// Per-worker request channel. Cheap to clone.
#[derive(Clone)]
pub struct MessengerConnector {
    shared: Arc<Shared>,
}

impl MessengerConnector {
    pub fn new(worker: impl Into<String>, config: Arc<Configuration>) -> Self {
        Self {
            shared: Arc::new(Shared {
                worker: worker.into(),
                config,
                inner: Mutex::new(Inner {
                    state: ConnectorState::Initial,
                    queue: VecDeque::new(),
                    current: None,
                    ids: HashSet::new(),
                    generation: 0,
                    driver_running: false,
                    session: CancellationToken::new(),
                }),
                wakeup: Notify::new(),
            }),
        }
    }

    pub fn worker(&self) -> &str {
        &self.shared.worker
    }

    pub fn state(&self) -> ConnectorState {
        self.shared.lock().state
    }

    /// Queue `request` (an already framed header + body) for delivery.
    ///
    /// `on_finish` is invoked exactly once with `(id, success, response)`
    /// unless the request is cancelled first. On transport failure or an
    /// undecodable response it receives `success == false` and
    /// `R::default()`. Fails if `id` is already registered.
    pub fn send<R, F>(&self, id: impl Into<String>, request: Bytes, on_finish: F) -> Result<(), ConnectorError>
    where
        R: Message + Default + Send + 'static,
        F: FnOnce(String, bool, R) + Send + 'static,
    {
        let id = id.into();
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| ConnectorError::NoRuntime)?;

        let worker = self.shared.worker.clone();
        let callback_id = id.clone();
        let completion: Completion = Box::new(move |body: Option<Bytes>| match body {
            Some(bytes) => match R::decode(bytes) {
                Ok(response) => on_finish(callback_id, true, response),
                Err(e) => {
                    warn!(worker = %worker, id = %callback_id, error = %e, "Failed to decode response body");
                    on_finish(callback_id, false, R::default())
                }
            },
            None => on_finish(callback_id, false, R::default()),
        });

        let spawn_generation = {
            let mut inner = self.shared.lock();
            if !inner.ids.insert(id.clone()) {
                return Err(ConnectorError::DuplicateId(id));
            }
            inner.queue.push_back(Wrapper {
                id,
                request,
                on_finish: completion,
            });
            if inner.driver_running {
                None
            } else {
                inner.driver_running = true;
                Some(inner.generation)
            }
        };

        if let Some(generation) = spawn_generation {
            runtime.spawn(drive(self.shared.clone(), generation));
        }
        self.shared.wakeup.notify_one();
        Ok(())
    }

    /// Forget a request. A queued request is removed; the in-flight one is
    /// dropped and the connection restarted. No callback fires. Unknown ids
    /// are ignored.
    pub fn cancel(&self, id: &str) {
        let removed = {
            let mut inner = self.shared.lock();
            if !inner.ids.remove(id) {
                return;
            }
            if let Some(pos) = inner.queue.iter().position(|w| w.id == id) {
                inner.queue.remove(pos)
            } else if inner.current.as_ref().is_some_and(|w| w.id == id) {
                inner.session.cancel();
                inner.current.take()
            } else {
                None
            }
        };
        if removed.is_some() {
            debug!(worker = %self.shared.worker, %id, "Request cancelled");
        }
    }

    /// True if `id` is queued or in flight.
    pub fn exists(&self, id: &str) -> bool {
        self.shared.lock().ids.contains(id)
    }

    /// Abort all I/O and fail every pending request with `success == false`.
    /// The connector can be used again afterwards.
    pub fn stop(&self) {
        let pending: Vec<Wrapper> = {
            let mut inner = self.shared.lock();
            inner.generation += 1;
            inner.driver_running = false;
            inner.state = ConnectorState::Initial;
            inner.session.cancel();
            inner.ids.clear();
            let current = inner.current.take();
            current.into_iter().chain(inner.queue.drain(..)).collect()
        };
        if !pending.is_empty() {
            info!(worker = %self.shared.worker, count = pending.len(), "Connector stopped, failing pending requests");
        }
        for wrapper in pending {
            (wrapper.on_finish)(None);
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Callbacks never run under the lock, so a poisoned lock still holds
        // consistent queues.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn connect(&self) -> Result<TcpStream, ConnectorError> {
        let info = self
            .config
            .worker_info(&self.worker)
            .map_err(|e| ConnectorError::Resolve(e.to_string()))?;
        let stream = TcpStream::connect(info.svc_addr()).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Connection driver. One per connector generation.
async fn drive(shared: Arc<Shared>, generation: u64) {
    let retry = Duration::from_secs(shared.config.general().retry_timeout_sec);
    let mut buf = ProtocolBuffer::new(shared.config.general().request_buf_size_bytes);

    loop {
        let session = {
            let mut inner = shared.lock();
            if inner.generation != generation {
                return;
            }
            inner.state = ConnectorState::Connecting;
            inner.session = CancellationToken::new();
            inner.session.clone()
        };

        let connected = tokio::select! {
            biased;
            _ = session.cancelled() => None,
            result = shared.connect() => Some(result),
        };
        let Some(connected) = connected else {
            continue;
        };
        let mut stream = match connected {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    worker = %shared.worker,
                    error = %e,
                    retry_sec = retry.as_secs(),
                    "Failed to connect to worker, will retry"
                );
                {
                    let mut inner = shared.lock();
                    if inner.generation != generation {
                        return;
                    }
                    inner.state = ConnectorState::Initial;
                }
                tokio::select! {
                    biased;
                    _ = session.cancelled() => {}
                    _ = tokio::time::sleep(retry) => {}
                }
                continue;
            }
        };

        {
            let mut inner = shared.lock();
            if inner.generation != generation {
                return;
            }
            inner.state = ConnectorState::Communicating;
        }
        debug!(worker = %shared.worker, "Connected to worker");

        loop {
            let next = {
                let mut inner = shared.lock();
                if inner.generation != generation {
                    return;
                }
                if inner.current.is_none() {
                    inner.current = inner.queue.pop_front();
                }
                inner
                    .current
                    .as_ref()
                    .map(|w| (w.id.clone(), w.request.clone()))
            };
            let Some((id, request)) = next else {
                let woken = tokio::select! {
                    biased;
                    _ = session.cancelled() => false,
                    _ = shared.wakeup.notified() => true,
                };
                if woken {
                    continue;
                } else {
                    break;
                }
            };

            let result = tokio::select! {
                biased;
                _ = session.cancelled() => None,
                result = exchange(&mut stream, &mut buf, &id, &request) => Some(result),
            };
            let Some(result) = result else {
                break;
            };

            match result {
                Ok(body) => {
                    let finished = {
                        let mut inner = shared.lock();
                        if inner.generation != generation {
                            return;
                        }
                        take_current(&mut inner, &id)
                    };
                    if let Some(wrapper) = finished {
                        (wrapper.on_finish)(Some(body));
                    }
                }
                Err(e @ ConnectorError::IdMismatch { .. }) => {
                    error!(worker = %shared.worker, error = %e, "Protocol violation, dropping request");
                    let failed = {
                        let mut inner = shared.lock();
                        if inner.generation != generation {
                            return;
                        }
                        take_current(&mut inner, &id)
                    };
                    if let Some(wrapper) = failed {
                        (wrapper.on_finish)(None);
                    }
                    break;
                }
                Err(e) => {
                    warn!(worker = %shared.worker, %id, error = %e, "Connection to worker lost, restarting");
                    break;
                }
            }
        }

        // Restart: whatever was in flight goes first on the next connection.
        {
            let mut inner = shared.lock();
            if inner.generation != generation {
                return;
            }
            if let Some(wrapper) = inner.current.take() {
                inner.queue.push_front(wrapper);
            }
            inner.state = ConnectorState::Initial;
        }
    }
}

/// Remove the in-flight request if it is still `id`.
fn take_current(inner: &mut Inner, id: &str) -> Option<Wrapper> {
    if inner.current.as_ref().is_some_and(|w| w.id == id) {
        inner.ids.remove(id);
        inner.current.take()
    } else {
        None
    }
}

/// Write one request and read back the matching response body.
async fn exchange(
    stream: &mut TcpStream,
    buf: &mut ProtocolBuffer,
    id: &str,
    request: &[u8],
) -> Result<Bytes, ConnectorError> {
    write_buffer(stream, request).await?;
    let header: ResponseHeader = read_message(stream, buf).await?;
    if header.id != id {
        return Err(ConnectorError::IdMismatch {
            expected: id.to_string(),
            got: header.id,
        });
    }
    read_frame(stream, buf).await?;
    Ok(buf.payload())
}
