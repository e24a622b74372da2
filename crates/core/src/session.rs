//! Transport session: one REPL connection, strictly serialized commands
//!
//! The session owns the transport and demultiplexes device output:
//! - **fire-and-forget** writes leave no trace; whatever the board prints is
//!   forwarded to the output sink for live display
//! - **synchronous exchanges** capture output into a [`PendingExchange`] until
//!   the response decoder reports completion, then resolve the waiting caller
//!
//! The REPL has no request identifiers, so at most one exchange can be in
//! flight; a second caller gets [`CoreError::Busy`]. Incoming bytes enter only
//! through [`TransportSession::on_bytes_received`], which is synchronous and
//! safe to call from the transport's I/O thread.
//!
//! Each exchange carries a generation number, echoed back by the board in its
//! end-of-output token. An exchange that times out is parked as *stale* so its
//! late output is swallowed instead of completing the next exchange; a token
//! of a newer generation means the stale reply was lost, and the buffered
//! bytes are handed on.

use bytes::Bytes;
use std::borrow::Cow;
use std::sync::{Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::error::{CoreError, ErrorKind, Result};
use crate::protocol::{CommandBuilder, ControlSequence, RawResponse, ResponseDecoder};
use crate::streaming::OutputSink;
use crate::transport::Transport;
use crate::types::{ConnectionState, DeviceInfo};

/// Session timing and buffering
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Deadline for listings, reads and raw execution
    pub read_timeout: Duration,
    /// Deadline for writes and filesystem mutations
    pub write_timeout: Duration,
    /// Deadline handed to `Transport::write`
    pub transport_write_timeout: Duration,
    /// How long late output of a timed-out exchange is swallowed
    pub stale_grace: Duration,
    /// Output sink capacity in chunks
    pub output_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(2),
            transport_write_timeout: Duration::from_secs(1),
            stale_grace: Duration::from_secs(5),
            output_capacity: 1024,
        }
    }
}

impl SessionConfig {
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_stale_grace(mut self, grace: Duration) -> Self {
        self.stale_grace = grace;
        self
    }

    pub fn with_output_capacity(mut self, capacity: usize) -> Self {
        self.output_capacity = capacity;
        self
    }
}

/// Rule deciding when an exchange has its whole response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Completion {
    /// Friendly REPL: end-of-output token with this generation (or traceback + prompt)
    Sentinel(u64),
    /// Raw REPL: `OK`, output, `\x04`, error, `\x04`
    RawRepl,
}

/// What late output means for a stale exchange
enum LateOutput {
    Waiting,
    /// Own response ends at this offset
    Finished(usize),
    /// A newer exchange answered first; the stale response is lost
    Superseded,
}

impl Completion {
    fn find(self, buffer: &[u8]) -> Option<usize> {
        match self {
            Completion::Sentinel(generation) => ResponseDecoder::find_tagged_completion(buffer, generation),
            Completion::RawRepl => ResponseDecoder::find_raw_completion(buffer),
        }
    }

    /// Tracebacks are not attributed to a stale exchange, only its own token
    fn settle_late(self, generation: u64, buffer: &[u8]) -> LateOutput {
        let own = match self {
            Completion::Sentinel(tag) => ResponseDecoder::find_own_token(buffer, tag),
            Completion::RawRepl => ResponseDecoder::find_raw_completion(buffer),
        };
        match own {
            Some(end) => LateOutput::Finished(end),
            None if ResponseDecoder::newest_tag(buffer).is_some_and(|tag| tag > generation) => {
                LateOutput::Superseded
            }
            None => LateOutput::Waiting,
        }
    }
}

/// The one in-flight synchronous exchange
struct PendingExchange {
    generation: u64,
    completion: Completion,
    buffer: Vec<u8>,
    resolver: oneshot::Sender<Result<String>>,
}

/// A timed-out exchange whose late output must not leak into the next one
struct StaleExchange {
    generation: u64,
    completion: Completion,
    buffer: Vec<u8>,
    expires_at: Instant,
}

#[derive(Default)]
struct ExchangeSlot {
    generation: u64,
    pending: Option<PendingExchange>,
    stale: Option<StaleExchange>,
}

impl ExchangeSlot {
    /// Feed bytes to the stale exchange, returning what is left for routing
    fn drain_stale<'a>(&mut self, data: &'a [u8]) -> Option<Cow<'a, [u8]>> {
        let Some(stale) = self.stale.as_mut() else {
            return Some(Cow::Borrowed(data));
        };

        if Instant::now() >= stale.expires_at {
            debug!(
                "Exchange #{} never finished, releasing {} stale bytes",
                stale.generation,
                stale.buffer.len()
            );
            self.stale = None;
            return Some(Cow::Borrowed(data));
        }

        stale.buffer.extend_from_slice(data);
        match stale.completion.settle_late(stale.generation, &stale.buffer) {
            LateOutput::Finished(end) => {
                let leftover = stale.buffer.split_off(end);
                debug!(
                    "Discarded late response of exchange #{} ({} bytes)",
                    stale.generation,
                    stale.buffer.len()
                );
                self.stale = None;
                Some(Cow::Owned(leftover))
            }
            LateOutput::Superseded => {
                let buffered = std::mem::take(&mut stale.buffer);
                debug!(
                    "Exchange #{} was never answered, passing on {} bytes",
                    stale.generation,
                    buffered.len()
                );
                self.stale = None;
                Some(Cow::Owned(buffered))
            }
            LateOutput::Waiting => {
                trace!("Exchange #{} swallowed {} late bytes", stale.generation, data.len());
                None
            }
        }
    }
}

/// Stateful REPL session over one transport
pub struct TransportSession {
    transport: Mutex<Box<dyn Transport>>,
    slot: StdMutex<ExchangeSlot>,
    state: watch::Sender<ConnectionState>,
    output: OutputSink,
    config: SessionConfig,
}

impl TransportSession {
    /// Create a disconnected session
    ///
    /// # Returns
    /// * `(TransportSession, mpsc::Receiver<Bytes>)` - session and live output
    pub fn new(transport: Box<dyn Transport>, config: SessionConfig) -> (Self, mpsc::Receiver<Bytes>) {
        let (output, output_rx) = OutputSink::new(config.output_capacity);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let session = Self {
            transport: Mutex::new(transport),
            slot: StdMutex::new(ExchangeSlot::default()),
            state,
            output,
            config,
        };
        (session, output_rx)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Observe connection state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Connected device, if any
    pub fn device(&self) -> Option<DeviceInfo> {
        self.state.borrow().device().cloned()
    }

    /// Whether a synchronous exchange is in flight
    pub fn is_busy(&self) -> bool {
        self.lock_slot().pending.is_some()
    }

    /// Bytes the output sink had to drop
    pub fn dropped_output_bytes(&self) -> u64 {
        self.output.dropped_bytes()
    }

    // ===== Lifecycle =====

    /// Open the transport for `device`
    pub async fn open(&self, device: DeviceInfo) -> Result<()> {
        self.set_state(ConnectionState::Connecting);
        let result = self.transport.lock().await.open().await;
        match result {
            Ok(()) => {
                info!(
                    "Connected to {} ({}) on {}",
                    device.description,
                    device.runtime_name(),
                    device.port
                );
                self.set_state(ConnectionState::Connected(device));
                Ok(())
            }
            Err(e) => {
                error!("Failed to open {}: {}", device.port, e);
                self.fail(e.kind(), e.to_string());
                Err(e)
            }
        }
    }

    /// Close the transport and fail anything still pending
    pub async fn close(&self) -> Result<()> {
        let result = self.transport.lock().await.close().await;
        self.abort_pending(CoreError::ConnectionLost("session closed".into()));
        self.set_state(ConnectionState::Disconnected);
        info!("Session closed");
        result
    }

    /// Lifecycle notification from the transport owner
    pub fn notify_connection_state(&self, state: ConnectionState) {
        match state {
            ConnectionState::Failed(kind, message) => self.fail(kind, message),
            ConnectionState::Disconnected => {
                self.abort_pending(CoreError::ConnectionLost("device disconnected".into()));
                self.set_state(ConnectionState::Disconnected);
            }
            other => self.set_state(other),
        }
    }

    /// I/O failure reported by the transport's read loop
    pub fn on_transport_error(&self, error: CoreError) {
        error!("Transport error: {}", error);
        let kind = error.kind();
        let kind = if kind.is_connection_failure() {
            kind
        } else {
            ErrorKind::ConnectionLost
        };
        self.fail(kind, error.to_string());
    }

    // ===== Outgoing =====

    /// Write raw bytes (control sequences, paste blocks) without tracking
    pub async fn send_bytes(&self, data: &[u8]) -> Result<()> {
        self.ensure_connected()?;
        self.write(data).await
    }

    /// Send one REPL line; output streams to the sink
    pub async fn send_fire_and_forget(&self, text: &str) -> Result<()> {
        debug!("Sending line ({} bytes)", text.len());
        self.send_bytes(&CommandBuilder::frame_line(text)).await
    }

    /// Send a generated command and wait for its sentinel-wrapped payload
    ///
    /// `text` must be simple statements ending in a payload print from
    /// [`CommandBuilder`]; the session prefixes the generation it prints.
    /// Resolves with the extracted payload, or an empty string when the
    /// output carried no markers (e.g. the command raised).
    pub async fn send_synchronous(&self, text: &str, timeout: Duration) -> Result<String> {
        let frame = |generation: u64| CommandBuilder::frame_line(&CommandBuilder::tag_exchange(text, generation));
        let response = self.exchange(Completion::Sentinel, frame, timeout).await?;
        let payload = ResponseDecoder::extract_payload(&response, "");
        if payload.is_empty() {
            debug!("Exchange finished without payload markers ({} bytes)", response.len());
        }
        Ok(payload)
    }

    /// Run code through the raw REPL and capture output and exception text
    ///
    /// Always leaves raw mode afterwards. When the board never acknowledges
    /// the code the session forces a soft reset back to the friendly REPL and
    /// reports [`CoreError::ProtocolDesync`].
    pub async fn execute_raw(&self, code: &str, timeout: Duration) -> Result<RawResponse> {
        let frame = |_: u64| CommandBuilder::wrap_for_sync_execution(code);
        match self.exchange(|_| Completion::RawRepl, frame, timeout).await {
            Ok(response) => {
                self.write(&ControlSequence::EnterInteractiveMode.as_bytes()).await?;
                ResponseDecoder::decode_raw_response(&response)
            }
            Err(CoreError::ProtocolDesync(reason)) => {
                warn!("Raw REPL desync: {}", reason);
                self.recover_from_desync().await;
                Err(CoreError::ProtocolDesync(reason))
            }
            Err(e) => {
                if self.state.borrow().is_connected() {
                    if let Err(exit) = self.write(&ControlSequence::EnterInteractiveMode.as_bytes()).await {
                        warn!("Leaving raw REPL failed: {}", exit);
                    }
                }
                Err(e)
            }
        }
    }

    /// Interrupt running code and abort the pending exchange
    ///
    /// Does not wait for the board to acknowledge; the pending exchange (if
    /// any) resolves with [`CoreError::Terminated`].
    pub async fn terminate_execution(&self) -> Result<()> {
        info!("Terminating running code");
        let sent = self.send_bytes(&ControlSequence::Terminate.as_bytes()).await;
        self.abort_pending(CoreError::Terminated);
        sent
    }

    /// Interrupt, leave raw mode and soft reboot the interpreter
    pub async fn soft_reset(&self) -> Result<()> {
        info!("Soft reset");
        let sent = self.send_bytes(&CommandBuilder::soft_reset_sequence()).await;
        self.abort_pending(CoreError::Terminated);
        sent
    }

    // ===== Incoming =====

    /// Single entry point for bytes read from the device
    pub fn on_bytes_received(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        let mut slot = self.lock_slot();
        let Some(data) = slot.drain_stale(data) else {
            return;
        };
        if data.is_empty() {
            return;
        }

        if slot.pending.is_none() {
            drop(slot);
            self.output.deliver(Bytes::copy_from_slice(&data));
            return;
        }

        let end = match slot.pending.as_mut() {
            Some(pending) => {
                pending.buffer.extend_from_slice(&data);
                match pending.completion.find(&pending.buffer) {
                    Some(end) => end,
                    None => {
                        trace!(
                            "Exchange #{} buffered {} bytes",
                            pending.generation,
                            pending.buffer.len()
                        );
                        return;
                    }
                }
            }
            None => return,
        };

        let Some(mut pending) = slot.pending.take() else {
            return;
        };
        drop(slot);

        let trailing = pending.buffer.split_off(end);
        let response = String::from_utf8_lossy(&pending.buffer).into_owned();
        debug!("Exchange #{} complete ({} bytes)", pending.generation, response.len());
        if pending.resolver.send(Ok(response)).is_err() {
            debug!("Exchange #{} caller went away", pending.generation);
        }
        self.output.deliver(Bytes::from(trailing));
    }

    // ===== Internals =====

    async fn exchange(
        &self,
        completion: fn(u64) -> Completion,
        frame: impl FnOnce(u64) -> Vec<u8>,
        timeout: Duration,
    ) -> Result<String> {
        self.ensure_connected()?;
        let (generation, mut rx) = self.begin_exchange(completion)?;
        let framed = frame(generation);
        debug!("Exchange #{} started ({} bytes)", generation, framed.len());

        if let Err(e) = self.write(&framed).await {
            self.abandon(generation);
            return Err(e);
        }

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CoreError::ConnectionLost(format!(
                "exchange #{} dropped",
                generation
            ))),
            Err(_) => self.expire(generation, timeout, &mut rx),
        }
    }

    fn begin_exchange(
        &self,
        completion: fn(u64) -> Completion,
    ) -> Result<(u64, oneshot::Receiver<Result<String>>)> {
        let mut slot = self.lock_slot();
        if let Some(pending) = &slot.pending {
            warn!("Rejecting exchange: #{} still in flight", pending.generation);
            return Err(CoreError::Busy);
        }
        slot.generation += 1;
        let generation = slot.generation;
        let (resolver, rx) = oneshot::channel();
        slot.pending = Some(PendingExchange {
            generation,
            completion: completion(generation),
            buffer: Vec::new(),
            resolver,
        });
        Ok((generation, rx))
    }

    /// Drop our pending exchange after a failed write
    fn abandon(&self, generation: u64) {
        let mut slot = self.lock_slot();
        if matches!(&slot.pending, Some(p) if p.generation == generation) {
            slot.pending = None;
        }
    }

    /// Deadline passed: park the exchange as stale and report the timeout
    fn expire(
        &self,
        generation: u64,
        timeout: Duration,
        rx: &mut oneshot::Receiver<Result<String>>,
    ) -> Result<String> {
        let millis = timeout.as_millis() as u64;
        let mut slot = self.lock_slot();
        let ours = match slot.pending.take() {
            Some(pending) if pending.generation == generation => Some(pending),
            other => {
                slot.pending = other;
                None
            }
        };

        let Some(pending) = ours else {
            drop(slot);
            // resolved between the deadline and taking the lock
            return rx.try_recv().unwrap_or(Err(CoreError::Timeout(millis)));
        };

        if pending.completion == Completion::RawRepl
            && !ResponseDecoder::has_raw_ack(&String::from_utf8_lossy(&pending.buffer))
        {
            return Err(CoreError::ProtocolDesync(format!(
                "no acknowledgement within {}ms",
                millis
            )));
        }

        warn!("Exchange #{} timed out after {}ms", generation, millis);
        slot.stale = Some(StaleExchange {
            generation,
            completion: pending.completion,
            buffer: pending.buffer,
            expires_at: Instant::now() + self.config.stale_grace,
        });
        Err(CoreError::Timeout(millis))
    }

    async fn recover_from_desync(&self) {
        self.lock_slot().stale = None;
        if let Err(e) = self.write(&CommandBuilder::soft_reset_sequence()).await {
            warn!("Soft reset after desync failed: {}", e);
        }
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        let result = {
            let mut transport = self.transport.lock().await;
            transport.write(data, self.config.transport_write_timeout).await
        };
        match result {
            Ok(()) => {
                trace!("Wrote {} bytes", data.len());
                Ok(())
            }
            Err(e) => {
                let kind = e.kind();
                if kind.is_connection_failure() {
                    self.fail(kind, e.to_string());
                }
                Err(e)
            }
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.state.borrow().is_connected() {
            Ok(())
        } else {
            Err(CoreError::NotConnected)
        }
    }

    fn fail(&self, kind: ErrorKind, message: String) {
        warn!("Connection failed ({}): {}", kind, message);
        self.abort_pending(CoreError::from_kind(kind, message.clone()));
        self.set_state(ConnectionState::Failed(kind, message));
    }

    /// Resolve the pending exchange with `error` and forget any stale one
    fn abort_pending(&self, error: CoreError) {
        let pending = {
            let mut slot = self.lock_slot();
            slot.stale = None;
            slot.pending.take()
        };
        if let Some(pending) = pending {
            debug!("Exchange #{} aborted: {}", pending.generation, error);
            let _ = pending.resolver.send(Err(error));
        }
    }

    fn set_state(&self, state: ConnectionState) {
        debug!("Connection state: {:?}", state);
        self.state.send_replace(state);
    }

    fn lock_slot(&self) -> MutexGuard<'_, ExchangeSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
