//! The host-side protocol client: PDU correlation, the async CAN-frame
//! queue, and the two scheduling modes described in `spec.md` §4.2/§5.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult, ProtocolKind};
use crate::pdu::{decompress_received, CanFrame, ParseOutcome, Pdu, PduType};
use crate::transport::Transport;

/// The inner poll interval cooperative waits use, and the pump thread's
/// per-iteration transport timeout. Spec caps this at 50ms.
const INNER_POLL_MS: u64 = 50;

/// How `waitResponse` learns that a reply has arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingMode {
    /// `waitResponse` itself polls the transport with a short inner
    /// timeout until the caller's deadline elapses.
    Cooperative,
    /// A background thread continuously pumps the transport and signals
    /// waiters through a condition variable.
    BackgroundPumped,
}

struct ClientState {
    receive_buffer: Vec<u8>,
    frame_queue: VecDeque<CanFrame>,
    expected_response: Option<PduType>,
    captured_response: Option<Pdu>,
    connected: bool,
}

/// Owns a [`Transport`] and correlates synchronous requests with
/// asynchronous bus events on the same byte stream.
///
/// All mutable state lives behind one mutex (`state`); the transport
/// lives behind its own so that a blocking `receive` never holds up a
/// concurrent `send_message` or a waiter inspecting `state`.
pub struct ProtocolClient<T: Transport> {
    transport: Mutex<T>,
    state: Mutex<ClientState>,
    condvar: Condvar,
    mode: Mutex<SchedulingMode>,
    pump_running: Arc<AtomicBool>,
    pump_handle: Mutex<Option<thread::JoinHandle<()>>>,
    self_weak: Weak<ProtocolClient<T>>,
}

impl<T: Transport + 'static> ProtocolClient<T> {
    pub fn new(transport: T) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            transport: Mutex::new(transport),
            state: Mutex::new(ClientState {
                receive_buffer: Vec::new(),
                frame_queue: VecDeque::new(),
                expected_response: None,
                captured_response: None,
                connected: false,
            }),
            condvar: Condvar::new(),
            mode: Mutex::new(SchedulingMode::Cooperative),
            pump_running: Arc::new(AtomicBool::new(false)),
            pump_handle: Mutex::new(None),
            self_weak: weak.clone(),
        })
    }

    pub fn connect(&self) -> CoreResult<()> {
        self.transport.lock().unwrap().connect()?;
        self.state.lock().unwrap().connected = true;
        Ok(())
    }

    /// Stops the background pump (if running) and disconnects the
    /// transport. Idempotent.
    pub fn disconnect(&self) {
        self.stop_background_pump();
        let _ = self.transport.lock().unwrap().disconnect();
        self.mark_disconnected();
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    /// Switches scheduling modes. Fails with [`CoreError::State`] if a
    /// request is currently in flight.
    pub fn set_scheduling_mode(&self, mode: SchedulingMode) -> CoreResult<()> {
        {
            let state = self.state.lock().unwrap();
            if state.expected_response.is_some() {
                return Err(CoreError::State(
                    "cannot change scheduling mode while a request is in flight",
                ));
            }
        }
        let previous = {
            let mut current = self.mode.lock().unwrap();
            let previous = *current;
            *current = mode;
            previous
        };
        match (previous, mode) {
            (SchedulingMode::Cooperative, SchedulingMode::BackgroundPumped) => {
                self.start_background_pump()?;
            }
            (SchedulingMode::BackgroundPumped, SchedulingMode::Cooperative) => {
                self.stop_background_pump();
            }
            _ => {}
        }
        Ok(())
    }

    /// Fire-and-forget send: does not wait for an `Ok` reply.
    pub fn send_message(&self, pdu: &Pdu) -> CoreResult<()> {
        if !self.is_connected() {
            return Err(CoreError::NotConnected);
        }
        let bytes = pdu.serialize();
        let result = self.transport.lock().unwrap().send(&bytes);
        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                self.mark_disconnected();
                Err(e)
            }
        }
    }

    /// Fire-and-forget send of several PDUs in order.
    pub fn send_messages(&self, pdus: &[Pdu]) -> CoreResult<()> {
        for pdu in pdus {
            self.send_message(pdu)?;
        }
        Ok(())
    }

    /// Sends `pdu` and waits up to `deadline_ms` for the next PDU of type
    /// `expected` or an error PDU (`0xE0..=0xEF`).
    pub fn request(&self, pdu: &Pdu, expected: PduType, deadline_ms: u64) -> CoreResult<Pdu> {
        if !self.is_connected() {
            return Err(CoreError::NotConnected);
        }
        {
            let mut state = self.state.lock().unwrap();
            if state.expected_response.is_some() {
                return Err(CoreError::State("a request is already in flight"));
            }
            state.expected_response = Some(expected);
            state.captured_response = None;
        }
        if let Err(e) = self.send_message(pdu) {
            self.state.lock().unwrap().expected_response = None;
            return Err(e);
        }
        self.wait_response(deadline_ms)
    }

    fn wait_response(&self, deadline_ms: u64) -> CoreResult<Pdu> {
        let deadline = Instant::now() + Duration::from_millis(deadline_ms);
        let mode = *self.mode.lock().unwrap();
        match mode {
            SchedulingMode::Cooperative => self.wait_response_cooperative(deadline),
            SchedulingMode::BackgroundPumped => self.wait_response_pumped(deadline),
        }
    }

    fn wait_response_cooperative(&self, deadline: Instant) -> CoreResult<Pdu> {
        loop {
            if let Some(pdu) = self.take_captured_response() {
                return Self::resolve(pdu);
            }
            let now = Instant::now();
            if now >= deadline {
                self.clear_expected_response();
                return Err(CoreError::Timeout);
            }
            let inner = (deadline - now).min(Duration::from_millis(INNER_POLL_MS));
            self.process_received_data(inner.as_millis() as u64)?;
        }
    }

    fn wait_response_pumped(&self, deadline: Instant) -> CoreResult<Pdu> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(pdu) = state.captured_response.take() {
                return Self::resolve(pdu);
            }
            if !state.connected {
                state.expected_response = None;
                return Err(CoreError::NotConnected);
            }
            let now = Instant::now();
            if now >= deadline {
                state.expected_response = None;
                return Err(CoreError::Timeout);
            }
            let (guard, _timeout) = self.condvar.wait_timeout(state, deadline - now).unwrap();
            state = guard;
        }
    }

    fn take_captured_response(&self) -> Option<Pdu> {
        self.state.lock().unwrap().captured_response.take()
    }

    fn clear_expected_response(&self) {
        self.state.lock().unwrap().expected_response = None;
    }

    fn resolve(pdu: Pdu) -> CoreResult<Pdu> {
        if pdu.is_error() {
            let code = match pdu {
                Pdu::Error(code) => code,
                _ => unreachable!("is_error() only true for Pdu::Error"),
            };
            let kind = ProtocolKind::from_code(code).unwrap_or(ProtocolKind::Unspecified);
            Err(CoreError::Protocol(kind))
        } else {
            Ok(pdu)
        }
    }

    /// Drains the FIFO queue of `Received`/`ReceivedCompressed` frames
    /// that arrived outside any outstanding request.
    pub fn receive_messages(&self) -> Vec<CanFrame> {
        self.state.lock().unwrap().frame_queue.drain(..).collect()
    }

    /// Pumps one round: a bounded transport read, parses as many PDUs as
    /// the buffer holds, and dispatches each to the frame queue or the
    /// in-flight request.
    fn process_received_data(&self, timeout_ms: u64) -> CoreResult<()> {
        let received = {
            let mut transport = self.transport.lock().unwrap();
            transport.receive(timeout_ms)
        };
        let bytes = match received {
            Ok(bytes) => bytes,
            Err(e) => {
                self.mark_disconnected();
                return Err(e);
            }
        };
        if bytes.is_empty() {
            return Ok(());
        }

        let mut state = self.state.lock().unwrap();
        state.receive_buffer.extend_from_slice(&bytes);
        loop {
            match Pdu::parse(&state.receive_buffer) {
                ParseOutcome::NeedMore => break,
                ParseOutcome::Resync(skip) => {
                    state.receive_buffer.drain(0..skip);
                }
                ParseOutcome::Ok(pdu, consumed) => {
                    state.receive_buffer.drain(0..consumed);
                    self.dispatch(&mut state, pdu);
                }
            }
        }
        drop(state);
        self.condvar.notify_all();
        Ok(())
    }

    fn dispatch(&self, state: &mut ClientState, pdu: Pdu) {
        if matches!(pdu, Pdu::Received(_) | Pdu::ReceivedCompressed { .. }) {
            if let Some(frame) = Self::to_can_frame(pdu) {
                state.frame_queue.push_back(frame);
            }
            return;
        }

        if let Some(expected) = state.expected_response {
            if Self::matches_expected(expected, pdu.pdu_type()) || pdu.is_error() {
                state.captured_response = Some(pdu);
                state.expected_response = None;
                return;
            }
        }

        debug!(?pdu, "dropped PDU with no matching in-flight request");
    }

    /// Whether `actual` satisfies a request expecting `expected`.
    ///
    /// Older firmware acknowledges `EndPeriodic` with a bare `Ok` instead
    /// of `PeriodicEnded`; a caller expecting `PeriodicEnded` accepts
    /// either, per the adapter's documented forward-compatibility note.
    fn matches_expected(expected: PduType, actual: PduType) -> bool {
        actual == expected || (expected == PduType::PeriodicEnded && actual == PduType::Ok)
    }

    fn to_can_frame(pdu: Pdu) -> Option<CanFrame> {
        match pdu {
            Pdu::Received(frame) => Some(CanFrame {
                channel: frame.channel,
                id: frame.id,
                extension: frame.extension,
                data: frame.data,
                timestamp: Utc::now(),
            }),
            Pdu::ReceivedCompressed {
                channel,
                id,
                extension,
                uncompressed_len,
                compressed,
            } => match decompress_received(uncompressed_len, &compressed) {
                Ok(data) => Some(CanFrame {
                    channel,
                    id,
                    extension,
                    data,
                    timestamp: Utc::now(),
                }),
                Err(e) => {
                    warn!(error = %e, "dropping ReceivedCompressed with an undecodable LZ4 payload");
                    None
                }
            },
            _ => None,
        }
    }

    fn start_background_pump(&self) -> CoreResult<()> {
        if self.pump_running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let client = self
            .self_weak
            .upgrade()
            .ok_or(CoreError::State("client has already been dropped"))?;
        let handle = thread::spawn(move || {
            while client.pump_running.load(Ordering::SeqCst) {
                if client.process_received_data(INNER_POLL_MS).is_err() {
                    break;
                }
            }
        });
        *self.pump_handle.lock().unwrap() = Some(handle);
        Ok(())
    }

    fn stop_background_pump(&self) {
        self.pump_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.pump_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn mark_disconnected(&self) {
        let mut state = self.state.lock().unwrap();
        state.connected = false;
        state.expected_response = None;
        state.captured_response = None;
        drop(state);
        self.condvar.notify_all();
    }
}

impl<T: Transport + 'static> Drop for ProtocolClient<T> {
    fn drop(&mut self) {
        self.stop_background_pump();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::{self, Receiver, Sender};

    /// An in-memory transport pair for exercising the client without a
    /// real socket: writes to `outbox`, reads whatever `inbox` has queued.
    struct ChannelTransport {
        inbox: Receiver<Vec<u8>>,
        outbox: Sender<Vec<u8>>,
        connected: bool,
        pending: Vec<u8>,
    }

    impl Transport for ChannelTransport {
        fn connect(&mut self) -> CoreResult<()> {
            self.connected = true;
            Ok(())
        }

        fn disconnect(&mut self) -> CoreResult<()> {
            self.connected = false;
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn send(&mut self, bytes: &[u8]) -> CoreResult<usize> {
            self.outbox
                .send(bytes.to_vec())
                .map_err(|_| CoreError::Transport("peer gone".into()))?;
            Ok(bytes.len())
        }

        fn receive(&mut self, deadline_ms: u64) -> CoreResult<Vec<u8>> {
            if !self.pending.is_empty() {
                return Ok(std::mem::take(&mut self.pending));
            }
            match self.inbox.recv_timeout(Duration::from_millis(deadline_ms)) {
                Ok(bytes) => Ok(bytes),
                Err(mpsc::RecvTimeoutError::Timeout) => Ok(Vec::new()),
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    Err(CoreError::Transport("peer disconnected".into()))
                }
            }
        }

        fn last_error(&self) -> Option<String> {
            None
        }
    }

    fn harness() -> (Arc<ProtocolClient<ChannelTransport>>, Sender<Vec<u8>>, Receiver<Vec<u8>>) {
        let (tx_to_client, rx_in_client) = mpsc::channel();
        let (tx_from_client, rx_from_client) = mpsc::channel();
        let transport = ChannelTransport {
            inbox: rx_in_client,
            outbox: tx_from_client,
            connected: false,
            pending: Vec::new(),
        };
        let client = ProtocolClient::new(transport);
        client.connect().unwrap();
        (client, tx_to_client, rx_from_client)
    }

    #[test]
    fn request_matches_expected_type() {
        let (client, tx_to_client, _rx) = harness();
        let reply_bytes = Pdu::Ok.serialize();
        tx_to_client.send(reply_bytes).unwrap();
        let reply = client
            .request(&Pdu::reset(), PduType::Ok, 1000)
            .unwrap();
        assert_eq!(reply, Pdu::Ok);
    }

    #[test]
    fn request_surfaces_error_pdu() {
        let (client, tx_to_client, _rx) = harness();
        tx_to_client.send(Pdu::Error(0xE2).serialize()).unwrap();
        let err = client
            .request(&Pdu::close_channel(1), PduType::ChannelClosed, 1000)
            .unwrap_err();
        assert_eq!(err, CoreError::Protocol(ProtocolKind::InvalidChannel));
    }

    #[test]
    fn request_times_out_with_no_reply() {
        let (client, _tx, _rx) = harness();
        let err = client
            .request(&Pdu::reset(), PduType::Ok, 60)
            .unwrap_err();
        assert_eq!(err, CoreError::Timeout);
    }

    #[test]
    fn received_frames_route_to_async_queue_during_request() {
        let (client, tx_to_client, _rx) = harness();
        tx_to_client
            .send(
                Pdu::Received(crate::pdu::ReceivedFrame {
                    channel: 0,
                    id: 0x7E8,
                    extension: 0,
                    data: vec![1, 2, 3],
                })
                .serialize(),
            )
            .unwrap();
        tx_to_client.send(Pdu::Ok.serialize()).unwrap();

        let reply = client.request(&Pdu::reset(), PduType::Ok, 1000).unwrap();
        assert_eq!(reply, Pdu::Ok);

        let frames = client.receive_messages();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id, 0x7E8);
        assert_eq!(frames[0].data, vec![1, 2, 3]);
    }

    #[test]
    fn background_pumped_mode_delivers_reply() {
        let (client, tx_to_client, _rx) = harness();
        client
            .set_scheduling_mode(SchedulingMode::BackgroundPumped)
            .unwrap();
        tx_to_client.send(Pdu::Ok.serialize()).unwrap();
        let reply = client.request(&Pdu::reset(), PduType::Ok, 1000).unwrap();
        assert_eq!(reply, Pdu::Ok);
        client
            .set_scheduling_mode(SchedulingMode::Cooperative)
            .unwrap();
    }

    #[test]
    fn end_periodic_accepts_bare_ok_from_older_firmware() {
        let (client, tx_to_client, _rx) = harness();
        // Older firmware acks EndPeriodic with a bare Ok instead of
        // PeriodicEnded; the request must still succeed, not time out.
        tx_to_client.send(Pdu::Ok.serialize()).unwrap();
        let reply = client
            .request(&Pdu::end_periodic(7), PduType::PeriodicEnded, 1000)
            .unwrap();
        assert_eq!(reply, Pdu::Ok);
    }

    #[test]
    fn send_message_does_not_block_on_reply() {
        let (client, _tx, rx_from_client) = harness();
        client.send_message(&Pdu::ping(vec![9])).unwrap();
        let sent = rx_from_client.recv_timeout(Duration::from_millis(500)).unwrap();
        assert_eq!(sent, Pdu::ping(vec![9]).serialize());
    }
}
