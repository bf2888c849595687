//! TCP control-surface server: accepts connections, dispatches inbound
//! envelopes against the conductor, and broadcasts `state`/`doc`/`metrics`.
//!
//! One thread per client reads framed envelopes onto a shared channel; a
//! single writer thread owns every write half and handles partial writes
//! and slow clients, so a stalled client can never block a broadcast to
//! the others.

use std::collections::{HashMap, VecDeque};
use std::io::{self, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{error, info, warn};

use groove_core::conductor::Conductor;
use groove_core::sink::Sink;
use groove_types::protocol::{HelloPayload, InboundEnvelope, OutboundEnvelope};

use crate::control_surface;
use crate::framing::{read_message, serialize_frame, write_message};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

/// Only `Broadcast` frames are dropped under backpressure; acks/errors to a
/// specific client are never dropped.
#[derive(Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Broadcast,
    Control,
}

struct QueuedFrame {
    data: Vec<u8>,
    offset: usize,
    kind: FrameKind,
}

/// Outbox depth at which a client is declared stalled and disconnected.
const MAX_OUTBOX_DEPTH: usize = 32;
const WRITE_TIMEOUT: Duration = Duration::from_millis(10);

struct ClientWriter {
    stream: TcpStream,
    outbox: VecDeque<QueuedFrame>,
}

impl ClientWriter {
    fn send_frame(&mut self, data: &[u8], kind: FrameKind) {
        match self.stream.write(data) {
            Ok(n) if n == data.len() => {}
            Ok(n) => self.queue_frame(data[n..].to_vec(), kind),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
                self.queue_frame(data.to_vec(), kind)
            }
            Err(_) => self.queue_frame(data.to_vec(), kind),
        }
    }

    fn queue_frame(&mut self, data: Vec<u8>, kind: FrameKind) {
        if kind == FrameKind::Broadcast {
            self.outbox.retain(|f| f.kind != FrameKind::Broadcast || f.offset > 0);
        }
        self.outbox.push_back(QueuedFrame { data, offset: 0, kind });
    }

    fn flush_outbox(&mut self) -> io::Result<()> {
        while let Some(front) = self.outbox.front_mut() {
            let remaining = &front.data[front.offset..];
            match self.stream.write(remaining) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
                Ok(n) => {
                    front.offset += n;
                    if front.offset >= front.data.len() {
                        self.outbox.pop_front();
                    } else {
                        return Ok(());
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn is_stalled(&self) -> bool {
        self.outbox.len() > MAX_OUTBOX_DEPTH
    }
}

enum WriterCommand {
    AddClient { id: ClientId, stream: TcpStream },
    RemoveClient { id: ClientId },
    Broadcast { frame: Vec<u8> },
    SendTo { id: ClientId, frame: Vec<u8> },
    Shutdown,
}

enum ClientEvent {
    Stalled { id: ClientId },
    Disconnected { id: ClientId },
}

fn writer_thread(cmd_rx: Receiver<WriterCommand>, feedback_tx: Sender<ClientEvent>) {
    let mut writers: HashMap<ClientId, ClientWriter> = HashMap::new();
    loop {
        match cmd_rx.recv_timeout(Duration::from_millis(5)) {
            Ok(WriterCommand::AddClient { id, stream }) => {
                writers.insert(id, ClientWriter { stream, outbox: VecDeque::new() });
            }
            Ok(WriterCommand::RemoveClient { id }) => {
                writers.remove(&id);
            }
            Ok(WriterCommand::Broadcast { frame }) => {
                let mut stalled = Vec::new();
                for (&id, writer) in &mut writers {
                    writer.send_frame(&frame, FrameKind::Broadcast);
                    if writer.is_stalled() {
                        stalled.push(id);
                    }
                }
                for id in stalled {
                    writers.remove(&id);
                    let _ = feedback_tx.send(ClientEvent::Stalled { id });
                }
            }
            Ok(WriterCommand::SendTo { id, frame }) => {
                if let Some(writer) = writers.get_mut(&id) {
                    writer.send_frame(&frame, FrameKind::Control);
                }
            }
            Ok(WriterCommand::Shutdown) => return,
            Err(mpsc::RecvTimeoutError::Disconnected) => return,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }

        let mut stalled = Vec::new();
        for (&id, writer) in &mut writers {
            if !writer.outbox.is_empty() && writer.flush_outbox().is_err() {
                stalled.push(id);
            }
        }
        for id in stalled {
            writers.remove(&id);
            let _ = feedback_tx.send(ClientEvent::Stalled { id });
        }
    }
}

fn client_reader_thread(
    id: ClientId,
    stream: TcpStream,
    inbound_tx: Sender<(ClientId, InboundEnvelope)>,
    writer_tx: Sender<WriterCommand>,
    event_tx: Sender<ClientEvent>,
) {
    let mut reader = BufReader::new(stream);
    loop {
        match read_message::<_, InboundEnvelope>(&mut reader) {
            Ok(env) => {
                if inbound_tx.send((id, env)).is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    let _ = writer_tx.send(WriterCommand::RemoveClient { id });
    let _ = event_tx.send(ClientEvent::Disconnected { id });
}

/// Accepts control-surface connections and relays inbound commands to the
/// conductor, broadcasting its state/doc/metrics snapshots back out.
pub struct Server<S: Sink + Send + 'static> {
    listener: TcpListener,
    conductor: Arc<Conductor<S>>,
    next_client_id: u64,
    clients: std::collections::HashSet<ClientId>,
    inbound_rx: Receiver<(ClientId, InboundEnvelope)>,
    inbound_tx: Sender<(ClientId, InboundEnvelope)>,
    writer_tx: Sender<WriterCommand>,
    event_tx: Sender<ClientEvent>,
    event_rx: Receiver<ClientEvent>,
    writer_handle: Option<JoinHandle<()>>,
}

impl<S: Sink + Send + 'static> Server<S> {
    pub fn bind(addr: &str, conductor: Arc<Conductor<S>>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let (inbound_tx, inbound_rx) = mpsc::channel();
        let (writer_tx, writer_rx) = mpsc::channel();
        let (event_tx, event_rx) = mpsc::channel();
        let writer_feedback_tx = event_tx.clone();
        let writer_handle = thread::spawn(move || writer_thread(writer_rx, writer_feedback_tx));
        info!("control surface listening on {addr}");
        Ok(Self {
            listener,
            conductor,
            next_client_id: 0,
            clients: std::collections::HashSet::new(),
            inbound_rx,
            inbound_tx,
            writer_tx,
            event_tx,
            event_rx,
            writer_handle: Some(writer_handle),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept any pending connections, send each a `hello`, and start its
    /// reader thread.
    pub fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nonblocking(false) {
                        error!("failed to set client stream blocking: {e}");
                        continue;
                    }
                    if let Err(e) = stream.set_write_timeout(Some(WRITE_TIMEOUT)) {
                        error!("failed to set write timeout: {e}");
                        continue;
                    }
                    let id = ClientId(self.next_client_id);
                    self.next_client_id += 1;

                    let read_stream = match stream.try_clone() {
                        Ok(s) => s,
                        Err(e) => {
                            error!("failed to clone client stream: {e}");
                            continue;
                        }
                    };

                    let hello = OutboundEnvelope::Hello {
                        ts: now_ts(),
                        payload: HelloPayload { protocol: 1, doc_version: self.conductor.doc_version() },
                    };
                    let mut stream = stream;
                    if let Err(e) = write_message(&mut stream, &hello) {
                        warn!("failed to send hello to {addr}: {e}");
                        continue;
                    }

                    let _ = self.writer_tx.send(WriterCommand::AddClient { id, stream });
                    self.clients.insert(id);

                    let tx = self.inbound_tx.clone();
                    let writer_tx = self.writer_tx.clone();
                    let event_tx = self.event_tx.clone();
                    thread::spawn(move || client_reader_thread(id, read_stream, tx, writer_tx, event_tx));
                    info!("control surface client connected from {addr}");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!("accept error: {e}");
                    break;
                }
            }
        }
    }

    /// Drain any inbound commands, dispatch them against the conductor, and
    /// reply to the originating client. Returns `true` if any command
    /// mutated the document (callers should broadcast a fresh `doc`).
    pub fn poll_commands(&mut self) -> bool {
        let mut doc_changed = false;
        while let Ok((id, envelope)) = self.inbound_rx.try_recv() {
            let replies = control_surface::handle(&self.conductor, &envelope);
            doc_changed |= replies
                .iter()
                .any(|r| matches!(r, OutboundEnvelope::Ack { payload, .. } if payload.ok));
            for reply in replies {
                self.send_to(id, &reply);
            }
        }
        self.reap_stalled();
        doc_changed
    }

    fn reap_stalled(&mut self) {
        while let Ok(event) = self.event_rx.try_recv() {
            match event {
                ClientEvent::Stalled { id } => {
                    warn!("control surface client stalled, disconnecting");
                    self.clients.remove(&id);
                }
                ClientEvent::Disconnected { id } => {
                    self.clients.remove(&id);
                }
            }
        }
    }

    fn send_to(&self, id: ClientId, msg: &OutboundEnvelope) {
        match serialize_frame(msg) {
            Ok(frame) => {
                let _ = self.writer_tx.send(WriterCommand::SendTo { id, frame });
            }
            Err(e) => error!("failed to serialize reply: {e}"),
        }
    }

    fn broadcast(&self, msg: &OutboundEnvelope) {
        match serialize_frame(msg) {
            Ok(frame) => {
                let _ = self.writer_tx.send(WriterCommand::Broadcast { frame });
            }
            Err(e) => error!("failed to serialize broadcast: {e}"),
        }
    }

    pub fn broadcast_state(&self) {
        self.broadcast(&OutboundEnvelope::State { ts: now_ts(), payload: self.conductor.state_snapshot() });
    }

    pub fn broadcast_metrics(&self, ws_clients: usize) {
        let mut payload = self.conductor.metrics_snapshot();
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("ws".to_string(), serde_json::json!({ "clients": ws_clients }));
        }
        self.broadcast(&OutboundEnvelope::Metrics { ts: now_ts(), payload });
    }

    pub fn broadcast_doc(&self) {
        if let Some(doc) = self.conductor.doc_snapshot() {
            self.broadcast(&OutboundEnvelope::Doc { ts: now_ts(), payload: doc });
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

impl<S: Sink + Send + 'static> Drop for Server<S> {
    fn drop(&mut self) {
        let _ = self.writer_tx.send(WriterCommand::Shutdown);
        if let Some(handle) = self.writer_handle.take() {
            let _ = handle.join();
        }
    }
}

fn now_ts() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}
