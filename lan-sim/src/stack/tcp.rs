//! TCP connections
//!
//! Every connection is a task owning its state machine, send buffer and retransmission timer.
//! Applications talk to it through channels ([`TcpStream`]). Retransmission is go-back-N: on
//! timeout every unacknowledged segment is sent again, and receivers only accept the next
//! in-order segment.

use crate::network::frame::{IpPayload, Ipv4Datagram, TcpFlags, TcpSegment};
use crate::stack::ProtocolStack;
use crate::stack::ip::IpError;
use crate::tracing::simulation_step::DatagramDropReason;
use futures::{FutureExt, select_biased};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

const EPHEMERAL_PORTS: std::ops::RangeInclusive<u16> = 49152..=65535;

#[derive(Clone, Debug)]
pub struct TcpConfig {
    /// Maximum segment size
    pub mss: usize,
    /// Maximum number of unacknowledged segments in flight
    pub window_segments: usize,
    /// Initial retransmission timeout, doubled after every retransmission
    pub retransmission_timeout: Duration,
    /// The connection fails after this many retransmissions without progress
    pub max_retransmissions: u32,
    pub time_wait: Duration,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            mss: 536,
            window_segments: 4,
            retransmission_timeout: Duration::from_secs(1),
            max_retransmissions: 5,
            time_wait: Duration::from_secs(2),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
    CloseWait,
    LastAck,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TcpError {
    #[error("connection failed: the peer stopped acknowledging")]
    ConnectionFailed,
    #[error("connection reset by peer")]
    ConnectionReset,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("connection closed")]
    Closed,
    #[error("address {0} is already in use")]
    AddressInUse(SocketAddrV4),
    #[error("the node is not running")]
    Stopped,
    #[error(transparent)]
    Unreachable(#[from] IpError),
}

#[derive(Clone, Debug)]
struct ConnectionStatus {
    state: TcpState,
    error: Option<TcpError>,
}

enum Command {
    Write(Vec<u8>),
    Close,
}

type ConnectionKey = (SocketAddrV4, SocketAddrV4);

pub(crate) struct TcpTables {
    connections: Mutex<HashMap<ConnectionKey, mpsc::UnboundedSender<TcpSegment>>>,
    listeners: Mutex<HashMap<SocketAddrV4, mpsc::UnboundedSender<TcpStream>>>,
    next_port: Mutex<u16>,
}

impl TcpTables {
    pub(crate) fn new() -> Self {
        Self {
            connections: Mutex::default(),
            listeners: Mutex::default(),
            next_port: Mutex::new(*EPHEMERAL_PORTS.start()),
        }
    }

    fn port_in_use(&self, port: u16) -> bool {
        self.listeners.lock().keys().any(|local| local.port() == port)
            || self
                .connections
                .lock()
                .keys()
                .any(|(local, _)| local.port() == port)
    }

    fn allocate_port(&self) -> Option<u16> {
        let mut next_port = self.next_port.lock();
        for _ in EPHEMERAL_PORTS {
            let port = *next_port;
            *next_port = if port == *EPHEMERAL_PORTS.end() {
                *EPHEMERAL_PORTS.start()
            } else {
                port + 1
            };

            if !self.port_in_use(port) {
                return Some(port);
            }
        }

        None
    }

    fn listener_for(&self, local: SocketAddrV4) -> Option<mpsc::UnboundedSender<TcpStream>> {
        let listeners = self.listeners.lock();
        listeners
            .get(&local)
            .or_else(|| listeners.get(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, local.port())))
            .cloned()
    }

    pub(crate) fn clear(&self) {
        self.connections.lock().clear();
        self.listeners.lock().clear();
    }
}

/// Accepts incoming connections on a local address
pub struct TcpListener {
    local: SocketAddrV4,
    stack: Arc<ProtocolStack>,
    incoming: mpsc::UnboundedReceiver<TcpStream>,
}

impl TcpListener {
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local
    }

    /// Waits for the next connection to complete its handshake
    pub async fn accept(&mut self) -> Result<TcpStream, TcpError> {
        self.incoming.recv().await.ok_or(TcpError::Stopped)
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        self.stack.tcp.listeners.lock().remove(&self.local);
    }
}

/// The application side of a connection
///
/// Dropping the stream closes the connection gracefully.
pub struct TcpStream {
    local: SocketAddrV4,
    remote: SocketAddrV4,
    commands: mpsc::UnboundedSender<Command>,
    incoming: mpsc::UnboundedReceiver<Vec<u8>>,
    status: watch::Receiver<ConnectionStatus>,
    buffered: Vec<u8>,
    closing: bool,
}

impl TcpStream {
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local
    }

    pub fn peer_addr(&self) -> SocketAddrV4 {
        self.remote
    }

    pub fn state(&self) -> TcpState {
        self.status.borrow().state
    }

    /// Queues data for sending
    pub fn write(&mut self, data: impl Into<Vec<u8>>) -> Result<(), TcpError> {
        {
            let status = self.status.borrow();
            if let Some(error) = &status.error {
                return Err(error.clone());
            }
            if self.closing || !matches!(status.state, TcpState::Established | TcpState::CloseWait)
            {
                return Err(TcpError::Closed);
            }
        }

        self.commands
            .send(Command::Write(data.into()))
            .map_err(|_| TcpError::Closed)
    }

    /// Returns the next chunk of received data, or `None` once the peer closed its side
    pub async fn read(&mut self) -> Result<Option<Vec<u8>>, TcpError> {
        if !self.buffered.is_empty() {
            return Ok(Some(std::mem::take(&mut self.buffered)));
        }

        match self.incoming.recv().await {
            Some(data) => Ok(Some(data)),
            None => match self.status.borrow().error.clone() {
                Some(error) => Err(error),
                None => Ok(None),
            },
        }
    }

    pub async fn read_exact(&mut self, len: usize) -> Result<Vec<u8>, TcpError> {
        while self.buffered.len() < len {
            match self.incoming.recv().await {
                Some(data) => self.buffered.extend(data),
                None => {
                    return Err(self.status.borrow().error.clone().unwrap_or(TcpError::Closed));
                }
            }
        }

        let rest = self.buffered.split_off(len);
        Ok(std::mem::replace(&mut self.buffered, rest))
    }

    /// Reads until the peer closes its side of the connection
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, TcpError> {
        let mut data = std::mem::take(&mut self.buffered);
        while let Some(chunk) = self.read().await? {
            data.extend(chunk);
        }

        Ok(data)
    }

    /// Sends a FIN once all queued data has been acknowledged
    pub fn close(&mut self) {
        self.closing = true;
        self.commands.send(Command::Close).ok();
    }

    /// Waits until the connection is fully closed, returning the error that ended it, if any
    pub async fn closed(&mut self) -> Result<(), TcpError> {
        let finished = self
            .status
            .wait_for(|s| matches!(s.state, TcpState::Closed | TcpState::TimeWait))
            .await
            .map(|status| status.error.clone());
        let error = match finished {
            Ok(error) => error,
            Err(_) => self.status.borrow().error.clone(),
        };

        match error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn wait_connected(&mut self) -> Result<(), TcpError> {
        let outcome = self
            .status
            .wait_for(|s| s.state != TcpState::SynSent)
            .await
            .map(|status| status.error.clone());
        match outcome {
            Ok(None) => Ok(()),
            Ok(Some(error)) => Err(error),
            Err(_) => Err(TcpError::Stopped),
        }
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        self.commands.send(Command::Close).ok();
    }
}

impl ProtocolStack {
    pub fn tcp_listen(self: &Arc<Self>, local: SocketAddrV4) -> Result<TcpListener, TcpError> {
        let (tx, incoming) = mpsc::unbounded_channel();
        {
            let mut listeners = self.tcp.listeners.lock();
            if listeners.contains_key(&local) {
                return Err(TcpError::AddressInUse(local));
            }
            listeners.insert(local, tx);
        }

        Ok(TcpListener {
            local,
            stack: self.clone(),
            incoming,
        })
    }

    /// Opens a connection, returning once the handshake completes
    pub async fn tcp_connect(self: &Arc<Self>, remote: SocketAddrV4) -> Result<TcpStream, TcpError> {
        let local_ip = self.source_address_for(*remote.ip())?;
        let port = self
            .tcp
            .allocate_port()
            .ok_or(TcpError::AddressInUse(SocketAddrV4::new(local_ip, 0)))?;
        let local = SocketAddrV4::new(local_ip, port);

        let (mut connection, mut stream, commands) =
            Connection::new(self.clone(), local, remote, TcpState::Closed);
        let segments = self.register_connection(local, remote);
        connection.set_state(TcpState::SynSent);
        connection.transmit_new(TcpFlags::SYN, Vec::new());
        self.spawn("tcp connection", connection.run(segments, commands));

        stream.wait_connected().await?;
        Ok(stream)
    }

    fn register_connection(
        &self,
        local: SocketAddrV4,
        remote: SocketAddrV4,
    ) -> mpsc::UnboundedReceiver<TcpSegment> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.tcp.connections.lock().insert((local, remote), tx);
        rx
    }

    fn send_segment(self: &Arc<Self>, local: SocketAddrV4, remote: SocketAddrV4, segment: TcpSegment) {
        let datagram = self.datagram(
            *local.ip(),
            *remote.ip(),
            Ipv4Datagram::DEFAULT_TTL,
            IpPayload::Tcp(segment),
        );
        self.route_datagram(datagram, false);
    }

    pub(crate) fn handle_tcp(self: &Arc<Self>, datagram: &Ipv4Datagram, segment: &TcpSegment) {
        if datagram.destination.is_broadcast() {
            return;
        }

        let local = SocketAddrV4::new(datagram.destination, segment.destination_port);
        let remote = SocketAddrV4::new(datagram.source, segment.source_port);

        let connection = self.tcp.connections.lock().get(&(local, remote)).cloned();
        if let Some(connection) = connection {
            if connection.send(segment.clone()).is_ok() {
                return;
            }
        }

        let is_syn = segment.flags.contains(TcpFlags::SYN) && !segment.flags.contains(TcpFlags::ACK);
        if is_syn {
            if let Some(listener) = self.tcp.listener_for(local) {
                self.accept_connection(local, remote, segment, listener);
                return;
            }
        }

        self.context.tracer.track_datagram_dropped(
            &self.node_id,
            datagram,
            DatagramDropReason::PortUnreachable,
        );
        if !segment.flags.contains(TcpFlags::RST) {
            self.send_reset(local, remote, segment);
        }
    }

    fn accept_connection(
        self: &Arc<Self>,
        local: SocketAddrV4,
        remote: SocketAddrV4,
        syn: &TcpSegment,
        listener: mpsc::UnboundedSender<TcpStream>,
    ) {
        let (mut connection, stream, commands) =
            Connection::new(self.clone(), local, remote, TcpState::Listen);
        connection.rcv_nxt = syn.sequence.wrapping_add(1);
        connection.accept = Some((listener, stream));

        let segments = self.register_connection(local, remote);
        connection.set_state(TcpState::SynReceived);
        connection.transmit_new(TcpFlags::SYN | TcpFlags::ACK, Vec::new());
        self.spawn("tcp connection", connection.run(segments, commands));
    }

    fn send_reset(self: &Arc<Self>, local: SocketAddrV4, remote: SocketAddrV4, segment: &TcpSegment) {
        let (sequence, acknowledgment, flags) = if segment.flags.contains(TcpFlags::ACK) {
            (segment.acknowledgment, 0, TcpFlags::RST)
        } else {
            let ack = segment.sequence.wrapping_add(segment.sequence_len());
            (0, ack, TcpFlags::RST | TcpFlags::ACK)
        };

        let reset = TcpSegment {
            source_port: local.port(),
            destination_port: remote.port(),
            sequence,
            acknowledgment,
            flags,
            window: 0,
            data: Vec::new(),
        };
        self.send_segment(local, remote, reset);
    }
}

fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

enum Event {
    Cancelled,
    Segment(Option<TcpSegment>),
    Command(Option<Command>),
    Timeout,
}

struct Connection {
    stack: Arc<ProtocolStack>,
    local: SocketAddrV4,
    remote: SocketAddrV4,
    state: TcpState,
    status: watch::Sender<ConnectionStatus>,
    /// Received data for the application; dropped once the peer's FIN arrives
    received: Option<mpsc::UnboundedSender<Vec<u8>>>,
    /// A passively opened stream, handed to the listener once established
    accept: Option<(mpsc::UnboundedSender<TcpStream>, TcpStream)>,

    snd_una: u32,
    snd_nxt: u32,
    rcv_nxt: u32,
    unacked: VecDeque<TcpSegment>,
    outgoing: VecDeque<u8>,
    close_requested: bool,
    fin_sent: bool,

    rto: Duration,
    retransmissions: u32,
    retransmit_at: Option<Instant>,
    time_wait_until: Option<Instant>,
}

impl Connection {
    fn new(
        stack: Arc<ProtocolStack>,
        local: SocketAddrV4,
        remote: SocketAddrV4,
        state: TcpState,
    ) -> (Self, TcpStream, mpsc::UnboundedReceiver<Command>) {
        let (status, status_rx) = watch::channel(ConnectionStatus { state, error: None });
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (received, incoming) = mpsc::unbounded_channel();
        let iss = stack.context.random_u32();
        let rto = stack.config.tcp.retransmission_timeout;

        let stream = TcpStream {
            local,
            remote,
            commands: commands_tx,
            incoming,
            status: status_rx,
            buffered: Vec::new(),
            closing: false,
        };

        let connection = Self {
            stack,
            local,
            remote,
            state,
            status,
            received: Some(received),
            accept: None,
            snd_una: iss,
            snd_nxt: iss,
            rcv_nxt: 0,
            unacked: VecDeque::new(),
            outgoing: VecDeque::new(),
            close_requested: false,
            fin_sent: false,
            rto,
            retransmissions: 0,
            retransmit_at: None,
            time_wait_until: None,
        };

        (connection, stream, commands)
    }

    async fn run(
        mut self,
        mut segments: mpsc::UnboundedReceiver<TcpSegment>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) {
        let token = self.stack.token().clone();
        let mut commands = Some(commands);
        while self.state != TcpState::Closed {
            let deadline = [self.retransmit_at, self.time_wait_until]
                .into_iter()
                .flatten()
                .min();
            let event = {
                let timer = async move {
                    match deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                };
                let command = async {
                    match commands.as_mut() {
                        Some(commands) => commands.recv().await,
                        None => std::future::pending().await,
                    }
                };

                select_biased! {
                    _ = token.cancelled().fuse() => Event::Cancelled,
                    segment = segments.recv().fuse() => Event::Segment(segment),
                    command = command.fuse() => Event::Command(command),
                    _ = timer.fuse() => Event::Timeout,
                }
            };

            match event {
                Event::Cancelled | Event::Segment(None) => self.fail(TcpError::Stopped),
                Event::Segment(Some(segment)) => self.on_segment(segment),
                Event::Command(Some(Command::Write(data))) => {
                    if !self.close_requested {
                        self.outgoing.extend(data);
                    }
                }
                Event::Command(Some(Command::Close)) => self.on_close(),
                Event::Command(None) => {
                    commands = None;
                    self.on_close();
                }
                Event::Timeout => self.on_timeout(),
            }

            self.pump();
        }

        self.stack
            .tcp
            .connections
            .lock()
            .remove(&(self.local, self.remote));
    }

    fn set_state(&mut self, to: TcpState) {
        if self.state == to {
            return;
        }

        let from = std::mem::replace(&mut self.state, to);
        self.stack.context.tracer.track_tcp_state_change(
            &self.stack.node_id,
            self.local,
            self.remote,
            from,
            to,
        );
        self.status.send_modify(|status| status.state = to);

        match to {
            TcpState::Established => {
                if let Some((listener, stream)) = self.accept.take() {
                    // A dropped listener drops (and thereby closes) the stream
                    listener.send(stream).ok();
                }
            }
            TcpState::TimeWait => {
                self.retransmit_at = None;
                let time_wait = self.stack.context.scaled(self.stack.config.tcp.time_wait);
                self.time_wait_until = Some(Instant::now() + time_wait);
            }
            _ => {}
        }
    }

    fn fail(&mut self, error: TcpError) {
        if error == TcpError::ConnectionFailed {
            self.stack.context.tracer.track_tcp_connection_failed(
                &self.stack.node_id,
                self.local,
                self.remote,
                &error,
            );
        }

        // The error must be visible before the state change and the end of the data stream
        self.status.send_modify(|status| status.error = Some(error));
        self.received = None;
        self.retransmit_at = None;
        self.time_wait_until = None;
        self.set_state(TcpState::Closed);
    }

    fn window(&self) -> u16 {
        let tcp = &self.stack.config.tcp;
        (tcp.window_segments * tcp.mss).min(u16::MAX as usize) as u16
    }

    fn segment(&self, flags: TcpFlags, sequence: u32, data: Vec<u8>) -> TcpSegment {
        TcpSegment {
            source_port: self.local.port(),
            destination_port: self.remote.port(),
            sequence,
            acknowledgment: if flags.contains(TcpFlags::ACK) {
                self.rcv_nxt
            } else {
                0
            },
            flags,
            window: self.window(),
            data,
        }
    }

    fn send(&self, segment: TcpSegment) {
        self.stack.send_segment(self.local, self.remote, segment);
    }

    fn send_ack(&self) {
        self.send(self.segment(TcpFlags::ACK, self.snd_nxt, Vec::new()));
    }

    /// Sends a segment that occupies sequence space, keeping it around for retransmission
    fn transmit_new(&mut self, flags: TcpFlags, data: Vec<u8>) {
        let segment = self.segment(flags, self.snd_nxt, data);
        self.snd_nxt = self.snd_nxt.wrapping_add(segment.sequence_len());
        self.unacked.push_back(segment.clone());
        self.send(segment);

        if self.retransmit_at.is_none() {
            self.arm_retransmission_timer();
        }
    }

    fn arm_retransmission_timer(&mut self) {
        self.retransmit_at = Some(Instant::now() + self.stack.context.scaled(self.rto));
    }

    fn on_close(&mut self) {
        match self.state {
            TcpState::Closed | TcpState::Listen | TcpState::SynSent => {
                self.received = None;
                self.set_state(TcpState::Closed);
            }
            TcpState::SynReceived | TcpState::Established | TcpState::CloseWait => {
                self.close_requested = true;
            }
            _ => {}
        }
    }

    fn on_timeout(&mut self) {
        let now = Instant::now();
        if self.time_wait_until.is_some_and(|t| now >= t) {
            self.time_wait_until = None;
            self.set_state(TcpState::Closed);
            return;
        }

        if !self.retransmit_at.is_some_and(|t| now >= t) {
            return;
        }

        if self.unacked.is_empty() {
            self.retransmit_at = None;
            return;
        }

        self.retransmissions += 1;
        if self.retransmissions > self.stack.config.tcp.max_retransmissions {
            self.send(self.segment(TcpFlags::RST | TcpFlags::ACK, self.snd_nxt, Vec::new()));
            self.fail(TcpError::ConnectionFailed);
            return;
        }

        // Go-back-N, with up to date acknowledgments
        for segment in &self.unacked {
            let mut segment = segment.clone();
            if segment.flags.contains(TcpFlags::ACK) {
                segment.acknowledgment = self.rcv_nxt;
            }
            self.send(segment);
        }

        self.rto *= 2;
        self.arm_retransmission_timer();
    }

    fn on_segment(&mut self, segment: TcpSegment) {
        if segment.flags.contains(TcpFlags::RST) {
            match self.state {
                TcpState::SynSent => {
                    if segment.flags.contains(TcpFlags::ACK)
                        && segment.acknowledgment == self.snd_nxt
                    {
                        self.fail(TcpError::ConnectionRefused);
                    }
                }
                _ => self.fail(TcpError::ConnectionReset),
            }
            return;
        }

        match self.state {
            TcpState::SynSent => {
                let is_syn_ack = segment.flags.contains(TcpFlags::SYN | TcpFlags::ACK);
                if is_syn_ack && segment.acknowledgment == self.snd_nxt {
                    self.rcv_nxt = segment.sequence.wrapping_add(1);
                    self.acknowledge(segment.acknowledgment);
                    self.send_ack();
                    self.set_state(TcpState::Established);
                }
                return;
            }
            TcpState::SynReceived => {
                if segment.flags.contains(TcpFlags::SYN) {
                    // The peer did not get our SYN|ACK yet
                    if let Some(syn_ack) = self.unacked.front() {
                        self.send(syn_ack.clone());
                    }
                    return;
                }

                if !segment.flags.contains(TcpFlags::ACK) || segment.acknowledgment != self.snd_nxt
                {
                    return;
                }

                self.acknowledge(segment.acknowledgment);
                self.set_state(TcpState::Established);
            }
            _ => {
                if segment.flags.contains(TcpFlags::ACK) {
                    self.acknowledge(segment.acknowledgment);
                }
            }
        }

        if self.state != TcpState::Closed {
            self.receive(segment);
        }
    }

    fn acknowledge(&mut self, ack: u32) {
        if !(seq_lt(self.snd_una, ack) && seq_le(ack, self.snd_nxt)) {
            return;
        }

        self.snd_una = ack;
        while let Some(front) = self.unacked.front() {
            let end = front.sequence.wrapping_add(front.sequence_len());
            if seq_le(end, ack) {
                self.unacked.pop_front();
            } else {
                break;
            }
        }

        // Progress resets the backoff
        self.retransmissions = 0;
        self.rto = self.stack.config.tcp.retransmission_timeout;
        if self.unacked.is_empty() {
            self.retransmit_at = None;
        } else {
            self.arm_retransmission_timer();
        }

        if self.fin_sent && ack == self.snd_nxt {
            match self.state {
                TcpState::FinWait1 => self.set_state(TcpState::FinWait2),
                TcpState::Closing => self.set_state(TcpState::TimeWait),
                TcpState::LastAck => self.set_state(TcpState::Closed),
                _ => {}
            }
        }
    }

    fn receive(&mut self, segment: TcpSegment) {
        if segment.sequence_len() == 0 {
            return;
        }

        let accepts_data = matches!(
            self.state,
            TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2
        );
        if segment.sequence != self.rcv_nxt
            || !accepts_data
            || segment.flags.contains(TcpFlags::SYN)
        {
            // Duplicate or out of order: discard, and tell the peer what we expect
            self.send_ack();
            return;
        }

        if !segment.data.is_empty() {
            self.rcv_nxt = self.rcv_nxt.wrapping_add(segment.data.len() as u32);
            if let Some(received) = &self.received {
                received.send(segment.data).ok();
            }
        }

        if segment.flags.contains(TcpFlags::FIN) {
            self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            self.received = None;
            self.send_ack();

            let fin_acked = self.fin_sent && self.snd_una == self.snd_nxt;
            match self.state {
                TcpState::Established => self.set_state(TcpState::CloseWait),
                TcpState::FinWait1 if fin_acked => self.set_state(TcpState::TimeWait),
                TcpState::FinWait1 => self.set_state(TcpState::Closing),
                TcpState::FinWait2 => self.set_state(TcpState::TimeWait),
                _ => {}
            }
        } else {
            self.send_ack();
        }
    }

    /// Segments queued data into the window, then sends the FIN once everything went out
    fn pump(&mut self) {
        if !matches!(self.state, TcpState::Established | TcpState::CloseWait) {
            return;
        }

        let tcp = &self.stack.config.tcp;
        let (mss, window) = (tcp.mss, tcp.window_segments);
        while self.unacked.len() < window && !self.outgoing.is_empty() {
            let len = mss.min(self.outgoing.len());
            let data: Vec<u8> = self.outgoing.drain(..len).collect();
            self.transmit_new(TcpFlags::ACK | TcpFlags::PSH, data);
        }

        if self.close_requested
            && !self.fin_sent
            && self.outgoing.is_empty()
            && self.unacked.len() < window
        {
            self.transmit_new(TcpFlags::FIN | TcpFlags::ACK, Vec::new());
            self.fin_sent = true;
            let next = if self.state == TcpState::Established {
                TcpState::FinWait1
            } else {
                TcpState::LastAck
            };
            self.set_state(next);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_sequence_comparison_wraps() {
        assert!(seq_lt(1, 2));
        assert!(!seq_lt(2, 2));
        assert!(seq_le(2, 2));
        assert!(seq_lt(u32::MAX - 5, 3));
        assert!(!seq_lt(3, u32::MAX - 5));
    }

    #[test]
    fn test_ephemeral_ports_skip_ports_in_use() {
        let tables = TcpTables::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        tables
            .listeners
            .lock()
            .insert(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 49153), tx);

        assert_eq!(tables.allocate_port(), Some(49152));
        assert_eq!(tables.allocate_port(), Some(49154));
    }

    #[test]
    fn test_listener_lookup_falls_back_to_wildcard() {
        let tables = TcpTables::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        tables
            .listeners
            .lock()
            .insert(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 80), tx);

        let local = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 80);
        assert!(tables.listener_for(local).is_some());
        assert!(
            tables
                .listener_for(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 81))
                .is_none()
        );
    }
}
