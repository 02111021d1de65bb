use crate::network::frame::{IcmpMessage, IpPayload, Ipv4Datagram, UnreachableCode};
use crate::stack::ProtocolStack;
use crate::stack::ip::IpError;
use futures::{FutureExt, select_biased};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;

#[derive(Clone, Debug)]
pub struct PingOptions {
    pub ttl: u8,
    /// Scaled by the speed factor
    pub timeout: Duration,
    pub payload_size: usize,
}

impl Default for PingOptions {
    fn default() -> Self {
        Self {
            ttl: Ipv4Datagram::DEFAULT_TTL,
            timeout: Duration::from_secs(2),
            payload_size: 32,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PingReply {
    pub responder: Ipv4Addr,
    pub sequence: u16,
    /// TTL of the reply when it arrived
    pub ttl: u8,
    pub round_trip: Duration,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PingError {
    #[error("request timed out")]
    Timeout,
    #[error("destination unreachable ({code:?}), reported by {from}")]
    Unreachable { from: Ipv4Addr, code: UnreachableCode },
    #[error("TTL exceeded in transit, reported by {from}")]
    TimeExceeded { from: Ipv4Addr },
    #[error("unable to send the request: {0}")]
    Send(#[from] IpError),
    #[error("the node is not running")]
    Stopped,
}

type EchoOutcome = Result<(Ipv4Addr, u8), PingError>;

pub(crate) struct IcmpState {
    identifier: u16,
    next_sequence: AtomicU16,
    pending: Mutex<HashMap<(u16, u16), oneshot::Sender<EchoOutcome>>>,
}

impl IcmpState {
    pub(crate) fn new(identifier: u16) -> Self {
        Self {
            identifier,
            next_sequence: AtomicU16::new(1),
            pending: Mutex::default(),
        }
    }

    fn complete(&self, identifier: u16, sequence: u16, outcome: EchoOutcome) {
        if let Some(waiter) = self.pending.lock().remove(&(identifier, sequence)) {
            // The pinger may have given up already
            waiter.send(outcome).ok();
        }
    }

    pub(crate) fn clear(&self) {
        self.pending.lock().clear();
    }
}

impl ProtocolStack {
    /// Sends an echo request and waits for the matching reply
    ///
    /// The round trip includes the time spent resolving the first hop.
    pub async fn ping(
        self: &Arc<Self>,
        destination: Ipv4Addr,
        options: PingOptions,
    ) -> Result<PingReply, PingError> {
        let identifier = self.icmp.identifier;
        let sequence = self.icmp.next_sequence.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.icmp
            .pending
            .lock()
            .insert((identifier, sequence), tx);

        let result = self
            .echo(destination, identifier, sequence, &options, rx)
            .await;
        self.icmp.pending.lock().remove(&(identifier, sequence));
        result
    }

    async fn echo(
        &self,
        destination: Ipv4Addr,
        identifier: u16,
        sequence: u16,
        options: &PingOptions,
        outcome: oneshot::Receiver<EchoOutcome>,
    ) -> Result<PingReply, PingError> {
        let source = self.source_address_for(destination)?;
        let request = self.datagram(
            source,
            destination,
            options.ttl,
            IpPayload::Icmp(IcmpMessage::EchoRequest {
                identifier,
                sequence,
                data: vec![0x61; options.payload_size],
            }),
        );

        let start = Instant::now();
        self.send_datagram(request, None).await?;

        let timeout = tokio::time::sleep(self.context.scaled(options.timeout));
        select_biased! {
            _ = self.token.cancelled().fuse() => Err(PingError::Stopped),
            outcome = outcome.fuse() => match outcome {
                Ok(Ok((responder, ttl))) => Ok(PingReply {
                    responder,
                    sequence,
                    ttl,
                    round_trip: start.elapsed(),
                }),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(PingError::Stopped),
            },
            _ = timeout.fuse() => Err(PingError::Timeout),
        }
    }

    pub(crate) fn handle_icmp(
        self: &Arc<Self>,
        datagram: &Ipv4Datagram,
        message: &IcmpMessage,
        ingress: Option<usize>,
    ) {
        match message {
            IcmpMessage::EchoRequest {
                identifier,
                sequence,
                data,
            } => {
                // Requests to a broadcast address are answered from the receiving interface
                let source = if self.is_own_address(datagram.destination)
                    || datagram.destination.is_loopback()
                {
                    Some(datagram.destination)
                } else {
                    ingress.and_then(|index| self.nics[index].ip())
                };
                let Some(source) = source else {
                    return;
                };

                let reply = self.datagram(
                    source,
                    datagram.source,
                    Ipv4Datagram::DEFAULT_TTL,
                    IpPayload::Icmp(IcmpMessage::EchoReply {
                        identifier: *identifier,
                        sequence: *sequence,
                        data: data.clone(),
                    }),
                );
                self.route_datagram(reply, false);
            }
            IcmpMessage::EchoReply {
                identifier,
                sequence,
                ..
            } => {
                self.icmp.complete(
                    *identifier,
                    *sequence,
                    Ok((datagram.source, datagram.ttl)),
                );
            }
            IcmpMessage::DestinationUnreachable { code, original } => {
                if let Some((identifier, sequence)) = echo_request_id(original) {
                    let error = PingError::Unreachable {
                        from: datagram.source,
                        code: *code,
                    };
                    self.icmp.complete(identifier, sequence, Err(error));
                }
            }
            IcmpMessage::TimeExceeded { original } => {
                if let Some((identifier, sequence)) = echo_request_id(original) {
                    let error = PingError::TimeExceeded {
                        from: datagram.source,
                    };
                    self.icmp.complete(identifier, sequence, Err(error));
                }
            }
        }
    }

    /// Reports a problem with `original` back to its sender
    pub(crate) fn send_icmp_error(self: &Arc<Self>, original: &Ipv4Datagram, message: IcmpMessage) {
        // No errors about errors, nor about datagrams that cannot be answered
        if original.is_icmp_error()
            || original.source.is_unspecified()
            || original.destination.is_broadcast()
        {
            return;
        }

        let Ok(source) = self.source_address_for(original.source) else {
            return;
        };

        let error = self.datagram(
            source,
            original.source,
            Ipv4Datagram::DEFAULT_TTL,
            IpPayload::Icmp(message),
        );
        self.route_datagram(error, false);
    }
}

fn echo_request_id(original: &Ipv4Datagram) -> Option<(u16, u16)> {
    match &original.payload {
        IpPayload::Icmp(IcmpMessage::EchoRequest {
            identifier,
            sequence,
            ..
        }) => Some((*identifier, *sequence)),
        _ => None,
    }
}
