// Labmesh - Peer-to-peer instant-messaging and file-sharing overlay for LAN classrooms over a minimal framed protocol
// Copyright (C) 2021  rumblefrog
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio_stream::StreamExt;
use tokio_util::codec::{BytesCodec, Decoder, Framed};

use bytes::Bytes;

use futures::sink::SinkExt;

use crate::error::LabmeshResult;
use crate::overlay::Message;
use crate::protocol::{ConnId, PeerDescriptor};
use crate::service::{Flow, Service, ServiceIo};
use crate::sinks::Ctx;

/// Commands the overlay loop posts onto a connection task.
#[derive(Debug)]
pub enum ConnCmd {
    /// Enqueue an already-encoded frame for the peer.
    Send(Bytes),

    Pause,

    Restore,
}

/// The overlay-side face of a connection: command and shutdown
/// channels, the peer descriptor, and the shared progress gauge.
#[derive(Debug)]
pub struct ConnHandle {
    pub peer: PeerDescriptor,

    pub tx_cmd: mpsc::UnboundedSender<ConnCmd>,

    /// Will drop the connection once sent.
    pub tx_shutdown: watch::Sender<bool>,

    /// Percentage of the active transfer, updated by the service.
    pub progress: Arc<AtomicU8>,
}

/// One socket, its peer, and the service currently driving the stream.
///
/// Runs as a single task; frames reach the active service in arrival
/// order and writes complete in the order they are posted.
pub struct Connection {
    id: ConnId,
    framed: Framed<TcpStream, BytesCodec>,
    rx_shutdown: watch::Receiver<bool>,
    rx_cmd: mpsc::UnboundedReceiver<ConnCmd>,
    events: mpsc::UnboundedSender<Message>,
    ctx: Ctx,
    service: Service,
    progress: Arc<AtomicU8>,
}

impl Connection {
    pub fn open(
        id: ConnId,
        peer: PeerDescriptor,
        stream: TcpStream,
        service: Service,
        events: mpsc::UnboundedSender<Message>,
        ctx: Ctx,
    ) -> (ConnHandle, Connection) {
        let (tx_shutdown, rx_shutdown) = watch::channel(false);
        let (tx_cmd, rx_cmd) = mpsc::unbounded_channel();
        let progress = Arc::new(AtomicU8::new(0));

        let handle = ConnHandle {
            peer,
            tx_cmd,
            tx_shutdown,
            progress: progress.clone(),
        };

        let conn = Connection {
            id,
            framed: BytesCodec::new().framed(stream),
            rx_shutdown,
            rx_cmd,
            events,
            ctx,
            service,
            progress,
        };

        (handle, conn)
    }

    /// Drive the connection until shutdown, peer close, service end or
    /// error. Announces the exit to the overlay loop on the way out.
    pub async fn run(self) {
        let Connection {
            id,
            mut framed,
            mut rx_shutdown,
            mut rx_cmd,
            events,
            ctx,
            mut service,
            progress,
        } = self;

        {
            let mut io = ServiceIo {
                framed: &mut framed,
                events: &events,
                ctx: &ctx,
                conn_id: &id,
                progress: &progress,
            };

            if let Err(e) = service.start(&mut io).await {
                warn!(
                    "Service start failed (id = {}) (service = {}): {}",
                    id,
                    service.name(),
                    e
                );
                service.close_out(&ctx);
                let _ = events.send(Message::Closed { id });
                return;
            }
        }

        loop {
            let step: LabmeshResult<Flow> = if service.wants_send() {
                select! {
                    biased;

                    _ = rx_shutdown.changed() => break,
                    Some(cmd) = rx_cmd.recv() => {
                        let mut io = ServiceIo {
                            framed: &mut framed,
                            events: &events,
                            ctx: &ctx,
                            conn_id: &id,
                            progress: &progress,
                        };
                        handle_cmd(cmd, &mut io, &mut service).await
                    }
                    frame = framed.next() => match frame {
                        Some(Ok(chunk)) => {
                            let mut io = ServiceIo {
                                framed: &mut framed,
                                events: &events,
                                ctx: &ctx,
                                conn_id: &id,
                                progress: &progress,
                            };
                            service.on_chunk(&mut io, &chunk).await
                        }
                        Some(Err(e)) => Err(e.into()),
                        None => Ok(Flow::Done),
                    },
                    // Nothing else pending: push the next body chunk.
                    _ = std::future::ready(()) => {
                        let mut io = ServiceIo {
                            framed: &mut framed,
                            events: &events,
                            ctx: &ctx,
                            conn_id: &id,
                            progress: &progress,
                        };
                        service.send_step(&mut io).await
                    }
                }
            } else {
                select! {
                    _ = rx_shutdown.changed() => break,
                    Some(cmd) = rx_cmd.recv() => {
                        let mut io = ServiceIo {
                            framed: &mut framed,
                            events: &events,
                            ctx: &ctx,
                            conn_id: &id,
                            progress: &progress,
                        };
                        handle_cmd(cmd, &mut io, &mut service).await
                    }
                    frame = framed.next() => match frame {
                        Some(Ok(chunk)) => {
                            let mut io = ServiceIo {
                                framed: &mut framed,
                                events: &events,
                                ctx: &ctx,
                                conn_id: &id,
                                progress: &progress,
                            };
                            service.on_chunk(&mut io, &chunk).await
                        }
                        Some(Err(e)) => Err(e.into()),
                        None => Ok(Flow::Done),
                    },
                }
            };

            match step {
                Ok(Flow::Continue) => (),
                Ok(Flow::Done) => break,
                Ok(Flow::Swap(swapped, residual)) => {
                    service = *swapped;
                    progress.store(service.progress(), Ordering::Relaxed);

                    let mut io = ServiceIo {
                        framed: &mut framed,
                        events: &events,
                        ctx: &ctx,
                        conn_id: &id,
                        progress: &progress,
                    };

                    match swap_in(&mut service, &mut io, &residual).await {
                        Ok(Flow::Done) => break,
                        Ok(_) => (),
                        Err(e) => {
                            debug!(
                                "Service swap failed (id = {}) (service = {}): {}",
                                id,
                                service.name(),
                                e
                            );
                            break;
                        }
                    }
                }
                Err(e) => {
                    debug!(
                        "Connection errored (id = {}) (service = {}): {}",
                        id,
                        service.name(),
                        e
                    );
                    break;
                }
            }
        }

        service.close_out(&ctx);
        debug!(
            "Connection closed (id = {}) (service = {}) (state = {:?})",
            id,
            service.name(),
            service.state()
        );
        let _ = events.send(Message::Closed { id });
    }
}

/// Start a freshly swapped-in service and feed it the transport tail
/// the greeting left behind.
async fn swap_in(
    service: &mut Service,
    io: &mut ServiceIo<'_>,
    residual: &[u8],
) -> LabmeshResult<Flow> {
    service.start(io).await?;

    if residual.is_empty() {
        return Ok(Flow::Continue);
    }

    service.on_chunk(io, residual).await
}

async fn handle_cmd(
    cmd: ConnCmd,
    io: &mut ServiceIo<'_>,
    service: &mut Service,
) -> LabmeshResult<Flow> {
    match cmd {
        ConnCmd::Send(bytes) => io.framed.send(bytes).await?,
        ConnCmd::Pause => service.pause(io).await?,
        ConnCmd::Restore => service.restore(io).await?,
    }

    Ok(Flow::Continue)
}
