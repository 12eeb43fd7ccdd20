// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! One accepted TCP socket. The reader task drives the packet codec and
//! hands completed packets to whichever callback is currently installed;
//! writes funnel through a single writer task on the main executor so each
//! socket has exactly one serialization point.

use bytes::Bytes;
use croupier_wire::{CodecError, Packet, PacketCodec};
use futures_util::StreamExt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub type PacketCallback = Arc<dyn Fn(Packet) + Send + Sync>;
pub type DisconnectedCallback = Box<dyn FnOnce() + Send>;

pub struct ClientSocket {
    peer_addr: String,
    writer: tokio::sync::mpsc::UnboundedSender<Bytes>,
    read_half: Mutex<Option<OwnedReadHalf>>,
    packet_callback: Mutex<Option<PacketCallback>>,
    disconnected_callback: Mutex<Option<DisconnectedCallback>>,
    closed: CancellationToken,
    fired: AtomicBool,
    /// Kills connections that never complete the handshake.
    pub signup_timer: Mutex<Option<JoinHandle<()>>>,
}

impl ClientSocket {
    /// Wrap an accepted stream. Must run inside the main runtime: the writer
    /// task is spawned here.
    pub fn new(stream: TcpStream) -> Arc<Self> {
        let peer_addr = stream
            .peer_addr()
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let (read_half, mut write_half) = stream.into_split();

        let (writer, mut writer_rx) = tokio::sync::mpsc::unbounded_channel::<Bytes>();
        let closed = CancellationToken::new();

        let writer_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = writer_rx.recv() => match msg {
                        Some(buf) => {
                            if write_half.write_all(&buf).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = writer_closed.cancelled() => break,
                }
            }
            let _ = write_half.shutdown().await;
        });

        let addr = peer_addr.clone();
        Arc::new(Self {
            peer_addr,
            writer,
            read_half: Mutex::new(Some(read_half)),
            packet_callback: Mutex::new(None),
            disconnected_callback: Mutex::new(Some(Box::new(move || {
                info!("client {addr} disconnected");
            }))),
            closed,
            fired: AtomicBool::new(false),
            signup_timer: Mutex::new(None),
        })
    }

    pub fn peer_address(&self) -> &str {
        &self.peer_addr
    }

    /// Spawn the reader loop. Packets go to the installed callback; any read
    /// error or malformed frame ends the session and fires the disconnected
    /// callback exactly once.
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let Some(read_half) = this.read_half.lock().unwrap().take() else {
                return;
            };
            let mut framed = FramedRead::new(read_half, PacketCodec::new());
            loop {
                tokio::select! {
                    _ = this.closed.cancelled() => break,
                    frame = framed.next() => match frame {
                        Some(Ok(packet)) => {
                            let callback = this.packet_callback.lock().unwrap().clone();
                            if let Some(callback) = callback {
                                callback(packet);
                            }
                        }
                        Some(Err(CodecError::MalformedFrame)) => {
                            warn!("Malformed data from client {}", this.peer_addr);
                            break;
                        }
                        Some(Err(_)) | None => break,
                    },
                }
            }
            this.closed.cancel();
            this.fire_disconnected();
        });
    }

    pub fn send(&self, buf: Bytes) {
        let _ = self.writer.send(buf);
    }

    /// Close from the server side. Safe to call repeatedly and from any
    /// thread; late packet deliveries land on an empty callback slot.
    pub fn disconnect_from_host(&self) {
        self.closed.cancel();
        self.fire_disconnected();
    }

    fn fire_disconnected(&self) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel_signup_timer();
        let callback = self.disconnected_callback.lock().unwrap().take();
        *self.packet_callback.lock().unwrap() = None;
        if let Some(callback) = callback {
            callback();
        }
    }

    pub fn set_packet_callback(&self, callback: Option<PacketCallback>) {
        *self.packet_callback.lock().unwrap() = callback;
    }

    pub fn set_disconnected_callback(&self, callback: Option<DisconnectedCallback>) {
        *self.disconnected_callback.lock().unwrap() = callback;
    }

    pub fn cancel_signup_timer(&self) {
        if let Some(timer) = self.signup_timer.lock().unwrap().take() {
            timer.abort();
        }
    }
}

impl Drop for ClientSocket {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}
