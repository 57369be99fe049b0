use std::net::SocketAddr;
use std::time::Duration;

use anyhow::anyhow;
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, Sender, UnboundedReceiver, UnboundedSender};
use tokio::time::timeout;
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::engine::ConnId;
use crate::net::Event;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Handle to the task that owns one socket. Outbound bytes are queued to the task, inbound
/// bytes come back as events.
pub struct Connection {
    tx: UnboundedSender<Bytes>,
    cancellation_token: CancellationToken,
}

impl Connection {
    /// Starts the connection task. Without a `socket` the task dials `addr` first.
    pub fn spawn(
        conn: ConnId,
        addr: SocketAddr,
        socket: Option<TcpStream>,
        events: Sender<Event>,
        connect_timeout: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancellation_token = CancellationToken::new();
        let token = cancellation_token.clone();
        tokio::spawn(async move {
            let result = run(conn, addr, socket, &events, rx, &token, connect_timeout).await;
            if let Err(err) = result {
                warn!("{} error on {}: {}", conn, addr, err);
            }
            if token.is_cancelled() {
                return;
            }
            info!("{} peer {} disconnected", conn, addr);
            if events.send(Event::Closed(conn)).await.is_err() {
                debug!("{} driver already stopped", conn);
            }
        });
        Self {
            tx,
            cancellation_token,
        }
    }

    pub fn send(&self, data: Bytes) {
        if self.tx.send(data).is_err() {
            warn!("channel already closed");
        }
    }

    /// Writes whatever is still queued and closes the socket.
    pub fn close(self) {
        self.cancellation_token.cancel();
    }
}

async fn run(
    conn: ConnId,
    addr: SocketAddr,
    socket: Option<TcpStream>,
    events: &Sender<Event>,
    mut rx: UnboundedReceiver<Bytes>,
    cancellation_token: &CancellationToken,
    connect_timeout: Duration,
) -> anyhow::Result<()> {
    let socket = match socket {
        Some(socket) => socket,
        None => {
            debug!("{} connecting to {}", conn, addr);
            timeout(connect_timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| anyhow!("connection to {} timed out", addr))??
        }
    };
    events.send(Event::Connected(conn)).await?;

    let (mut reader, mut writer) = socket.into_split();
    let mut buf = vec![0; READ_BUFFER_SIZE];
    loop {
        tokio::select! {
            read = reader.read(&mut buf) => {
                let read = read?;
                if read == 0 {
                    info!("{} socket closed by {}", conn, addr);
                    return Ok(());
                }
                let data = Bytes::copy_from_slice(&buf[..read]);
                events.send(Event::Data(conn, data)).await?;
            },
            Some(data) = rx.recv() => {
                writer.write_all(&data).await?;
                events.send(Event::Flushed(conn)).await?;
            },
            _ = cancellation_token.cancelled() => {
                debug!("{} shutting down...", conn);
                while let Ok(data) = rx.try_recv() {
                    writer.write_all(&data).await?;
                }
                writer.shutdown().await?;
                return Ok(());
            }
        }
    }
}
