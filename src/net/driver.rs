use std::collections::HashSet;
use std::net::SocketAddr;

use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::time::{Instant, interval, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::engine::{ConnId, Engine, Reactor};
use crate::net::connection::Connection;
use crate::net::reactor::TokioReactor;
use crate::net::{Event, Notification, PeerSource};

/// Runs an [`Engine`] over TCP on a single task.
///
/// The driver owns the listening socket and the timers, spawns a task per connection and
/// feeds everything those tasks report into the engine.
pub struct Driver {
    config: Config,
    engine: Engine,
    reactor: TokioReactor,
    listener: TcpListener,
    events_tx: Sender<Event>,
    events_rx: Receiver<Event>,
    notifications: Sender<Notification>,
    /// Addresses already dialed
    dialed: HashSet<SocketAddr>,
    next_conn: u64,
    complete: bool,
}

impl Driver {
    /// Binds the listening socket on `config.port` (0 picks a free port).
    pub async fn bind(
        config: Config,
        engine: Engine,
        notifications: Sender<Notification>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], config.port))).await?;
        info!("listening on {}", listener.local_addr()?);
        let (events_tx, events_rx) = mpsc::channel(config.events_buffer);
        Ok(Self {
            config,
            engine,
            reactor: TokioReactor::new(),
            listener,
            events_tx,
            events_rx,
            notifications,
            dialed: HashSet::new(),
            next_conn: 0,
            complete: false,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Runs until `shutdown` is cancelled or the engine fails, then hands the engine back.
    pub async fn run(
        mut self,
        mut peers: impl PeerSource,
        shutdown: CancellationToken,
    ) -> anyhow::Result<Engine> {
        self.engine.start(&mut self.reactor)?;
        self.dial_new_peers(&mut peers);
        let mut update_stats = interval(self.config.update_stats_interval);

        loop {
            self.check_complete();
            let deadline = self.reactor.next_deadline();
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutting down...");
                    break;
                },
                Some(event) = self.events_rx.recv() => self.handle(event)?,
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, addr)) => self.accept(socket, addr),
                    Err(err) => warn!("failed to accept connection: {}", err),
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.fire_timers()?;
                },
                _ = update_stats.tick() => {
                    self.notify_stats();
                    self.dial_new_peers(&mut peers);
                },
            }
        }

        self.reactor.close_all();
        Ok(self.engine)
    }

    fn handle(&mut self, event: Event) -> anyhow::Result<()> {
        match event {
            Event::Connected(conn) if self.reactor.is_open(conn) => {
                self.engine.on_connect(&mut self.reactor, conn)?
            }
            Event::Data(conn, data) if self.reactor.is_open(conn) => {
                self.engine.on_data(&mut self.reactor, conn, &data)?
            }
            Event::Flushed(conn) if self.reactor.is_open(conn) => {
                self.engine.on_flushed(&mut self.reactor, conn)?
            }
            Event::Closed(conn) => {
                if self.reactor.remove(conn) {
                    self.engine.on_closed(&mut self.reactor, conn)?;
                }
            }
            event => debug!("dropping event for closed connection: {:?}", event),
        }
        Ok(())
    }

    fn fire_timers(&mut self) -> anyhow::Result<()> {
        let now = Instant::now();
        while let Some(key) = self.reactor.pop_due(now) {
            self.engine.on_timer(&mut self.reactor, key)?;
        }
        Ok(())
    }

    fn accept(&mut self, socket: TcpStream, addr: SocketAddr) {
        let conn = self.next_conn();
        info!("{} accepted connection from {}", conn, addr);
        self.spawn(conn, addr, Some(socket));
    }

    fn dial_new_peers(&mut self, peers: &mut impl PeerSource) {
        for addr in peers.peers() {
            if !self.dialed.insert(addr) {
                continue;
            }
            let conn = self.next_conn();
            info!("{} dialing {}", conn, addr);
            self.spawn(conn, addr, None);
        }
    }

    fn spawn(&mut self, conn: ConnId, addr: SocketAddr, socket: Option<TcpStream>) {
        let connection = Connection::spawn(
            conn,
            addr,
            socket,
            self.events_tx.clone(),
            self.config.connect_timeout,
        );
        self.reactor.register(conn, connection);
    }

    fn next_conn(&mut self) -> ConnId {
        self.next_conn += 1;
        ConnId(self.next_conn)
    }

    fn notify_stats(&mut self) {
        let stats = self.engine.stats(self.reactor.now());
        debug!(
            "{:.1}% complete, {} peers, down {}, up {}",
            stats.completed(),
            stats.connected_peers,
            stats.download_rate,
            stats.upload_rate
        );
        if self.notifications.try_send(Notification::Stats(stats)).is_err() {
            warn!("failed sending notification");
        }
    }

    fn check_complete(&mut self) {
        if self.complete || !self.engine.is_complete() {
            return;
        }
        self.complete = true;
        info!("all pieces present");
        if self
            .notifications
            .try_send(Notification::DownloadComplete)
            .is_err()
        {
            warn!("failed sending notification");
        }
    }
}
