use log::{debug, info, trace, warn};
use std::{
    error, fmt,
    future::{self, Future},
    io,
    net::{IpAddr, SocketAddr},
    pin::pin,
    sync::Arc,
    task::Poll,
    time::{Duration, Instant},
};
use tokio::{net::UdpSocket, runtime, signal, sync::mpsc, time};

use crate::logger::fmt_slice_hex;

mod crypto;
mod engine;
mod exchange;
mod keys;
mod message;
mod policy;
mod session;

pub use engine::{Engine, EngineConfig, Outbound};
pub use exchange::Credentials;
pub use keys::SkPxLength;
pub use message::Identification;

const MAX_DATAGRAM_SIZE: usize = 1500;

const TIMER_TICK_INTERVAL: Duration = Duration::from_millis(250);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Config {
    pub listen_ips: Vec<IpAddr>,
    pub port: u16,
    pub engine: EngineConfig,
    // Peer to start an IKE SA with; without it the server only responds.
    pub remote: Option<SocketAddr>,
}

pub struct Server {
    listen_ips: Vec<IpAddr>,
    port: u16,
    remote: Option<SocketAddr>,
    engine: Engine,
}

enum Event {
    Datagram(UdpDatagram),
    TimerTick,
    Shutdown,
}

impl Server {
    pub fn new(config: Config) -> Server {
        Server {
            listen_ips: config.listen_ips,
            port: config.port,
            remote: config.remote,
            engine: Engine::new(config.engine),
        }
    }

    pub fn run(self) -> Result<(), IKEv2Error> {
        let rt = runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()?;
        rt.block_on(self.serve())?;
        info!("Stopped server");
        Ok(())
    }

    async fn serve(mut self) -> Result<(), IKEv2Error> {
        let mut sockets = Sockets::new(&self.listen_ips, self.port).await?;
        if let Some(remote) = self.remote {
            let (local_spi, outbound) = self.engine.initiate(remote, Instant::now());
            debug!("Started session {:016x} with {}", local_spi, remote);
            sockets.send_all(None, outbound).await;
        }

        let mut interval = time::interval(TIMER_TICK_INTERVAL);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        let mut shutdown_signal = pin!(signal::ctrl_c());
        let mut shutdown_deadline = None;
        loop {
            if let Some(deadline) = shutdown_deadline {
                if self.engine.is_empty() {
                    debug!("Shutdown completed");
                    return Ok(());
                }
                if Instant::now() >= deadline {
                    warn!("Shutdown timed out, dropping remaining sessions");
                    return Ok(());
                }
            }
            // Wait until something is ready.
            let event = {
                let waiting_shutdown = shutdown_deadline.is_none();
                let mut receive_udp = pin!(sockets.receive_datagram());
                let mut tick = pin!(interval.tick());
                let mut shutdown_signal = shutdown_signal.as_mut();
                future::poll_fn(move |cx| {
                    if waiting_shutdown && shutdown_signal.as_mut().poll(cx).is_ready() {
                        return Poll::Ready(Event::Shutdown);
                    }
                    if let Poll::Ready(datagram) = receive_udp.as_mut().poll(cx) {
                        return match datagram {
                            Some(datagram) => Poll::Ready(Event::Datagram(datagram)),
                            None => Poll::Ready(Event::Shutdown),
                        };
                    }
                    if tick.as_mut().poll(cx).is_ready() {
                        return Poll::Ready(Event::TimerTick);
                    }
                    Poll::Pending
                })
                .await
            };
            let now = Instant::now();
            match event {
                Event::Datagram(datagram) => {
                    let outbound =
                        self.engine
                            .process_datagram(datagram.remote_addr, &datagram.bytes, now);
                    sockets.send_all(Some(&datagram), outbound).await;
                }
                Event::TimerTick => {
                    let outbound = self.engine.handle_timers(now);
                    sockets.send_all(None, outbound).await;
                }
                Event::Shutdown => {
                    if shutdown_deadline.is_none() {
                        info!("Shutting down, deleting all sessions");
                        shutdown_deadline = Some(now + SHUTDOWN_TIMEOUT);
                        let outbound = self.engine.shutdown(now);
                        sockets.send_all(None, outbound).await;
                    }
                }
            }
        }
    }
}

struct Sockets {
    sockets: Vec<(SocketAddr, Arc<UdpSocket>)>,
    listen_rx: mpsc::Receiver<UdpDatagram>,
}

impl Sockets {
    async fn new(listen_ips: &[IpAddr], port: u16) -> Result<Sockets, IKEv2Error> {
        let mut sockets = vec![];
        for listen_ip in listen_ips {
            let socket = match UdpSocket::bind((*listen_ip, port)).await {
                Ok(socket) => socket,
                Err(err) => {
                    log::error!("Failed to open listener on {}: {}", listen_ip, err);
                    return Err(err.into());
                }
            };
            let listen_addr = socket.local_addr()?;
            info!("Started server on {}", listen_addr);
            sockets.push((listen_addr, Arc::new(socket)));
        }
        let rt = runtime::Handle::current();
        let (listen_tx, listen_rx) = mpsc::channel(16);
        sockets.iter().for_each(|(listen_addr, socket)| {
            rt.spawn(Self::run_receiver(
                listen_tx.clone(),
                *listen_addr,
                socket.clone(),
            ));
        });
        Ok(Sockets { sockets, listen_rx })
    }

    async fn run_receiver(
        tx: mpsc::Sender<UdpDatagram>,
        listen_addr: SocketAddr,
        socket: Arc<UdpSocket>,
    ) {
        loop {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            let (bytes_res, remote_addr) = match socket.recv_from(&mut buf).await {
                Ok(res) => res,
                Err(err) => {
                    warn!("Failed to receive from socket {}: {}", listen_addr, err);
                    return;
                }
            };
            buf.truncate(bytes_res);
            let msg = UdpDatagram {
                remote_addr,
                local_addr: listen_addr,
                bytes: buf,
            };
            if tx.send(msg).await.is_err() {
                warn!("Channel closed for {}", listen_addr);
                return;
            }
        }
    }

    async fn receive_datagram(&mut self) -> Option<UdpDatagram> {
        self.listen_rx.recv().await
    }

    /// Replies leave from the socket that received the request; other messages pick by address family.
    fn select_socket(
        &self,
        received: Option<&UdpDatagram>,
        remote_addr: &SocketAddr,
    ) -> Option<&Arc<UdpSocket>> {
        let reply_addr = received
            .filter(|datagram| datagram.remote_addr == *remote_addr)
            .map(|datagram| datagram.local_addr);
        if let Some(local_addr) = reply_addr {
            if let Some((_, socket)) = self.sockets.iter().find(|(addr, _)| *addr == local_addr) {
                return Some(socket);
            }
        }
        self.sockets
            .iter()
            .find(|(addr, _)| addr.is_ipv4() == remote_addr.is_ipv4())
            .or_else(|| {
                self.sockets
                    .iter()
                    .find(|(addr, _)| addr.ip().is_unspecified() && addr.is_ipv6())
            })
            .map(|(_, socket)| socket)
    }

    async fn send_all(&self, received: Option<&UdpDatagram>, outbound: Vec<Outbound>) {
        for msg in outbound {
            let socket = match self.select_socket(received, &msg.remote) {
                Some(socket) => socket,
                None => {
                    warn!("No open sockets for destination {}", msg.remote);
                    continue;
                }
            };
            let data = msg.data.data();
            trace!("Sending {:?}: {}", msg, fmt_slice_hex(data));
            if let Err(err) = socket.send_to(data, msg.remote).await {
                warn!("Failed to send UDP message to {}: {}", msg.remote, err);
            }
        }
    }
}

struct UdpDatagram {
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    bytes: Vec<u8>,
}

#[derive(Debug)]
pub enum IKEv2Error {
    Internal(&'static str),
    Io(io::Error),
}

impl fmt::Display for IKEv2Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Internal(msg) => f.write_str(msg),
            Self::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl error::Error for IKEv2Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Internal(_msg) => None,
            Self::Io(err) => Some(err),
        }
    }
}

impl From<&'static str> for IKEv2Error {
    fn from(msg: &'static str) -> IKEv2Error {
        Self::Internal(msg)
    }
}

impl From<io::Error> for IKEv2Error {
    fn from(err: io::Error) -> IKEv2Error {
        Self::Io(err)
    }
}
