//! Internal TCP transport: a full mesh of typed point-to-point connections.
//!
//! Every rank binds a listener, then proactively connects to every peer of
//! lower rank; each established connection is handshaked with the dialing
//! rank's id, so each pair of ranks shares exactly one connection. A
//! per-peer messenger task owns the connection and shuttles `Msg` values
//! between the socket and the hub's channels. The consuming event loop sees
//! a single receive stream plus the [`Inbox`], which restores selective
//! receive (probe by peer/tag) on top of it.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::layout::Rank;
use crate::msg::Msg;
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry, tcp_connect_with_retry, TaskmillError,
};

/// Cluster-internal TCP transport hub, one per rank.
pub struct CommHub {
    /// My own rank.
    me: Rank,

    /// Receiver side of the recv channel, shared by all messenger tasks.
    rx_recv: mpsc::UnboundedReceiver<(Rank, Msg)>,

    /// Peer rank -> sender side of that peer's send channel. Lazily updated
    /// from the acceptor's notifications.
    tx_sends: HashMap<Rank, mpsc::UnboundedSender<Msg>>,

    /// Notifications of newly connected peers from the acceptor task.
    rx_newpeer: mpsc::UnboundedReceiver<(Rank, mpsc::UnboundedSender<Msg>)>,

    /// Sender used to ask the acceptor task to proactively dial a peer.
    tx_connect: mpsc::UnboundedSender<(Rank, SocketAddr)>,

    _acceptor_handle: JoinHandle<()>,
}

impl CommHub {
    /// Binds the listener for `me` and spawns the acceptor task.
    pub async fn new_and_setup(me: Rank, bind_addr: SocketAddr) -> Result<Self, TaskmillError> {
        let (tx_recv, rx_recv) = mpsc::unbounded_channel();
        let (tx_newpeer, rx_newpeer) = mpsc::unbounded_channel();
        let (tx_connect, rx_connect) = mpsc::unbounded_channel();

        let listener = tcp_bind_with_retry(bind_addr, 10).await?;
        let mut acceptor = AcceptorTask {
            me,
            listener,
            tx_recv,
            tx_newpeer,
            rx_connect,
        };
        let acceptor_handle = tokio::spawn(async move { acceptor.run().await });

        Ok(CommHub {
            me,
            rx_recv,
            tx_sends: HashMap::new(),
            rx_newpeer,
            tx_connect,
            _acceptor_handle: acceptor_handle,
        })
    }

    /// Dials every peer with rank lower than mine, then waits until all
    /// `size - 1` peers are connected (the higher ranks dial us).
    pub async fn wireup(&mut self, addrs: &[SocketAddr]) -> Result<(), TaskmillError> {
        for (rank, &addr) in addrs.iter().enumerate() {
            let rank = rank as Rank;
            if rank < self.me {
                self.tx_connect.send((rank, addr))?;
            }
        }
        self.wait_for_peers(addrs.len() - 1).await
    }

    /// Waits until at least `count` peers are connected.
    pub async fn wait_for_peers(&mut self, count: usize) -> Result<(), TaskmillError> {
        while self.tx_sends.len() < count {
            match self.rx_newpeer.recv().await {
                Some((rank, tx_send)) => {
                    self.tx_sends.insert(rank, tx_send);
                }
                None => return logged_err!("new-peer channel closed during wireup"),
            }
        }
        Ok(())
    }

    fn poll_new_peers(&mut self) {
        while let Ok((rank, tx_send)) = self.rx_newpeer.try_recv() {
            self.tx_sends.insert(rank, tx_send);
        }
    }

    /// Sends a message to a specified peer.
    pub fn send_msg(&mut self, msg: Msg, peer: Rank) -> Result<(), TaskmillError> {
        self.poll_new_peers();
        match self.tx_sends.get(&peer) {
            Some(tx_send) => tx_send.send(msg).map_err(TaskmillError::from),
            None => logged_err!("peer {} not connected", peer),
        }
    }

    /// Receives the next message from any peer.
    pub async fn recv_msg(&mut self) -> Result<(Rank, Msg), TaskmillError> {
        match self.rx_recv.recv().await {
            Some((rank, msg)) => Ok((rank, msg)),
            None => logged_err!("recv channel has been closed"),
        }
    }

    /// Non-blocking receive.
    pub fn try_recv_msg(&mut self) -> Option<(Rank, Msg)> {
        self.rx_recv.try_recv().ok()
    }
}

/// Acceptor task: listens for incoming peer connections and dials peers on
/// request, spawning one messenger task per established connection.
struct AcceptorTask {
    me: Rank,
    listener: TcpListener,
    tx_recv: mpsc::UnboundedSender<(Rank, Msg)>,
    tx_newpeer: mpsc::UnboundedSender<(Rank, mpsc::UnboundedSender<Msg>)>,
    rx_connect: mpsc::UnboundedReceiver<(Rank, SocketAddr)>,
}

impl AcceptorTask {
    fn register_peer(&mut self, id: Rank, conn: TcpStream) {
        let (tx_send, rx_send) = mpsc::unbounded_channel();
        let mut messenger = MessengerTask::new(id, conn, rx_send, self.tx_recv.clone());
        tokio::spawn(async move { messenger.run().await });
        if let Err(e) = self.tx_newpeer.send((id, tx_send)) {
            pf_error!("error publishing new peer {}: {}", id, e);
        }
    }

    async fn connect_new_peer(&mut self, id: Rank, addr: SocketAddr) -> Result<(), TaskmillError> {
        pf_debug!("connecting to peer {} '{}'...", id, addr);
        let mut stream = tcp_connect_with_retry(addr, 10).await?;
        stream.write_i32(self.me).await?; // send my rank
        self.register_peer(id, stream);
        pf_debug!("connected to peer {}", id);
        Ok(())
    }

    async fn accept_new_peer(&mut self, mut stream: TcpStream) -> Result<(), TaskmillError> {
        let id = match stream.read_i32().await {
            Ok(id) => id,
            Err(e) => return logged_err!("error receiving new peer rank: {}", e),
        };
        self.register_peer(id, stream);
        pf_debug!("waited on peer {}", id);
        Ok(())
    }

    async fn run(&mut self) {
        pf_debug!("acceptor task spawned");

        loop {
            tokio::select! {
                // proactive connection request
                to_connect = self.rx_connect.recv() => {
                    let Some((peer, addr)) = to_connect else {
                        break; // hub dropped, shutting down
                    };
                    if let Err(e) = self.connect_new_peer(peer, addr).await {
                        pf_error!("error connecting to peer {}: {}", peer, e);
                    }
                },

                // new peer connection accepted
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            if let Err(e) = self.accept_new_peer(stream).await {
                                pf_error!("error accepting new peer: {}", e);
                            }
                        },
                        Err(e) => {
                            pf_warn!("error accepting peer connection: {}", e);
                        },
                    }
                },
            }
        }
    }
}

/// Per-peer messenger task, owning both halves of the connection.
struct MessengerTask {
    id: Rank,

    conn_read: OwnedReadHalf,
    conn_write: OwnedWriteHalf,

    rx_send: mpsc::UnboundedReceiver<Msg>,
    tx_recv: mpsc::UnboundedSender<(Rank, Msg)>,

    read_buf: BytesMut,
    write_buf: BytesMut,
    write_buf_cursor: usize,
    retrying: bool,
}

impl MessengerTask {
    fn new(
        id: Rank,
        conn: TcpStream,
        rx_send: mpsc::UnboundedReceiver<Msg>,
        tx_recv: mpsc::UnboundedSender<(Rank, Msg)>,
    ) -> Self {
        let (conn_read, conn_write) = conn.into_split();
        MessengerTask {
            id,
            conn_read,
            conn_write,
            rx_send,
            tx_recv,
            read_buf: BytesMut::with_capacity(8 + 1024),
            write_buf: BytesMut::with_capacity(8 + 1024),
            write_buf_cursor: 0,
            retrying: false,
        }
    }

    async fn run(&mut self) {
        pf_debug!("messenger task for peer {} spawned", self.id);

        loop {
            tokio::select! {
                // gets a message to send out
                msg = self.rx_send.recv(), if !self.retrying => {
                    let Some(msg) = msg else {
                        break; // channel closed and no messages remain
                    };
                    match safe_tcp_write(
                        &mut self.write_buf,
                        &mut self.write_buf_cursor,
                        &self.conn_write,
                        Some(&msg),
                    ) {
                        Ok(true) => {},
                        Ok(false) => {
                            self.retrying = true;
                        }
                        Err(e) => {
                            pf_error!("error sending -> {}: {}", self.id, e);
                            break;
                        }
                    }
                },

                // retrying last unsuccessful send
                _ = self.conn_write.writable(), if self.retrying => {
                    match safe_tcp_write::<Msg, _>(
                        &mut self.write_buf,
                        &mut self.write_buf_cursor,
                        &self.conn_write,
                        None,
                    ) {
                        Ok(true) => {
                            self.retrying = false;
                        }
                        Ok(false) => {},
                        Err(e) => {
                            pf_error!("error retrying send -> {}: {}", self.id, e);
                            break;
                        }
                    }
                },

                // receives new message from peer
                msg = safe_tcp_read::<Msg, _>(&mut self.read_buf, &mut self.conn_read) => {
                    match msg {
                        Ok(msg) => {
                            if let Err(e) = self.tx_recv.send((self.id, msg)) {
                                pf_error!("error feeding recv channel for {}: {}",
                                          self.id, e);
                            }
                        },
                        Err(_e) => {
                            break; // probably the peer exited
                        }
                    }
                }
            }
        }

        pf_debug!("messenger task for peer {} exited", self.id);
    }
}

/// Selective-receive buffer layered over the hub's single recv stream.
///
/// Messages pulled from the hub that don't match the current interest are
/// parked here and re-offered to every later probe/receive, preserving
/// per-peer arrival order.
#[derive(Default)]
pub struct Inbox {
    pending: VecDeque<(Rank, Msg)>,
}

impl Inbox {
    pub fn new() -> Self {
        Inbox::default()
    }

    /// Non-blocking probe: drains whatever the hub currently has buffered,
    /// then takes the first parked message matching `pred`.
    pub fn probe_take(
        &mut self,
        hub: &mut CommHub,
        pred: impl Fn(Rank, &Msg) -> bool,
    ) -> Option<(Rank, Msg)> {
        while let Some(pair) = hub.try_recv_msg() {
            self.pending.push_back(pair);
        }
        let pos = self.pending.iter().position(|(r, m)| pred(*r, m))?;
        self.pending.remove(pos)
    }

    /// Takes the next message from any peer, parked ones first.
    pub async fn next_any(&mut self, hub: &mut CommHub) -> Result<(Rank, Msg), TaskmillError> {
        if let Some(pair) = self.pending.pop_front() {
            return Ok(pair);
        }
        hub.recv_msg().await
    }

    /// Waits for a message matching `pred`, parking everything else.
    pub async fn recv_match(
        &mut self,
        hub: &mut CommHub,
        pred: impl Fn(Rank, &Msg) -> bool,
    ) -> Result<(Rank, Msg), TaskmillError> {
        if let Some(pos) = self.pending.iter().position(|(r, m)| pred(*r, m)) {
            return Ok(self.pending.remove(pos).unwrap());
        }
        loop {
            let (rank, msg) = hub.recv_msg().await?;
            if pred(rank, &msg) {
                return Ok((rank, msg));
            }
            self.pending.push_back((rank, msg));
        }
    }

    /// Parks a freshly received message at the back, preserving arrival
    /// order.
    pub fn park(&mut self, rank: Rank, msg: Msg) {
        self.pending.push_back((rank, msg));
    }

    /// Number of parked messages.
    pub fn parked(&self) -> usize {
        self.pending.len()
    }
}
