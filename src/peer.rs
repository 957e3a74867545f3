use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, info, trace, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter, ReadHalf, WriteHalf},
    net::TcpStream,
    sync::Mutex,
};
use tokio_util::codec::FramedRead;

use crate::{
    error::ApplicationError,
    framer::{Frame, Framer},
    manager::PieceManager,
    piece::Block,
    protocol::{Handshake, Message},
    queue::BlockQueue,
    storage::StorageSink,
    torrent::Layout,
};

/// Represents a peer in the BitTorrent network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer {
    pub ip:   IpAddr,
    pub port: u16,
}

impl Peer {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr())
    }
}

/// Byte stream to a single peer.
pub trait PeerStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> PeerStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Opens transports to peers.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, peer: &Peer) -> Result<Box<dyn PeerStream>, ApplicationError>;
}

/// Plain TCP with a connect timeout.
pub struct TcpConnector {
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, peer: &Peer) -> Result<Box<dyn PeerStream>, ApplicationError> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(peer.addr()))
            .await
            .map_err(|_| ApplicationError::PeerError(format!("connect to {} timed out", peer)))?
            .map_err(|e| ApplicationError::PeerError(format!("{}: {}", peer, e)))?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// What a connection reports back to the swarm that owns it.
pub trait SwarmEvents: Send + Sync {
    /// A block arrived from `peer`.
    fn on_data_transfer(&self, peer: &Peer);
    /// The connection to `peer` is gone, for whatever reason.
    fn on_peer_disconnected(&self, peer: &Peer);
    /// The last missing block arrived.
    fn on_complete(&self);
}

/// Handles shared by every connection of one download.
#[derive(Clone)]
pub struct SwarmContext {
    pub layout:  Arc<Layout>,
    pub peer_id: [u8; 20],
    pub pieces:  Arc<Mutex<PieceManager>>,
    pub sink:    Arc<StorageSink>,
    pub events:  Arc<dyn SwarmEvents>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    AwaitingUnchoke,
    Requesting,
    Closed,
}

enum Flow {
    Continue,
    Close,
    Complete,
}

/// Drives the wire protocol with one peer, requesting at most one block at
/// a time.
pub struct PeerConnection<S: PeerStream> {
    peer:   Peer,
    state:  ConnectionState,
    queue:  BlockQueue,
    reader: FramedRead<ReadHalf<S>, Framer>,
    writer: BufWriter<WriteHalf<S>>,
    ctx:    SwarmContext,
}

impl<S: PeerStream> PeerConnection<S> {
    pub fn new(peer: Peer, stream: S, ctx: SwarmContext) -> Self {
        let (rh, wh) = tokio::io::split(stream);
        Self {
            peer,
            state: ConnectionState::Connecting,
            queue: BlockQueue::new(ctx.layout.clone()),
            reader: FramedRead::new(rh, Framer::new()),
            writer: BufWriter::new(wh),
            ctx,
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        trace!("{}: {:?} -> {:?}", self.peer, self.state, next);
        self.state = next;
    }

    /// Runs the connection until the peer goes away, chokes us, or the
    /// download completes.
    pub async fn run(mut self) -> Result<(), ApplicationError> {
        let handshake = Handshake::new(self.ctx.layout.info_hash, self.ctx.peer_id);
        self.send_raw(&handshake.encode()).await?;
        self.transition(ConnectionState::Handshaking);

        let mut complete = false;
        while let Some(frame) = self.reader.next().await {
            match self.handle_frame(frame?).await? {
                Flow::Continue => {}
                Flow::Close => break,
                Flow::Complete => {
                    complete = true;
                    break;
                }
            }
        }

        self.transition(ConnectionState::Closed);
        let _ = self.writer.shutdown().await;
        if complete {
            self.ctx.events.on_complete();
        }
        Ok(())
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<Flow, ApplicationError> {
        let bytes = match frame {
            Frame::Handshake(bytes) => {
                let handshake = Handshake::decode(&bytes)?;
                if handshake.info_hash != self.ctx.layout.info_hash {
                    warn!("{} answered with a different info hash", self.peer);
                }
                debug!(
                    "handshake with {} ({}) complete",
                    self.peer,
                    String::from_utf8_lossy(&handshake.peer_id)
                );
                self.send(Message::Interested).await?;
                self.transition(ConnectionState::AwaitingUnchoke);
                return Ok(Flow::Continue);
            }
            Frame::Message(bytes) => bytes,
        };

        let Some(msg) = Message::decode(&bytes)? else {
            trace!("keep-alive from {}", self.peer);
            return Ok(Flow::Continue);
        };

        match msg {
            Message::Choke => {
                info!("{} choked us, disconnecting", self.peer);
                return Ok(Flow::Close);
            }
            Message::Unchoke => {
                self.queue.choked = false;
                self.transition(ConnectionState::Requesting);
                self.request_next().await?;
            }
            Message::Have(index) => {
                let was_empty = self.queue.is_empty();
                self.queue.push_piece(index);
                if was_empty {
                    self.request_next().await?;
                }
            }
            Message::Bitfield(bitfield) => {
                let was_empty = self.queue.is_empty();
                self.queue.push_bitfield(&bitfield);
                if was_empty {
                    self.request_next().await?;
                }
            }
            Message::Piece {
                index,
                begin,
                block,
            } => {
                return self.on_piece(index, begin, block).await;
            }
            other => trace!("ignoring {:?} from {}", other.id(), self.peer),
        }
        Ok(Flow::Continue)
    }

    async fn on_piece(
        &mut self,
        index: u32,
        begin: u32,
        data:  Vec<u8>,
    ) -> Result<Flow, ApplicationError> {
        self.ctx.events.on_data_transfer(&self.peer);

        let block = Block::new(index, begin, data.len() as u32);
        let done = {
            let mut pieces = self.ctx.pieces.lock().await;
            if !pieces.add_received(&block) {
                warn!("{} sent a misaligned or out-of-range block: {:?}", self.peer, block);
                return Ok(Flow::Continue);
            }
            let (have, total) = pieces.progress();
            trace!("block {}/{} from {}", have, total, self.peer);
            pieces.is_done()
        };

        self.ctx
            .sink
            .write(self.ctx.layout.file_offset(index, begin), data)?;

        if done {
            return Ok(Flow::Complete);
        }
        self.request_next().await?;
        Ok(Flow::Continue)
    }

    /// Issues a request for the first queued block nobody else holds.
    async fn request_next(&mut self) -> Result<(), ApplicationError> {
        if self.queue.choked {
            return Ok(());
        }

        let next = {
            let mut pieces = self.ctx.pieces.lock().await;
            let mut next = None;
            while let Some(block) = self.queue.pop() {
                if pieces.needed(&block) {
                    pieces.add_requested(&block);
                    next = Some(block);
                    break;
                }
            }
            next
        };

        if let Some(block) = next {
            trace!("requesting {:?} from {}", block, self.peer);
            self.send(Message::Request {
                index:  block.index,
                begin:  block.begin,
                length: block.length,
            })
            .await?;
        }
        Ok(())
    }

    async fn send(&mut self, msg: Message) -> Result<(), ApplicationError> {
        self.send_raw(&msg.encode()).await
    }

    async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), ApplicationError> {
        self.writer
            .write_all(bytes)
            .await
            .map_err(|e| ApplicationError::PeerError(e.to_string()))?;

        self.writer
            .flush()
            .await
            .map_err(|e| ApplicationError::PeerError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, DuplexStream};

    const INFO_HASH: [u8; 20] = [7u8; 20];

    #[derive(Default)]
    struct Recorder {
        data:     AtomicUsize,
        complete: AtomicUsize,
    }

    impl SwarmEvents for Recorder {
        fn on_data_transfer(&self, _peer: &Peer) {
            self.data.fetch_add(1, Ordering::SeqCst);
        }
        fn on_peer_disconnected(&self, _peer: &Peer) {}
        fn on_complete(&self) {
            self.complete.fetch_add(1, Ordering::SeqCst);
        }
    }

    // 2 pieces of 2 blocks, 8-byte blocks
    fn layout() -> Layout {
        Layout {
            info_hash:    INFO_HASH,
            piece_length: 16,
            total_length: 32,
            piece_count:  2,
            block_length: 8,
        }
    }

    async fn context(temp: &TempDir, events: Arc<Recorder>) -> SwarmContext {
        let layout = Arc::new(layout());
        SwarmContext {
            pieces: Arc::new(Mutex::new(PieceManager::new(&layout))),
            layout,
            peer_id: *b"-RU0001-123456789010",
            sink: Arc::new(StorageSink::open(temp.path().join("out.bin")).await.unwrap()),
            events,
        }
    }

    fn peer() -> Peer {
        Peer {
            ip:   "127.0.0.1".parse().unwrap(),
            port: 6881,
        }
    }

    async fn expect(remote: &mut DuplexStream, msg: Message) {
        let expected = msg.encode();
        let mut buf = vec![0u8; expected.len()];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, expected);
    }

    async fn send(remote: &mut DuplexStream, msg: Message) {
        remote.write_all(&msg.encode()).await.unwrap();
    }

    async fn greet(remote: &mut DuplexStream) {
        let mut hs = [0u8; 68];
        remote.read_exact(&mut hs).await.unwrap();
        assert_eq!(Handshake::decode(&hs).unwrap().info_hash, INFO_HASH);
        remote
            .write_all(&Handshake::new(INFO_HASH, [9u8; 20]).encode())
            .await
            .unwrap();
        expect(remote, Message::Interested).await;
    }

    fn request(index: u32, begin: u32) -> Message {
        Message::Request {
            index,
            begin,
            length: 8,
        }
    }

    #[tokio::test]
    async fn downloads_all_blocks_one_request_at_a_time() {
        let temp = TempDir::new().unwrap();
        let events = Arc::new(Recorder::default());
        let ctx = context(&temp, events.clone()).await;
        let pieces = ctx.pieces.clone();
        let sink = ctx.sink.clone();

        let (local, mut remote) = tokio::io::duplex(4096);
        let task = tokio::spawn(PeerConnection::new(peer(), local, ctx).run());

        greet(&mut remote).await;
        send(&mut remote, Message::Unchoke).await;
        send(&mut remote, Message::Bitfield(vec![0b1100_0000])).await;

        let order = [(0, 0), (0, 8), (1, 0), (1, 8)];
        for (i, (index, begin)) in order.iter().enumerate() {
            expect(&mut remote, request(*index, *begin)).await;
            send(
                &mut remote,
                Message::Piece {
                    index: *index,
                    begin: *begin,
                    block: vec![i as u8 + 1; 8],
                },
            )
            .await;
        }

        // nothing else is requested and the connection closes
        let mut rest = Vec::new();
        remote.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        task.await.unwrap().unwrap();
        assert!(pieces.lock().await.is_done());
        assert_eq!(events.complete.load(Ordering::SeqCst), 1);
        assert_eq!(events.data.load(Ordering::SeqCst), 4);

        sink.close().await.unwrap();
        let data = tokio::fs::read(temp.path().join("out.bin")).await.unwrap();
        let expected: Vec<u8> = (1..=4u8).flat_map(|b| [b; 8]).collect();
        assert_eq!(data, expected);
    }

    #[tokio::test]
    async fn choke_closes_the_connection() {
        let temp = TempDir::new().unwrap();
        let events = Arc::new(Recorder::default());
        let ctx = context(&temp, events.clone()).await;

        let (local, mut remote) = tokio::io::duplex(4096);
        let task = tokio::spawn(PeerConnection::new(peer(), local, ctx).run());

        greet(&mut remote).await;
        send(&mut remote, Message::Choke).await;

        let mut rest = Vec::new();
        remote.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        task.await.unwrap().unwrap();
        assert_eq!(events.complete.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn no_request_while_choked() {
        let temp = TempDir::new().unwrap();
        let events = Arc::new(Recorder::default());
        let ctx = context(&temp, events).await;
        let pieces = ctx.pieces.clone();

        let (local, mut remote) = tokio::io::duplex(4096);
        let task = tokio::spawn(PeerConnection::new(peer(), local, ctx).run());

        greet(&mut remote).await;
        send(&mut remote, Message::Have(1)).await;
        send(&mut remote, Message::Unchoke).await;
        expect(&mut remote, request(1, 0)).await;

        drop(remote);
        let _ = task.await.unwrap();
        assert!(!pieces.lock().await.needed(&Block::new(1, 0, 8)));
    }

    #[tokio::test]
    async fn skips_blocks_leased_elsewhere() {
        let temp = TempDir::new().unwrap();
        let events = Arc::new(Recorder::default());
        let ctx = context(&temp, events).await;
        ctx.pieces.lock().await.add_requested(&Block::new(0, 0, 8));

        let (local, mut remote) = tokio::io::duplex(4096);
        let task = tokio::spawn(PeerConnection::new(peer(), local, ctx).run());

        greet(&mut remote).await;
        send(&mut remote, Message::Unchoke).await;
        send(&mut remote, Message::Have(0)).await;
        expect(&mut remote, request(0, 8)).await;

        drop(remote);
        let _ = task.await.unwrap();
    }

    #[tokio::test]
    async fn misaligned_piece_is_not_recorded() {
        let temp = TempDir::new().unwrap();
        let events = Arc::new(Recorder::default());
        let ctx = context(&temp, events.clone()).await;
        let pieces = ctx.pieces.clone();

        let (local, mut remote) = tokio::io::duplex(4096);
        let task = tokio::spawn(PeerConnection::new(peer(), local, ctx).run());

        greet(&mut remote).await;
        send(&mut remote, Message::Unchoke).await;
        send(&mut remote, Message::Have(0)).await;
        expect(&mut remote, request(0, 0)).await;

        for begin in [3, 9] {
            send(
                &mut remote,
                Message::Piece {
                    index: 0,
                    begin,
                    block: vec![0xff],
                },
            )
            .await;
        }
        // the real block still moves the queue along
        send(
            &mut remote,
            Message::Piece {
                index: 0,
                begin: 0,
                block: vec![1; 8],
            },
        )
        .await;
        expect(&mut remote, request(0, 8)).await;

        drop(remote);
        let _ = task.await.unwrap();
        assert_eq!(events.data.load(Ordering::SeqCst), 3);
        assert_eq!(events.complete.load(Ordering::SeqCst), 0);
        assert_eq!(pieces.lock().await.progress(), (1, 4));
    }

    #[tokio::test]
    async fn rejects_garbage_handshake() {
        let temp = TempDir::new().unwrap();
        let events = Arc::new(Recorder::default());
        let ctx = context(&temp, events).await;

        let (local, mut remote) = tokio::io::duplex(4096);
        let task = tokio::spawn(PeerConnection::new(peer(), local, ctx).run());

        let mut hs = [0u8; 68];
        remote.read_exact(&mut hs).await.unwrap();
        let mut bogus = [0u8; 68];
        bogus[0] = 19;
        remote.write_all(&bogus).await.unwrap();

        assert!(task.await.unwrap().is_err());
    }
}
