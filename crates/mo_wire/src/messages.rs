use std::time::Duration;

use mo_types::{
    BaseRequest, CacheType, DeliveryRequest, DeliveryResponse, EntryId, EntryInfo, EntryRef,
    EntrySnapshot, NodeHandshake, NodeId, NodeStats, PuzzleRequest, SemanticId, TypedKey,
};

/// Kind of the one-off registration frame a worker sends after its magic,
/// announcing which node it belongs to.
const WORKER_REGISTRATION: u8 = 0;

/// Announces a worker connection's node id to the coordinator.
pub fn send_worker_registration(framed: &mut Framed, node_id: NodeId) -> Result<(), WireError> {
    framed.send(WORKER_REGISTRATION, &encode_body(&node_id))
}

/// Reads the registration frame off a fresh worker connection.
pub fn read_worker_registration(
    framed: &mut Framed,
    timeout: Duration,
) -> Result<NodeId, WireError> {
    let (kind, body) = framed.recv(timeout)?;
    if kind != WORKER_REGISTRATION {
        return Err(WireError::protocol(format!(
            "expected worker registration, got kind {kind}"
        )));
    }
    decode_body(&body)
}

use crate::codec::{decode_body, encode_body, WireDecode, WireEncode, WireReader};
use crate::{Framed, WireError};

/// Logs a payload prefix and produces the protocol error for an unknown kind.
fn unknown_kind(role: &str, kind: u8, body: &[u8]) -> WireError {
    let prefix_len = body.len().min(16);
    log::warn!(
        "unknown {role} message kind {kind}, body prefix {:02x?}",
        &body[..prefix_len]
    );
    WireError::protocol(format!("unknown {role} message kind {kind}"))
}

// --- Reorg payloads ---

/// One entry the coordinator wants pulled over from another node.
#[derive(Clone, Debug, PartialEq)]
pub struct MoveItem {
    pub cache_type: CacheType,
    pub semantic_id: SemanticId,
    pub entry_id: EntryId,
    pub source_node: NodeId,
    pub source_host: String,
    pub source_port: u16,
}

impl MoveItem {
    pub fn typed_key(&self) -> TypedKey {
        TypedKey::new(self.cache_type, self.semantic_id.clone(), self.entry_id)
    }
}

impl WireEncode for MoveItem {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.cache_type.encode(buf);
        self.semantic_id.encode(buf);
        self.entry_id.encode(buf);
        self.source_node.encode(buf);
        self.source_host.encode(buf);
        u32::from(self.source_port).encode(buf);
    }
}

impl WireDecode for MoveItem {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let cache_type = CacheType::decode(r)?;
        let semantic_id = SemanticId::decode(r)?;
        let entry_id = EntryId::decode(r)?;
        let source_node = NodeId::decode(r)?;
        let source_host = r.string()?;
        let port = r.u32()?;
        let source_port = u16::try_from(port)
            .map_err(|_| WireError::protocol(format!("port {port} out of range")))?;
        Ok(Self {
            cache_type,
            semantic_id,
            entry_id,
            source_node,
            source_host,
            source_port,
        })
    }
}

/// Everything one node has to do for a reorg pass.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReorgTask {
    pub removals: Vec<TypedKey>,
    pub moves: Vec<MoveItem>,
}

impl ReorgTask {
    pub fn is_empty(&self) -> bool {
        self.removals.is_empty() && self.moves.is_empty()
    }
}

impl WireEncode for ReorgTask {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.removals.encode(buf);
        self.moves.encode(buf);
    }
}

impl WireDecode for ReorgTask {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            removals: r.vec()?,
            moves: r.vec()?,
        })
    }
}

/// A destination node reporting a completed copy of a moved entry.
#[derive(Clone, Debug, PartialEq)]
pub struct MoveResult {
    pub cache_type: CacheType,
    pub semantic_id: SemanticId,
    pub old: EntryRef,
    pub new: EntryRef,
}

impl WireEncode for MoveResult {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.cache_type.encode(buf);
        self.semantic_id.encode(buf);
        self.old.encode(buf);
        self.new.encode(buf);
    }
}

impl WireDecode for MoveResult {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            cache_type: CacheType::decode(r)?,
            semantic_id: SemanticId::decode(r)?,
            old: EntryRef::decode(r)?,
            new: EntryRef::decode(r)?,
        })
    }
}

// --- Control connection (coordinator ↔ node) ---

#[derive(Clone, Debug, PartialEq)]
pub enum ControlMsg {
    /// node → coordinator, first message after the magic.
    Hello(NodeHandshake),
    /// coordinator → node: assigned id and the host the coordinator observed.
    Welcome { node_id: NodeId, host: String },
    /// coordinator → node.
    Reorg(ReorgTask),
    /// node → coordinator.
    ReorgDone,
    /// node → coordinator, once per completed move.
    Moved(MoveResult),
    /// coordinator → node: index updated, the source copy may go.
    MoveOk,
    /// coordinator → node.
    StatsRequest,
    /// node → coordinator.
    Stats(NodeStats),
    /// node → coordinator: draining, no new jobs please.
    Bye,
}

impl ControlMsg {
    const HELLO: u8 = 1;
    const WELCOME: u8 = 2;
    const REORG: u8 = 3;
    const REORG_DONE: u8 = 4;
    const MOVED: u8 = 5;
    const MOVE_OK: u8 = 6;
    const STATS_REQUEST: u8 = 7;
    const STATS: u8 = 8;
    const BYE: u8 = 9;

    pub fn send(&self, framed: &mut Framed) -> Result<(), WireError> {
        let (kind, body) = match self {
            Self::Hello(handshake) => (Self::HELLO, encode_body(handshake)),
            Self::Welcome { node_id, host } => {
                let mut buf = Vec::new();
                node_id.encode(&mut buf);
                host.encode(&mut buf);
                (Self::WELCOME, buf)
            }
            Self::Reorg(task) => (Self::REORG, encode_body(task)),
            Self::ReorgDone => (Self::REORG_DONE, Vec::new()),
            Self::Moved(result) => (Self::MOVED, encode_body(result)),
            Self::MoveOk => (Self::MOVE_OK, Vec::new()),
            Self::StatsRequest => (Self::STATS_REQUEST, Vec::new()),
            Self::Stats(stats) => (Self::STATS, encode_body(stats)),
            Self::Bye => (Self::BYE, Vec::new()),
        };
        framed.send(kind, &body)
    }

    pub fn recv(framed: &mut Framed, timeout: Duration) -> Result<Self, WireError> {
        let (kind, body) = framed.recv(timeout)?;
        match kind {
            Self::HELLO => Ok(Self::Hello(decode_body(&body)?)),
            Self::WELCOME => {
                let mut r = WireReader::new(&body);
                let node_id = NodeId::decode(&mut r)?;
                let host = r.string()?;
                r.expect_end()?;
                Ok(Self::Welcome { node_id, host })
            }
            Self::REORG => Ok(Self::Reorg(decode_body(&body)?)),
            Self::REORG_DONE => Ok(Self::ReorgDone),
            Self::MOVED => Ok(Self::Moved(decode_body(&body)?)),
            Self::MOVE_OK => Ok(Self::MoveOk),
            Self::STATS_REQUEST => Ok(Self::StatsRequest),
            Self::STATS => Ok(Self::Stats(decode_body(&body)?)),
            Self::BYE => Ok(Self::Bye),
            _ => Err(unknown_kind("control", kind, &body)),
        }
    }
}

// --- Worker connection (coordinator ↔ worker thread on a node) ---

#[derive(Clone, Debug, PartialEq)]
pub enum WorkerMsg {
    /// coordinator → worker: produce from scratch.
    Create(BaseRequest),
    /// coordinator → worker: assemble from pieces.
    Puzzle(PuzzleRequest),
    /// coordinator → worker: stream a stored entry.
    Deliver(DeliveryRequest),
    /// worker → coordinator: result computed, how many consumers?
    ///
    /// Carries the entries the worker cached while processing the job so the
    /// coordinator can index them immediately.
    ResultReady(Vec<EntrySnapshot>),
    /// coordinator → worker: number of waiting clients.
    DeliveryQty(u32),
    /// worker → coordinator: delivery reserved under this id (0 = none).
    DeliveryReady(u64),
    /// worker → coordinator: the job failed.
    Error(String),
}

impl WorkerMsg {
    const CREATE: u8 = 1;
    const PUZZLE: u8 = 2;
    const DELIVER: u8 = 3;
    const RESULT_READY: u8 = 4;
    const DELIVERY_QTY: u8 = 5;
    const DELIVERY_READY: u8 = 6;
    const ERROR: u8 = 7;

    pub fn send(&self, framed: &mut Framed) -> Result<(), WireError> {
        let (kind, body) = match self {
            Self::Create(request) => (Self::CREATE, encode_body(request)),
            Self::Puzzle(request) => (Self::PUZZLE, encode_body(request)),
            Self::Deliver(request) => (Self::DELIVER, encode_body(request)),
            Self::ResultReady(entries) => (Self::RESULT_READY, encode_body(entries)),
            Self::DeliveryQty(qty) => (Self::DELIVERY_QTY, encode_body(qty)),
            Self::DeliveryReady(id) => (Self::DELIVERY_READY, encode_body(id)),
            Self::Error(msg) => (Self::ERROR, encode_body(msg)),
        };
        framed.send(kind, &body)
    }

    pub fn recv(framed: &mut Framed, timeout: Duration) -> Result<Self, WireError> {
        let (kind, body) = framed.recv(timeout)?;
        match kind {
            Self::CREATE => Ok(Self::Create(decode_body(&body)?)),
            Self::PUZZLE => Ok(Self::Puzzle(decode_body(&body)?)),
            Self::DELIVER => Ok(Self::Deliver(decode_body(&body)?)),
            Self::RESULT_READY => Ok(Self::ResultReady(decode_body(&body)?)),
            Self::DELIVERY_QTY => Ok(Self::DeliveryQty(decode_body(&body)?)),
            Self::DELIVERY_READY => Ok(Self::DeliveryReady(decode_body(&body)?)),
            Self::ERROR => Ok(Self::Error(decode_body(&body)?)),
            _ => Err(unknown_kind("worker", kind, &body)),
        }
    }
}

// --- Delivery connection (anyone → a node's delivery service) ---

#[derive(Clone, Debug, PartialEq)]
pub enum DeliveryMsg {
    /// Stream a previously reserved delivery.
    Get(u64),
    /// Stream a cache entry (peer puzzling with our pieces).
    GetCached(TypedKey),
    /// Stream entry payload + metadata for a reorg move.
    MoveItem(TypedKey),
    /// Payload response to `Get`/`GetCached`.
    Payload(Vec<u8>),
    /// Response to `MoveItem`: metadata, then the payload bytes.
    MovePayload { info: EntryInfo, payload: Vec<u8> },
    /// The move is confirmed; the source may drop its copy.
    MoveDone,
    Error(String),
}

impl DeliveryMsg {
    const GET: u8 = 1;
    const GET_CACHED: u8 = 2;
    const MOVE_ITEM: u8 = 3;
    const PAYLOAD: u8 = 4;
    const MOVE_PAYLOAD: u8 = 5;
    const MOVE_DONE: u8 = 6;
    const ERROR: u8 = 7;

    pub fn send(&self, framed: &mut Framed) -> Result<(), WireError> {
        let (kind, body) = match self {
            Self::Get(id) => (Self::GET, encode_body(id)),
            Self::GetCached(key) => (Self::GET_CACHED, encode_body(key)),
            Self::MoveItem(key) => (Self::MOVE_ITEM, encode_body(key)),
            Self::Payload(payload) => (Self::PAYLOAD, payload.clone()),
            Self::MovePayload { info, payload } => {
                let mut buf = encode_body(info);
                buf.extend_from_slice(payload);
                (Self::MOVE_PAYLOAD, buf)
            }
            Self::MoveDone => (Self::MOVE_DONE, Vec::new()),
            Self::Error(msg) => (Self::ERROR, encode_body(msg)),
        };
        framed.send(kind, &body)
    }

    pub fn recv(framed: &mut Framed, timeout: Duration) -> Result<Self, WireError> {
        let (kind, body) = framed.recv(timeout)?;
        match kind {
            Self::GET => Ok(Self::Get(decode_body(&body)?)),
            Self::GET_CACHED => Ok(Self::GetCached(decode_body(&body)?)),
            Self::MOVE_ITEM => Ok(Self::MoveItem(decode_body(&body)?)),
            Self::PAYLOAD => Ok(Self::Payload(body)),
            Self::MOVE_PAYLOAD => {
                let mut r = WireReader::new(&body);
                let info = EntryInfo::decode(&mut r)?;
                let payload = r.rest().to_vec();
                Ok(Self::MovePayload { info, payload })
            }
            Self::MOVE_DONE => Ok(Self::MoveDone),
            Self::ERROR => Ok(Self::Error(decode_body(&body)?)),
            _ => Err(unknown_kind("delivery", kind, &body)),
        }
    }
}

// --- Client connection (user ↔ coordinator) ---

#[derive(Clone, Debug, PartialEq)]
pub enum ClientMsg {
    Query(BaseRequest),
    Delivery(DeliveryResponse),
    Error(String),
}

impl ClientMsg {
    const QUERY: u8 = 1;
    const DELIVERY: u8 = 2;
    const ERROR: u8 = 3;

    pub fn send(&self, framed: &mut Framed) -> Result<(), WireError> {
        let (kind, body) = match self {
            Self::Query(request) => (Self::QUERY, encode_body(request)),
            Self::Delivery(response) => (Self::DELIVERY, encode_body(response)),
            Self::Error(msg) => (Self::ERROR, encode_body(msg)),
        };
        framed.send(kind, &body)
    }

    pub fn recv(framed: &mut Framed, timeout: Duration) -> Result<Self, WireError> {
        let (kind, body) = framed.recv(timeout)?;
        match kind {
            Self::QUERY => Ok(Self::Query(decode_body(&body)?)),
            Self::DELIVERY => Ok(Self::Delivery(decode_body(&body)?)),
            Self::ERROR => Ok(Self::Error(decode_body(&body)?)),
            _ => Err(unknown_kind("client", kind, &body)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MAGIC_CONTROL;
    use mo_cube::{BoundsCube, CacheCube, Cube3, QueryRect, Resolution, ResolutionInfo, Srs,
        TimeKind};
    use mo_types::{AccessStats, CostProfile};
    use std::net::TcpListener;

    fn sample_request() -> BaseRequest {
        BaseRequest::new(
            CacheType::Raster,
            SemanticId::from("op/a"),
            QueryRect::new(
                BoundsCube::new(
                    Cube3::from_ranges(0.0, 10.0, 0.0, 10.0, 0.0, 1.0),
                    Srs::LatLon,
                    TimeKind::Unix,
                ),
                Resolution::Pixels {
                    width: 256,
                    height: 256,
                },
            ),
        )
    }

    /// Pushes each message through a real socket pair and back.
    fn socket_round_trip<M, S, R>(messages: Vec<M>, send: S, recv: R)
    where
        M: PartialEq + std::fmt::Debug + Clone + Send + 'static,
        S: Fn(&M, &mut Framed) -> Result<(), WireError>,
        R: Fn(&mut Framed) -> Result<M, WireError> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let expected = messages.clone();

        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            let mut framed = Framed::from_stream(stream);
            framed
                .read_magic(std::time::Duration::from_secs(5))
                .expect("magic");
            for want in &expected {
                let got = recv(&mut framed).expect("recv");
                assert_eq!(&got, want);
            }
        });

        let mut framed = Framed::connect(addr, MAGIC_CONTROL).expect("connect");
        for msg in &messages {
            send(msg, &mut framed).expect("send");
        }
        server.join().expect("join");
    }

    #[test]
    fn control_messages_round_trip() {
        let timeout = std::time::Duration::from_secs(5);
        socket_round_trip(
            vec![
                ControlMsg::Hello(NodeHandshake {
                    delivery_port: 10410,
                    capacities: vec![(CacheType::Raster, 1 << 20)],
                    entries: vec![],
                }),
                ControlMsg::Welcome {
                    node_id: NodeId(4),
                    host: "10.0.0.4".into(),
                },
                ControlMsg::Reorg(ReorgTask {
                    removals: vec![TypedKey::new(
                        CacheType::Plot,
                        SemanticId::from("op/x"),
                        EntryId(9),
                    )],
                    moves: vec![MoveItem {
                        cache_type: CacheType::Raster,
                        semantic_id: SemanticId::from("op/y"),
                        entry_id: EntryId(3),
                        source_node: NodeId(1),
                        source_host: "cache-1".into(),
                        source_port: 10411,
                    }],
                }),
                ControlMsg::ReorgDone,
                ControlMsg::Moved(MoveResult {
                    cache_type: CacheType::Raster,
                    semantic_id: SemanticId::from("op/y"),
                    old: EntryRef::new(NodeId(1), EntryId(3)),
                    new: EntryRef::new(NodeId(2), EntryId(11)),
                }),
                ControlMsg::MoveOk,
                ControlMsg::StatsRequest,
                ControlMsg::Stats(NodeStats::default()),
                ControlMsg::Bye,
            ],
            |m, f| m.send(f),
            move |f| ControlMsg::recv(f, timeout),
        );
    }

    #[test]
    fn worker_messages_round_trip() {
        let timeout = std::time::Duration::from_secs(5);
        socket_round_trip(
            vec![
                WorkerMsg::Create(sample_request()),
                WorkerMsg::ResultReady(vec![]),
                WorkerMsg::DeliveryQty(3),
                WorkerMsg::DeliveryReady(77),
                WorkerMsg::Error("producer error: no such source".into()),
            ],
            |m, f| m.send(f),
            move |f| WorkerMsg::recv(f, timeout),
        );
    }

    #[test]
    fn delivery_messages_round_trip() {
        let timeout = std::time::Duration::from_secs(5);
        let info = EntryInfo {
            byte_size: 4,
            cube: CacheCube::new(
                BoundsCube::new(
                    Cube3::from_ranges(0.0, 1.0, 0.0, 1.0, 0.0, 1.0),
                    Srs::LatLon,
                    TimeKind::Unix,
                ),
                ResolutionInfo::None,
            ),
            cost: CostProfile::default(),
            access: AccessStats {
                last_access: 1,
                access_count: 1,
            },
        };
        socket_round_trip(
            vec![
                DeliveryMsg::Get(5),
                DeliveryMsg::GetCached(TypedKey::new(
                    CacheType::Raster,
                    SemanticId::from("op/a"),
                    EntryId(1),
                )),
                DeliveryMsg::Payload(vec![1, 2, 3, 4]),
                DeliveryMsg::MovePayload {
                    info,
                    payload: vec![9, 9, 9],
                },
                DeliveryMsg::MoveDone,
            ],
            |m, f| m.send(f),
            move |f| DeliveryMsg::recv(f, timeout),
        );
    }

    #[test]
    fn client_messages_round_trip() {
        let timeout = std::time::Duration::from_secs(5);
        socket_round_trip(
            vec![
                ClientMsg::Query(sample_request()),
                ClientMsg::Delivery(DeliveryResponse {
                    host: "cache-1".into(),
                    port: 10410,
                    delivery_id: 12,
                }),
                ClientMsg::Error("no nodes attached".into()),
            ],
            |m, f| m.send(f),
            move |f| ClientMsg::recv(f, timeout),
        );
    }
}
