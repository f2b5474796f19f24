use byteorder::{BigEndian, ByteOrder as _};

use mo_cube::{
    BoundsCube, CacheCube, Cube3, Interval, QueryRect, Resolution, ResolutionInfo, Srs, TimeKind,
};
use mo_types::{
    AccessStats, BaseRequest, CacheRef, CacheType, CostProfile, DeliveryRequest, DeliveryResponse,
    EntryAccessDelta, EntryId, EntryInfo, EntryRef, EntrySnapshot, NodeHandshake, NodeId,
    NodeStats, PuzzleRequest, QueryStats, SemanticId, StoreUsage, TypedKey,
};

use crate::WireError;

/// Strings and vectors refuse to decode beyond this many elements, so a
/// corrupt length prefix cannot ask for terabytes.
const MAX_SEQ_LEN: u64 = 16 * 1024 * 1024;

// --- Traits ---

/// Appends the big-endian wire form of a value to a buffer.
pub trait WireEncode {
    fn encode(&self, buf: &mut Vec<u8>);
}

/// Decodes a value from a frame body.
pub trait WireDecode: Sized {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError>;
}

/// A cursor over a fully received frame body.
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::protocol(format!(
                "body truncated: wanted {n} more bytes, have {}",
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn u32(&mut self) -> Result<u32, WireError> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    pub fn u64(&mut self) -> Result<u64, WireError> {
        Ok(BigEndian::read_u64(self.take(8)?))
    }

    pub fn f64(&mut self) -> Result<f64, WireError> {
        Ok(BigEndian::read_f64(self.take(8)?))
    }

    pub fn string(&mut self) -> Result<String, WireError> {
        let len = u64::from(self.u32()?);
        if len > MAX_SEQ_LEN {
            return Err(WireError::protocol(format!("string of {len} bytes refused")));
        }
        let bytes = self.take(len as usize)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| WireError::protocol("string is not valid utf-8"))
    }

    /// The rest of the body as raw bytes (used for payload frames).
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }

    /// Fails if the body has trailing bytes: every decoder must consume
    /// exactly what the encoder produced.
    pub fn expect_end(&self) -> Result<(), WireError> {
        if self.remaining() == 0 {
            Ok(())
        } else {
            Err(WireError::protocol(format!(
                "{} trailing bytes after message body",
                self.remaining()
            )))
        }
    }

    pub fn vec<T: WireDecode>(&mut self) -> Result<Vec<T>, WireError> {
        let count = self.u64()?;
        if count > MAX_SEQ_LEN {
            return Err(WireError::protocol(format!("vector of {count} items refused")));
        }
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            out.push(T::decode(self)?);
        }
        Ok(out)
    }
}

/// Decodes a complete body, rejecting trailing bytes.
pub fn decode_body<T: WireDecode>(body: &[u8]) -> Result<T, WireError> {
    let mut r = WireReader::new(body);
    let value = T::decode(&mut r)?;
    r.expect_end()?;
    Ok(value)
}

/// Encodes a value into a fresh body buffer.
pub fn encode_body<T: WireEncode>(value: &T) -> Vec<u8> {
    let mut buf = Vec::new();
    value.encode(&mut buf);
    buf
}

// --- Primitives ---

impl WireEncode for u8 {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(*self);
    }
}

impl WireDecode for u8 {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        r.u8()
    }
}

impl WireEncode for u32 {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.to_be_bytes());
    }
}

impl WireDecode for u32 {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        r.u32()
    }
}

impl WireEncode for u64 {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.to_be_bytes());
    }
}

impl WireDecode for u64 {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        r.u64()
    }
}

impl WireEncode for f64 {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.to_be_bytes());
    }
}

impl WireDecode for f64 {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        r.f64()
    }
}

impl WireEncode for str {
    fn encode(&self, buf: &mut Vec<u8>) {
        (self.len() as u32).encode(buf);
        buf.extend_from_slice(self.as_bytes());
    }
}

impl WireEncode for String {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.as_str().encode(buf);
    }
}

impl WireDecode for String {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        r.string()
    }
}

impl<T: WireEncode> WireEncode for [T] {
    fn encode(&self, buf: &mut Vec<u8>) {
        (self.len() as u64).encode(buf);
        for item in self {
            item.encode(buf);
        }
    }
}

impl<T: WireEncode> WireEncode for Vec<T> {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.as_slice().encode(buf);
    }
}

impl<T: WireDecode> WireDecode for Vec<T> {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        r.vec()
    }
}

impl<A: WireEncode, B: WireEncode> WireEncode for (A, B) {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.0.encode(buf);
        self.1.encode(buf);
    }
}

impl<A: WireDecode, B: WireDecode> WireDecode for (A, B) {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok((A::decode(r)?, B::decode(r)?))
    }
}

// --- Geometry ---

impl WireEncode for Interval {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.lo.encode(buf);
        self.hi.encode(buf);
    }
}

impl WireDecode for Interval {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self::new(r.f64()?, r.f64()?))
    }
}

impl WireEncode for Cube3 {
    fn encode(&self, buf: &mut Vec<u8>) {
        for dim in self.dims() {
            dim.encode(buf);
        }
    }
}

impl WireDecode for Cube3 {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self::new([
            Interval::decode(r)?,
            Interval::decode(r)?,
            Interval::decode(r)?,
        ]))
    }
}

impl WireEncode for BoundsCube {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.cube.encode(buf);
        self.srs.code().encode(buf);
        self.time_kind.tag().encode(buf);
    }
}

impl WireDecode for BoundsCube {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let cube = Cube3::decode(r)?;
        let srs = Srs::from_code(r.u32()?);
        let time_kind = TimeKind::from_tag(r.u8()?);
        Ok(Self::new(cube, srs, time_kind))
    }
}

impl WireEncode for Resolution {
    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Self::None => 0u8.encode(buf),
            Self::Pixels { width, height } => {
                1u8.encode(buf);
                width.encode(buf);
                height.encode(buf);
            }
        }
    }
}

impl WireDecode for Resolution {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        match r.u8()? {
            0 => Ok(Self::None),
            1 => Ok(Self::Pixels {
                width: r.u32()?,
                height: r.u32()?,
            }),
            tag => Err(WireError::protocol(format!("unknown resolution tag {tag}"))),
        }
    }
}

impl WireEncode for QueryRect {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.bounds.encode(buf);
        self.resolution.encode(buf);
    }
}

impl WireDecode for QueryRect {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self::new(BoundsCube::decode(r)?, Resolution::decode(r)?))
    }
}

impl WireEncode for ResolutionInfo {
    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Self::None => 0u8.encode(buf),
            Self::Pixels {
                valid_x,
                valid_y,
                actual_x,
                actual_y,
            } => {
                1u8.encode(buf);
                valid_x.encode(buf);
                valid_y.encode(buf);
                actual_x.encode(buf);
                actual_y.encode(buf);
            }
        }
    }
}

impl WireDecode for ResolutionInfo {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        match r.u8()? {
            0 => Ok(Self::None),
            1 => Ok(Self::Pixels {
                valid_x: Interval::decode(r)?,
                valid_y: Interval::decode(r)?,
                actual_x: r.f64()?,
                actual_y: r.f64()?,
            }),
            tag => Err(WireError::protocol(format!(
                "unknown resolution-info tag {tag}"
            ))),
        }
    }
}

impl WireEncode for CacheCube {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.bounds.encode(buf);
        self.resolution.encode(buf);
    }
}

impl WireDecode for CacheCube {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self::new(
            BoundsCube::decode(r)?,
            ResolutionInfo::decode(r)?,
        ))
    }
}

// --- Identifiers ---

impl WireEncode for CacheType {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.tag().encode(buf);
    }
}

impl WireDecode for CacheType {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let tag = r.u8()?;
        Self::from_tag(tag)
            .ok_or_else(|| WireError::protocol(format!("unknown cache-type tag {tag}")))
    }
}

impl WireEncode for SemanticId {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.as_str().encode(buf);
    }
}

impl WireDecode for SemanticId {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self::from(r.string()?))
    }
}

impl WireEncode for NodeId {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.0.encode(buf);
    }
}

impl WireDecode for NodeId {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self(r.u32()?))
    }
}

impl WireEncode for EntryId {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.0.encode(buf);
    }
}

impl WireDecode for EntryId {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self(r.u64()?))
    }
}

impl WireEncode for EntryRef {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.node.encode(buf);
        self.entry.encode(buf);
    }
}

impl WireDecode for EntryRef {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self::new(NodeId::decode(r)?, EntryId::decode(r)?))
    }
}

impl WireEncode for TypedKey {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.cache_type.encode(buf);
        self.semantic_id.encode(buf);
        self.entry_id.encode(buf);
    }
}

impl WireDecode for TypedKey {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self::new(
            CacheType::decode(r)?,
            SemanticId::decode(r)?,
            EntryId::decode(r)?,
        ))
    }
}

// --- Entry metadata & stats ---

impl WireEncode for AccessStats {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.last_access.encode(buf);
        self.access_count.encode(buf);
    }
}

impl WireDecode for AccessStats {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            last_access: r.u64()?,
            access_count: r.u32()?,
        })
    }
}

impl WireEncode for CostProfile {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.self_cpu.encode(buf);
        self.all_cpu.encode(buf);
        self.uncached_cpu.encode(buf);
        self.self_gpu.encode(buf);
        self.all_gpu.encode(buf);
        self.uncached_gpu.encode(buf);
        self.self_io.encode(buf);
        self.all_io.encode(buf);
        self.uncached_io.encode(buf);
    }
}

impl WireDecode for CostProfile {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            self_cpu: r.f64()?,
            all_cpu: r.f64()?,
            uncached_cpu: r.f64()?,
            self_gpu: r.f64()?,
            all_gpu: r.f64()?,
            uncached_gpu: r.f64()?,
            self_io: r.u64()?,
            all_io: r.u64()?,
            uncached_io: r.u64()?,
        })
    }
}

impl WireEncode for EntryInfo {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.byte_size.encode(buf);
        self.cube.encode(buf);
        self.cost.encode(buf);
        self.access.encode(buf);
    }
}

impl WireDecode for EntryInfo {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            byte_size: r.u64()?,
            cube: CacheCube::decode(r)?,
            cost: CostProfile::decode(r)?,
            access: AccessStats::decode(r)?,
        })
    }
}

impl WireEncode for EntrySnapshot {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.cache_type.encode(buf);
        self.semantic_id.encode(buf);
        self.entry_id.encode(buf);
        self.info.encode(buf);
    }
}

impl WireDecode for EntrySnapshot {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            cache_type: CacheType::decode(r)?,
            semantic_id: SemanticId::decode(r)?,
            entry_id: EntryId::decode(r)?,
            info: EntryInfo::decode(r)?,
        })
    }
}

impl WireEncode for StoreUsage {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.used.encode(buf);
        self.capacity.encode(buf);
    }
}

impl WireDecode for StoreUsage {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            used: r.u64()?,
            capacity: r.u64()?,
        })
    }
}

impl WireEncode for QueryStats {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.single_hits.encode(buf);
        self.multi_hits.encode(buf);
        self.partials.encode(buf);
        self.misses.encode(buf);
        self.result_bytes.encode(buf);
    }
}

impl WireDecode for QueryStats {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            single_hits: r.u32()?,
            multi_hits: r.u32()?,
            partials: r.u32()?,
            misses: r.u32()?,
            result_bytes: r.u64()?,
        })
    }
}

impl WireEncode for EntryAccessDelta {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.cache_type.encode(buf);
        self.semantic_id.encode(buf);
        self.entry_id.encode(buf);
        self.last_access.encode(buf);
        self.access_count.encode(buf);
    }
}

impl WireDecode for EntryAccessDelta {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            cache_type: CacheType::decode(r)?,
            semantic_id: SemanticId::decode(r)?,
            entry_id: EntryId::decode(r)?,
            last_access: r.u64()?,
            access_count: r.u32()?,
        })
    }
}

impl WireEncode for NodeStats {
    fn encode(&self, buf: &mut Vec<u8>) {
        (self.usage.len() as u64).encode(buf);
        for (cache_type, usage) in &self.usage {
            cache_type.encode(buf);
            usage.encode(buf);
        }
        self.query.encode(buf);
        self.access.encode(buf);
        self.removed.encode(buf);
    }
}

impl WireDecode for NodeStats {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let usage_len = r.u64()?;
        if usage_len > 64 {
            return Err(WireError::protocol("implausible store-usage count"));
        }
        let mut usage = Vec::with_capacity(usage_len as usize);
        for _ in 0..usage_len {
            usage.push((CacheType::decode(r)?, StoreUsage::decode(r)?));
        }
        Ok(Self {
            usage,
            query: QueryStats::decode(r)?,
            access: r.vec()?,
            removed: r.vec()?,
        })
    }
}

impl WireEncode for NodeHandshake {
    fn encode(&self, buf: &mut Vec<u8>) {
        u32::from(self.delivery_port).encode(buf);
        (self.capacities.len() as u64).encode(buf);
        for (cache_type, capacity) in &self.capacities {
            cache_type.encode(buf);
            capacity.encode(buf);
        }
        self.entries.encode(buf);
    }
}

impl WireDecode for NodeHandshake {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let port = r.u32()?;
        let delivery_port = u16::try_from(port)
            .map_err(|_| WireError::protocol(format!("delivery port {port} out of range")))?;
        let cap_len = r.u64()?;
        if cap_len > 64 {
            return Err(WireError::protocol("implausible capacity count"));
        }
        let mut capacities = Vec::with_capacity(cap_len as usize);
        for _ in 0..cap_len {
            capacities.push((CacheType::decode(r)?, r.u64()?));
        }
        Ok(Self {
            delivery_port,
            capacities,
            entries: r.vec()?,
        })
    }
}

// --- Requests & responses ---

impl WireEncode for BaseRequest {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.cache_type.encode(buf);
        self.semantic_id.encode(buf);
        self.rect.encode(buf);
    }
}

impl WireDecode for BaseRequest {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self::new(
            CacheType::decode(r)?,
            SemanticId::decode(r)?,
            QueryRect::decode(r)?,
        ))
    }
}

impl WireEncode for CacheRef {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.node_id.encode(buf);
        self.host.encode(buf);
        u32::from(self.port).encode(buf);
        self.entry_id.encode(buf);
        self.bounds.encode(buf);
    }
}

impl WireDecode for CacheRef {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let node_id = NodeId::decode(r)?;
        let host = r.string()?;
        let port = r.u32()?;
        let port = u16::try_from(port)
            .map_err(|_| WireError::protocol(format!("port {port} out of range")))?;
        Ok(Self {
            node_id,
            host,
            port,
            entry_id: EntryId::decode(r)?,
            bounds: CacheCube::decode(r)?,
        })
    }
}

impl WireEncode for PuzzleRequest {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.base.encode(buf);
        self.parts.encode(buf);
        self.remainders.encode(buf);
    }
}

impl WireDecode for PuzzleRequest {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            base: BaseRequest::decode(r)?,
            parts: r.vec()?,
            remainders: r.vec()?,
        })
    }
}

impl WireEncode for DeliveryRequest {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.cache_type.encode(buf);
        self.semantic_id.encode(buf);
        self.entry_id.encode(buf);
    }
}

impl WireDecode for DeliveryRequest {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            cache_type: CacheType::decode(r)?,
            semantic_id: SemanticId::decode(r)?,
            entry_id: EntryId::decode(r)?,
        })
    }
}

impl WireEncode for DeliveryResponse {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.host.encode(buf);
        u32::from(self.port).encode(buf);
        self.delivery_id.encode(buf);
    }
}

impl WireDecode for DeliveryResponse {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let host = r.string()?;
        let port = r.u32()?;
        let port = u16::try_from(port)
            .map_err(|_| WireError::protocol(format!("port {port} out of range")))?;
        Ok(Self {
            host,
            port,
            delivery_id: r.u64()?,
        })
    }
}
