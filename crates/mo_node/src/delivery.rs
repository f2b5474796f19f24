use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::HashMap;
use parking_lot::Mutex;

use mo_types::TypedKey;
use mo_wire::{DeliveryMsg, Framed, WireError, DELIVERY_TIMEOUT, MAGIC_DELIVERY};

use crate::manager::local_key;
use crate::NodeManager;

/// A reserved payload waiting to be picked up.
struct Delivery {
    payload: Arc<[u8]>,
    remaining: u32,
    deadline: Instant,
}

/// Consumer-counted payload reservations of one node.
pub struct DeliveryPool {
    ttl: Duration,
    inner: Mutex<PoolInner>,
}

#[derive(Default)]
struct PoolInner {
    next_id: u64,
    deliveries: HashMap<u64, Delivery>,
}

impl DeliveryPool {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(PoolInner {
                next_id: 1,
                ..Default::default()
            }),
        }
    }

    /// Reserves `payload` for `consumers` pickups; never called with zero.
    pub fn add(&self, payload: Arc<[u8]>, consumers: u32) -> u64 {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.deliveries.insert(
            id,
            Delivery {
                payload,
                remaining: consumers,
                deadline: Instant::now() + self.ttl,
            },
        );
        id
    }

    /// Takes one consumption; the reservation dies when the count hits zero.
    pub fn fetch(&self, id: u64) -> Option<Arc<[u8]>> {
        let mut inner = self.inner.lock();
        let delivery = inner.deliveries.get_mut(&id)?;
        let payload = delivery.payload.clone();
        delivery.remaining = delivery.remaining.saturating_sub(1);
        if delivery.remaining == 0 {
            inner.deliveries.remove(&id);
        }
        Some(payload)
    }

    /// Drops reservations past their deadline.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.deliveries.retain(|id, d| {
            if d.deadline <= now {
                log::debug!("delivery {id}: expired with {} pickups left", d.remaining);
                false
            } else {
                true
            }
        });
    }

    pub fn len(&self) -> usize {
        self.inner.lock().deliveries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().deliveries.is_empty()
    }
}

/// Accept loop of the delivery service; one short-lived thread per peer.
pub(crate) fn acceptor_loop(
    listener: TcpListener,
    manager: Arc<NodeManager>,
    pool: Arc<DeliveryPool>,
    stop: Arc<AtomicBool>,
) {
    if let Err(e) = listener.set_nonblocking(true) {
        log::error!("delivery listener unusable: {e}");
        return;
    }
    while !stop.load(Ordering::Relaxed) {
        pool.purge_expired();
        match listener.accept() {
            Ok((stream, peer)) => {
                let manager = manager.clone();
                let pool = pool.clone();
                std::thread::Builder::new()
                    .name(format!("delivery-{peer}"))
                    .spawn(move || {
                        if let Err(e) = serve_peer(stream, &manager, &pool) {
                            match e {
                                WireError::Disconnected | WireError::Timeout => {}
                                other => log::warn!("delivery to {peer} failed: {other}"),
                            }
                        }
                    })
                    .ok();
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(e) => {
                log::error!("delivery accept failed: {e}");
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn serve_peer(
    stream: TcpStream,
    manager: &NodeManager,
    pool: &DeliveryPool,
) -> Result<(), WireError> {
    let mut framed = Framed::from_stream(stream);
    let magic = framed.read_magic(DELIVERY_TIMEOUT)?;
    if magic != MAGIC_DELIVERY {
        return Err(WireError::protocol(format!(
            "delivery service got magic {magic:?}"
        )));
    }

    loop {
        match DeliveryMsg::recv(&mut framed, DELIVERY_TIMEOUT) {
            Ok(DeliveryMsg::Get(id)) => match pool.fetch(id) {
                Some(payload) => {
                    DeliveryMsg::Payload(payload.to_vec()).send(&mut framed)?;
                }
                None => {
                    DeliveryMsg::Error(format!("unknown or expired delivery {id}"))
                        .send(&mut framed)?;
                }
            },
            Ok(DeliveryMsg::GetCached(key)) => {
                let store = manager.store(key.cache_type);
                match store.get(&key.cache_key()) {
                    Ok(entry) => {
                        store.note_result_bytes(entry.payload.len() as u64);
                        DeliveryMsg::Payload(entry.payload.to_vec()).send(&mut framed)?;
                    }
                    Err(e) => {
                        log::debug!("delivery: {e}");
                        DeliveryMsg::Error(e.to_string()).send(&mut framed)?;
                    }
                }
            }
            Ok(DeliveryMsg::MoveItem(key)) => {
                serve_move(&mut framed, manager, key)?;
            }
            Ok(other) => {
                return Err(WireError::protocol(format!(
                    "unexpected delivery request {other:?}"
                )));
            }
            // Idle peers are closed; delivery connections are short-lived.
            Err(WireError::Timeout) => return Ok(()),
            Err(WireError::Disconnected) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

/// The source side of a reorg move: stream payload plus metadata, then hold
/// the entry until the destination confirms with `MOVE_DONE`.
fn serve_move(
    framed: &mut Framed,
    manager: &NodeManager,
    key: TypedKey,
) -> Result<(), WireError> {
    let store = manager.store(key.cache_type);
    let entry = match store.peek(&local_key(&key.semantic_id, key.entry_id)) {
        Ok(entry) => entry,
        Err(e) => {
            DeliveryMsg::Error(e.to_string()).send(framed)?;
            return Ok(());
        }
    };

    DeliveryMsg::MovePayload {
        info: entry.info,
        payload: entry.payload.to_vec(),
    }
    .send(framed)?;

    // The confirmation spans the destination's full install + index round
    // trip; allow a few timeout retries before giving the entry up for kept.
    for _ in 0..3 {
        match DeliveryMsg::recv(framed, DELIVERY_TIMEOUT) {
            Ok(DeliveryMsg::MoveDone) => {
                if let Err(e) = store.remove(&local_key(&key.semantic_id, key.entry_id)) {
                    log::debug!("move source drop: {e}");
                }
                log::debug!("moved {key} out, source copy dropped");
                return Ok(());
            }
            Ok(other) => {
                return Err(WireError::protocol(format!(
                    "expected MOVE_DONE, got {other:?}"
                )));
            }
            Err(WireError::Timeout) => {}
            Err(e) => {
                log::warn!("move of {key} unconfirmed, keeping the entry: {e}");
                return Ok(());
            }
        }
    }
    log::warn!("move of {key} timed out awaiting confirmation, keeping the entry");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumer_counting() {
        let pool = DeliveryPool::new(Duration::from_secs(30));
        let id = pool.add(vec![1u8, 2, 3].into(), 2);

        assert!(pool.fetch(id).is_some());
        assert!(pool.fetch(id).is_some());
        // Count exhausted.
        assert!(pool.fetch(id).is_none());
        assert!(pool.is_empty());
    }

    #[test]
    fn expiry() {
        let pool = DeliveryPool::new(Duration::from_millis(0));
        let id = pool.add(vec![1u8].into(), 5);
        std::thread::sleep(Duration::from_millis(5));
        pool.purge_expired();
        assert!(pool.fetch(id).is_none());
    }

    #[test]
    fn ids_are_unique() {
        let pool = DeliveryPool::new(Duration::from_secs(30));
        let a = pool.add(vec![1u8].into(), 1);
        let b = pool.add(vec![2u8].into(), 1);
        assert_ne!(a, b);
        assert_eq!(pool.len(), 2);
    }
}
