use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mo_types::{
    BaseRequest, CacheRef, DeliveryRequest, EntrySnapshot, Part, Produced, PuzzleRequest,
    TypedKey,
};
use mo_wire::{
    send_worker_registration, DeliveryMsg, Framed, WireError, WorkerMsg, CONTROL_TIMEOUT,
    DELIVERY_TIMEOUT, MAGIC_DELIVERY, MAGIC_WORKER,
};

use crate::manager::local_key;
use crate::{DeliveryPool, NodeManager};

/// One worker thread: connect, register, pull commands until told to stop.
///
/// Reads poll with the control timeout and simply retry; a quiet coordinator
/// is not an error. Anything harmful on the connection drops it and the loop
/// re-dials.
pub(crate) fn worker_loop(
    manager: Arc<NodeManager>,
    pool: Arc<DeliveryPool>,
    index_addr: (String, u16),
    alive: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    reconnect_delay: std::time::Duration,
) {
    let running = || alive.load(Ordering::Relaxed) && !stop.load(Ordering::Relaxed);

    while running() {
        let Some(node_id) = manager.node_id() else {
            std::thread::sleep(reconnect_delay);
            continue;
        };
        let mut framed = match Framed::connect(
            (index_addr.0.as_str(), index_addr.1),
            MAGIC_WORKER,
        ) {
            Ok(framed) => framed,
            Err(e) => {
                log::debug!("worker: cannot reach coordinator: {e}");
                std::thread::sleep(reconnect_delay);
                continue;
            }
        };
        if send_worker_registration(&mut framed, node_id).is_err() {
            std::thread::sleep(reconnect_delay);
            continue;
        }
        log::debug!("worker connected to coordinator as part of {node_id}");

        while running() {
            match WorkerMsg::recv(&mut framed, CONTROL_TIMEOUT) {
                Ok(msg) => {
                    if let Err(e) = process_command(&manager, &pool, &mut framed, msg) {
                        log::warn!("worker connection failed: {e}");
                        break;
                    }
                }
                Err(WireError::Timeout) => {}
                Err(e) => {
                    if running() {
                        log::info!("worker lost coordinator ({e}), reconnecting");
                    }
                    break;
                }
            }
        }
        if running() {
            std::thread::sleep(reconnect_delay);
        }
    }
    log::debug!("worker done");
}

/// Executes one job command. Job-level failures (producer errors, missing
/// entries, unreachable peers) are reported as `ERROR` and leave the
/// connection healthy; only wire failures propagate.
fn process_command(
    manager: &NodeManager,
    pool: &DeliveryPool,
    framed: &mut Framed,
    msg: WorkerMsg,
) -> Result<(), WireError> {
    match msg {
        WorkerMsg::Create(request) => {
            log::debug!("worker: create {request}");
            manager.note_miss();
            match produce_whole(manager, &request) {
                Ok((produced, snapshots)) => {
                    finish_request(manager, pool, framed, &request, produced.payload, snapshots)
                }
                Err(message) => WorkerMsg::Error(message).send(framed),
            }
        }
        WorkerMsg::Puzzle(request) => {
            log::debug!("worker: puzzle {request}");
            if request.remainders.is_empty() {
                manager.note_multi_hit();
            } else {
                manager.note_partial();
            }
            match assemble_puzzle(manager, &request) {
                Ok((produced, snapshots)) => finish_request(
                    manager,
                    pool,
                    framed,
                    &request.base,
                    produced.payload,
                    snapshots,
                ),
                Err(message) => WorkerMsg::Error(message).send(framed),
            }
        }
        WorkerMsg::Deliver(request) => {
            log::debug!("worker: deliver {request}");
            manager.note_single_hit();
            let store = manager.store(request.cache_type);
            match store.get(&local_key(&request.semantic_id, request.entry_id)) {
                Ok(entry) => {
                    finish_request_payload(manager, pool, framed, &request, entry.payload)
                }
                Err(e) => WorkerMsg::Error(e.to_string()).send(framed),
            }
        }
        other => {
            log::warn!("worker: unexpected command {other:?}");
            Ok(())
        }
    }
}

fn produce_whole(
    manager: &NodeManager,
    request: &BaseRequest,
) -> Result<(Produced, Vec<EntrySnapshot>), String> {
    let produced = manager
        .producer()
        .produce(request.cache_type, &request.semantic_id, &request.rect)
        .map_err(|e| e.to_string())?;
    let snapshots = manager.cache_result(
        request.cache_type,
        &request.semantic_id,
        &request.rect,
        &produced,
    );
    Ok((produced, snapshots))
}

/// Gathers local pieces, fetches remote ones from their owners' delivery
/// services, produces every remainder, and lets the producer stitch the
/// final payload together.
fn assemble_puzzle(
    manager: &NodeManager,
    request: &PuzzleRequest,
) -> Result<(Produced, Vec<EntrySnapshot>), String> {
    let my_id = manager.node_id();
    let base = &request.base;
    let mut parts = Vec::with_capacity(request.parts.len() + request.remainders.len());

    for part in &request.parts {
        let payload = if Some(part.node_id) == my_id {
            let store = manager.store(base.cache_type);
            store
                .get(&local_key(&base.semantic_id, part.entry_id))
                .map(|entry| entry.payload)
                .map_err(|e| e.to_string())?
        } else {
            fetch_remote(base, part)?
        };
        parts.push(Part {
            bounds: part.bounds.bounds,
            payload,
        });
    }

    for remainder in &request.remainders {
        let produced = manager
            .producer()
            .produce(base.cache_type, &base.semantic_id, remainder)
            .map_err(|e| e.to_string())?;
        parts.push(Part {
            bounds: produced.bounds,
            payload: produced.payload,
        });
    }

    let assembled = manager
        .producer()
        .assemble(base.cache_type, &base.semantic_id, &base.rect, &parts)
        .map_err(|e| e.to_string())?;
    let snapshots =
        manager.cache_result(base.cache_type, &base.semantic_id, &base.rect, &assembled);
    Ok((assembled, snapshots))
}

/// Streams a peer's cache entry through its delivery service.
fn fetch_remote(base: &BaseRequest, part: &CacheRef) -> Result<Arc<[u8]>, String> {
    let addr = (part.host.as_str(), part.port)
        .to_socket_addrs()
        .map_err(|e| format!("cannot resolve {}:{}: {e}", part.host, part.port))?
        .next()
        .ok_or_else(|| format!("cannot resolve {}:{}", part.host, part.port))?;

    let mut framed = Framed::connect(addr, MAGIC_DELIVERY)
        .map_err(|e| format!("cannot reach peer {}:{}: {e}", part.host, part.port))?;
    let key = TypedKey::new(base.cache_type, base.semantic_id.clone(), part.entry_id);
    DeliveryMsg::GetCached(key)
        .send(&mut framed)
        .map_err(|e| e.to_string())?;

    match DeliveryMsg::recv(&mut framed, DELIVERY_TIMEOUT) {
        Ok(DeliveryMsg::Payload(payload)) => Ok(payload.into()),
        Ok(DeliveryMsg::Error(message)) => Err(format!("peer refused puzzle piece: {message}")),
        Ok(other) => Err(format!("unexpected delivery response {other:?}")),
        Err(e) => Err(format!("fetching puzzle piece failed: {e}")),
    }
}

fn finish_request(
    manager: &NodeManager,
    pool: &DeliveryPool,
    framed: &mut Framed,
    request: &BaseRequest,
    payload: Arc<[u8]>,
    snapshots: Vec<EntrySnapshot>,
) -> Result<(), WireError> {
    manager
        .store(request.cache_type)
        .note_result_bytes(payload.len() as u64);
    finish(pool, framed, payload, snapshots)
}

fn finish_request_payload(
    manager: &NodeManager,
    pool: &DeliveryPool,
    framed: &mut Framed,
    request: &DeliveryRequest,
    payload: Arc<[u8]>,
) -> Result<(), WireError> {
    manager
        .store(request.cache_type)
        .note_result_bytes(payload.len() as u64);
    finish(pool, framed, payload, Vec::new())
}

/// The finish handshake: announce the result, learn the consumer count,
/// reserve the delivery. A zero count (every waiter left) skips the
/// reservation; the result was still worth caching.
fn finish(
    pool: &DeliveryPool,
    framed: &mut Framed,
    payload: Arc<[u8]>,
    snapshots: Vec<EntrySnapshot>,
) -> Result<(), WireError> {
    WorkerMsg::ResultReady(snapshots).send(framed)?;

    let qty = loop {
        match WorkerMsg::recv(framed, CONTROL_TIMEOUT) {
            Ok(WorkerMsg::DeliveryQty(qty)) => break qty,
            Ok(other) => {
                return Err(WireError::protocol(format!(
                    "expected DELIVERY_QTY, got {other:?}"
                )));
            }
            Err(WireError::Timeout) => {}
            Err(e) => return Err(e),
        }
    };

    let delivery_id = if qty == 0 {
        0
    } else {
        pool.add(payload, qty)
    };
    WorkerMsg::DeliveryReady(delivery_id).send(framed)
}
