//! Process-wide index from service id to packet delegates.
//!
//! Transport I/O threads only know the numeric id of the service they work
//! for. They look the id up here to encode, decode and hand packets over to
//! the owning service's tick thread. The table is guarded by one mutex that is
//! held only for the map operation itself, never while a delegate runs.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::{Arc, LazyLock};

use bytes::Bytes;
use harbor_net::{AsyncConnResult, SessionId, SessionInfo};
use parking_lot::Mutex;

use crate::codec::Packet;
use crate::error::ServiceError;
use crate::handle::ServiceId;

/// Frames `(opcode, payload, status)` for the wire.
pub type EncodeDelegate = Box<dyn Fn(u32, &[u8], i32) -> Bytes + Send + Sync>;

/// Turns one received frame into a [`Packet`].
pub type DecodeDelegate = Box<dyn Fn(SessionId, Bytes) -> Result<Packet, ServiceError> + Send + Sync>;

/// Hands an event to the owning service. Returns `false` once the service is
/// gone.
pub type DeliverDelegate = Box<dyn Fn(ServiceEvent) -> bool + Send + Sync>;

/// Something the I/O side reports to a service's tick.
#[derive(Debug)]
pub enum ServiceEvent {
    /// A session opened.
    SessionCreated(SessionInfo),
    /// A session closed.
    SessionDestroyed {
        /// The closed session.
        session: SessionInfo,
        /// Why it closed.
        reason: String,
    },
    /// An asynchronous connect finished.
    AsyncConnResult(AsyncConnResult),
    /// A decoded packet.
    Packet(Packet),
    /// A packet whose opcode has no coder, reported instead of dispatched.
    NotFoundDecoder {
        /// Session the packet arrived on.
        session_id: SessionId,
        /// The unknown opcode.
        opcode: u32,
    },
}

/// The codec delegates of one service.
pub struct PacketDelegates {
    /// Encoder used by sends.
    pub encode: EncodeDelegate,
    /// Decoder run on I/O threads.
    pub decode: DecodeDelegate,
    /// Forwards events into the service's inbound queue.
    pub deliver: DeliverDelegate,
}

impl fmt::Debug for PacketDelegates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketDelegates").finish_non_exhaustive()
    }
}

static PACKET_DELEGATES: LazyLock<Mutex<HashMap<ServiceId, Arc<PacketDelegates>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Register delegates for `id`.
///
/// Fails with [`ServiceError::AlreadyInitialized`] if `id` already has an
/// entry; the existing entry is kept.
pub fn add_packet_delegates(
    id: ServiceId,
    delegates: Arc<PacketDelegates>,
) -> Result<(), ServiceError> {
    match PACKET_DELEGATES.lock().entry(id) {
        Entry::Occupied(_) => Err(ServiceError::AlreadyInitialized { service: id }),
        Entry::Vacant(slot) => {
            slot.insert(delegates);
            Ok(())
        }
    }
}

/// Delegates registered for `id`, or `None` if the service is unknown or gone.
pub fn packet_delegates(id: ServiceId) -> Option<Arc<PacketDelegates>> {
    PACKET_DELEGATES.lock().get(&id).cloned()
}

/// Remove the entry for `id`. Returns whether one existed.
pub fn remove_packet_delegates(id: ServiceId) -> bool {
    PACKET_DELEGATES.lock().remove(&id).is_some()
}

/// Number of services currently registered.
pub fn registered_service_count() -> usize {
    PACKET_DELEGATES.lock().len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    // Ids far above anything the service id allocator hands out in tests.
    const TEST_ID_BASE: u32 = 3_000_000_000;

    fn delegates(tag: u8) -> Arc<PacketDelegates> {
        Arc::new(PacketDelegates {
            encode: Box::new(move |_, _, _| Bytes::from(vec![tag])),
            decode: Box::new(|session, frame| Ok(Packet::new(session, 0, 0, frame))),
            deliver: Box::new(|_| true),
        })
    }

    #[test]
    fn test_add_lookup_remove() {
        let id = ServiceId(TEST_ID_BASE + 1);
        add_packet_delegates(id, delegates(1)).unwrap();
        assert!(registered_service_count() >= 1);

        let found = packet_delegates(id).unwrap();
        assert_eq!(&(found.encode)(0, &[], 0)[..], &[1]);

        assert!(remove_packet_delegates(id));
        assert!(!remove_packet_delegates(id));
        assert!(packet_delegates(id).is_none());
    }

    #[test]
    fn test_duplicate_add_keeps_original() {
        let id = ServiceId(TEST_ID_BASE + 2);
        add_packet_delegates(id, delegates(1)).unwrap();
        let err = add_packet_delegates(id, delegates(2)).unwrap_err();
        assert!(matches!(err, ServiceError::AlreadyInitialized { service } if service == id));

        let found = packet_delegates(id).unwrap();
        assert_eq!(&(found.encode)(0, &[], 0)[..], &[1]);
        remove_packet_delegates(id);
    }

    #[test]
    fn test_concurrent_churn_never_returns_removed_entries() {
        const THREADS: u32 = 8;
        const ROUNDS: u32 = 500;
        let failed = Arc::new(AtomicBool::new(false));

        let workers: Vec<_> = (0..THREADS)
            .map(|t| {
                let failed = Arc::clone(&failed);
                thread::spawn(move || {
                    for round in 0..ROUNDS {
                        let id = ServiceId(TEST_ID_BASE + 1_000 + t * ROUNDS + round);
                        let tag = (t % 200) as u8;
                        if add_packet_delegates(id, delegates(tag)).is_err() {
                            failed.store(true, Ordering::SeqCst);
                        }
                        match packet_delegates(id) {
                            Some(found) if (found.encode)(0, &[], 0)[..] == [tag] => {}
                            _ => failed.store(true, Ordering::SeqCst),
                        }
                        if !remove_packet_delegates(id) || packet_delegates(id).is_some() {
                            failed.store(true, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        assert!(!failed.load(Ordering::SeqCst));
    }
}
