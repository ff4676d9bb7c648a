use std::time::{
    Duration,
    UNIX_EPOCH,
};

use errors::ErrorMetadata;
use store_api::{
    Clock,
    StoreTransaction,
};
use uuid::Uuid;

use crate::keyspace;

/// Millis since `UNIX_EPOCH`, the read-version unit every lease comparison
/// is expressed in. Shared by the Orchestrator (to open a build) and
/// `LeaseHandle` (to renew one), so there's exactly one clock-to-version
/// conversion in the crate.
pub fn current_version(clock: &dyn Clock) -> u64 {
    clock.system_time().duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO).as_millis() as u64
}

/// `(sessionId, leaseExpiryAtVersion)`, stored under `<index>/lock`. A
/// performance shield, not a safety mechanism — the range set is what makes
/// two racing workers safe; the lease just stops them both from doing I/O
/// forever. Grounded on the teacher's general idiom of "read existing state,
/// decide insert-vs-replace, single transaction" seen in
/// `IndexBackfillModel::initialize_backfill`, since the teacher has no
/// direct per-index lease (it relies on a single leader-elected process
/// instead).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionLease {
    pub session_id: Uuid,
    pub expires_at_version: u64,
}

impl SessionLease {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(24);
        buf.extend_from_slice(self.session_id.as_bytes());
        buf.extend_from_slice(&self.expires_at_version.to_le_bytes());
        buf
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 24 {
            return None;
        }
        let session_id = Uuid::from_slice(&bytes[..16]).ok()?;
        let expires_at_version = u64::from_le_bytes(bytes[16..24].try_into().ok()?);
        Some(Self {
            session_id,
            expires_at_version,
        })
    }

    async fn read(tx: &mut dyn StoreTransaction, index: &str) -> anyhow::Result<Option<Self>> {
        let bytes = tx.get_subspace(index, keyspace::LOCK).await?;
        Ok(bytes.and_then(|b| Self::decode(&b)))
    }

    fn is_live(&self, read_version: u64) -> bool {
        read_version < self.expires_at_version
    }

    /// Atomically start a new session: if no lease is present or the
    /// existing one has expired (relative to `read_version`), writes
    /// `(new_id, read_version + lease_millis)`. If a live lease is present,
    /// fails with `SessionLocked`.
    pub async fn start(
        tx: &mut dyn StoreTransaction,
        index: &str,
        read_version: u64,
        lease_millis: u64,
    ) -> anyhow::Result<Self> {
        if let Some(existing) = Self::read(tx, index).await? {
            if existing.is_live(read_version) {
                return Err(ErrorMetadata::session_locked(format!(
                    "index {index} already has a live build session"
                ))
                .into());
            }
        }
        let lease = Self {
            session_id: Uuid::new_v4(),
            expires_at_version: read_version + lease_millis,
        };
        tx.put_subspace(index, keyspace::LOCK, lease.encode()).await?;
        Ok(lease)
    }

    /// As `start`, but requires the persisted id to already match
    /// `session_id` (used by a worker resuming its own prior session).
    pub async fn join(
        tx: &mut dyn StoreTransaction,
        index: &str,
        session_id: Uuid,
        read_version: u64,
        lease_millis: u64,
    ) -> anyhow::Result<Self> {
        let existing = Self::read(tx, index).await?;
        match existing {
            Some(existing) if existing.session_id == session_id => {
                let lease = Self {
                    session_id,
                    expires_at_version: read_version + lease_millis,
                };
                tx.put_subspace(index, keyspace::LOCK, lease.encode()).await?;
                Ok(lease)
            },
            Some(_) => Err(ErrorMetadata::session_locked(format!(
                "index {index}'s lease is held by a different session"
            ))
            .into()),
            None => Err(ErrorMetadata::session_lost(format!(
                "index {index} has no lease to join"
            ))
            .into()),
        }
    }

    /// Every store transaction executed by a lease-holder performs this
    /// read-and-conditional-renew first; if the lease was stolen, the
    /// transaction aborts with `SessionLost` before any user work commits.
    /// An associated function rather than a `&self` method: the caller only
    /// needs to prove which `session_id` it holds, not a cached expiry that
    /// this same read would make stale anyway.
    pub async fn renew_or_abort(
        tx: &mut dyn StoreTransaction,
        index: &str,
        session_id: Uuid,
        read_version: u64,
        lease_millis: u64,
    ) -> anyhow::Result<Self> {
        let current = Self::read(tx, index).await?;
        match current {
            Some(current) if current.session_id == session_id => {
                let renewed = Self {
                    session_id,
                    expires_at_version: read_version + lease_millis,
                };
                tx.put_subspace(index, keyspace::LOCK, renewed.encode()).await?;
                Ok(renewed)
            },
            _ => Err(ErrorMetadata::session_lost(format!(
                "index {index}'s lease was stolen or deleted"
            ))
            .into()),
        }
    }

    /// Administrative unlock: deletes the lease record unconditionally, so
    /// the current holder's next pre-chunk check aborts with `SessionLost`.
    pub async fn end_any(tx: &mut dyn StoreTransaction, index: &str) -> anyhow::Result<()> {
        tx.put_subspace(index, keyspace::LOCK, Vec::new()).await
    }

    pub async fn check_active(tx: &mut dyn StoreTransaction, index: &str, read_version: u64) -> anyhow::Result<bool> {
        Ok(Self::read(tx, index).await?.is_some_and(|l| l.is_live(read_version)))
    }
}

/// A lease-holder's renewal credentials: just enough to call
/// `renew_or_abort` at the top of every subsequent transaction. Plain `Copy`
/// data rather than a cell around the live `SessionLease` — renewal always
/// re-reads the persisted record rather than trusting a cached expiry, so
/// there's nothing mutable worth sharing across transactions.
#[derive(Clone, Copy, Debug)]
pub struct LeaseHandle {
    pub session_id: Uuid,
    pub lease_millis: u64,
}

impl LeaseHandle {
    pub fn new(lease: SessionLease, lease_millis: u64) -> Self {
        Self {
            session_id: lease.session_id,
            lease_millis,
        }
    }

    /// Renew in `tx`, aborting the whole transaction with `SessionLost` if
    /// this session's lease was stolen or deleted since it was acquired.
    pub async fn renew(&self, tx: &mut dyn StoreTransaction, index: &str, read_version: u64) -> anyhow::Result<()> {
        SessionLease::renew_or_abort(tx, index, self.session_id, read_version, self.lease_millis).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use store_api::TransactionalStore;

    use super::*;

    #[test]
    fn encode_decode_roundtrips() {
        let lease = SessionLease {
            session_id: Uuid::new_v4(),
            expires_at_version: 42,
        };
        assert_eq!(SessionLease::decode(&lease.encode()), Some(lease));
    }

    #[test]
    fn empty_bytes_do_not_decode() {
        assert_eq!(SessionLease::decode(&[]), None);
    }

    #[tokio::test]
    async fn renew_extends_a_live_lease_held_by_the_same_session() {
        let store = memstore::MemStore::new();
        let mut tx = store.open_transaction(store_api::Priority::Default).await.unwrap();
        let lease = SessionLease::start(tx.as_mut(), "idx", 1_000, 10_000).await.unwrap();
        tx.commit().await.unwrap();

        let handle = LeaseHandle::new(lease, 10_000);
        let mut tx = store.open_transaction(store_api::Priority::Default).await.unwrap();
        handle.renew(tx.as_mut(), "idx", 5_000).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.open_transaction(store_api::Priority::Default).await.unwrap();
        assert!(SessionLease::check_active(tx.as_mut(), "idx", 14_000).await.unwrap());
        assert!(!SessionLease::check_active(tx.as_mut(), "idx", 15_000).await.unwrap());
    }

    #[tokio::test]
    async fn renew_aborts_with_session_lost_once_the_lease_is_stolen() {
        let store = memstore::MemStore::new();
        let mut tx = store.open_transaction(store_api::Priority::Default).await.unwrap();
        let lease = SessionLease::start(tx.as_mut(), "idx", 1_000, 10_000).await.unwrap();
        tx.commit().await.unwrap();

        let handle = LeaseHandle::new(lease, 10_000);

        let mut tx = store.open_transaction(store_api::Priority::Default).await.unwrap();
        SessionLease::end_any(tx.as_mut(), "idx").await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.open_transaction(store_api::Priority::Default).await.unwrap();
        let err = handle.renew(tx.as_mut(), "idx", 5_000).await.unwrap_err();
        assert!(err.downcast_ref::<ErrorMetadata>().unwrap().is_session_lost());
    }
}
