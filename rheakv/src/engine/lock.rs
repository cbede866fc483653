use rocksdb::DB;

use super::{CF_FENCING, CF_LOCKING};
use crate::errors::EngineError;
use crate::types::{
    BincodeOwnerCodec, LockAcquireOutcome, LockOwner, LockReleaseOutcome, LockRequest, LockResponse, OwnerCodec,
};

/// Single well-known key backing the region's fencing counter (§3 "Fencing Counter"):
/// one u64 shared by every lock key in the region, not one counter per key, so tokens
/// stay globally monotonic across leader changes regardless of which key was acquired.
const FENCING_COUNTER_KEY: &[u8] = b"fencing";

fn cf<'a>(db: &'a DB, name: &str) -> &'a rocksdb::ColumnFamily {
    db.cf_handle(name).unwrap_or_else(|| panic!("{name} column family always exists"))
}

fn next_fencing_token(db: &DB) -> Result<u64, EngineError> {
    let fencing_cf = cf(db, CF_FENCING);
    let current = match db.get_cf(fencing_cf, FENCING_COUNTER_KEY)? {
        Some(bytes) => u64::from_be_bytes(
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| EngineError::Storage("corrupt fencing counter".into()))?,
        ),
        None => 0,
    };
    let next = current + 1;
    db.put_cf(fencing_cf, FENCING_COUNTER_KEY, next.to_be_bytes())?;
    Ok(next)
}

/// Distributed lock acquisition protocol (§4.3 "Distributed lock protocol"). Every
/// branch that hands the lock to a *new* holder — first acquisition or preemption of
/// an expired lease — mints a fresh fencing token; renewing or re-entering an
/// already-held lock never does, so downstream writers can use the token to reject
/// stale messages from a preempted holder.
pub(crate) fn key_lock(db: &DB, key: &[u8], request: &LockRequest) -> Result<LockResponse, EngineError> {
    let locking_cf = cf(db, CF_LOCKING);
    let codec = BincodeOwnerCodec;

    let existing: Option<LockOwner> = match db.get_cf(locking_cf, key)? {
        Some(bytes) => Some(codec.decode(&bytes)?),
        None => None,
    };

    match existing {
        None => {
            let fencing_token = next_fencing_token(db)?;
            let owner = LockOwner {
                acquirer_id: request.acquirer_id.clone(),
                deadline_ms: request.now_ms + request.lease_ms,
                fencing_token,
                acquires: 1,
                context: request.context.clone(),
            };
            db.put_cf(locking_cf, key, codec.encode(&owner)?)?;
            Ok(LockResponse {
                success: true,
                outcome: LockAcquireOutcome::FirstTimeSuccess,
                fencing_token,
                acquires: 1,
                current_owner: None,
                remaining_ms: None,
            })
        }
        Some(mut owner) => {
            let expired = owner.deadline_ms <= request.now_ms;
            let same_acquirer = owner.acquirer_id == request.acquirer_id;

            if request.keep_lease {
                if same_acquirer && !expired {
                    owner.deadline_ms = request.now_ms + request.lease_ms;
                    db.put_cf(locking_cf, key, codec.encode(&owner)?)?;
                    Ok(LockResponse {
                        success: true,
                        outcome: LockAcquireOutcome::KeepLeaseSuccess,
                        fencing_token: owner.fencing_token,
                        acquires: owner.acquires,
                        current_owner: None,
                        remaining_ms: None,
                    })
                } else {
                    Ok(LockResponse {
                        success: false,
                        outcome: LockAcquireOutcome::KeepLeaseFail,
                        fencing_token: owner.fencing_token,
                        acquires: owner.acquires,
                        current_owner: Some(owner.acquirer_id.clone()),
                        remaining_ms: Some((owner.deadline_ms - request.now_ms).max(0)),
                    })
                }
            } else if same_acquirer && !expired {
                owner.acquires += 1;
                owner.deadline_ms = request.now_ms + request.lease_ms;
                db.put_cf(locking_cf, key, codec.encode(&owner)?)?;
                Ok(LockResponse {
                    success: true,
                    outcome: LockAcquireOutcome::ReentrantSuccess,
                    fencing_token: owner.fencing_token,
                    acquires: owner.acquires,
                    current_owner: None,
                    remaining_ms: None,
                })
            } else if expired {
                // Even the previous holder gets a new fencing token here: the lease
                // lapsed, so any in-flight write under the old token must be rejected.
                let fencing_token = next_fencing_token(db)?;
                let new_owner = LockOwner {
                    acquirer_id: request.acquirer_id.clone(),
                    deadline_ms: request.now_ms + request.lease_ms,
                    fencing_token,
                    acquires: 1,
                    context: request.context.clone(),
                };
                db.put_cf(locking_cf, key, codec.encode(&new_owner)?)?;
                Ok(LockResponse {
                    success: true,
                    outcome: LockAcquireOutcome::NewAcquireSuccess,
                    fencing_token,
                    acquires: 1,
                    current_owner: None,
                    remaining_ms: None,
                })
            } else {
                Ok(LockResponse {
                    success: false,
                    outcome: LockAcquireOutcome::OwnedByOther,
                    fencing_token: owner.fencing_token,
                    acquires: owner.acquires,
                    current_owner: Some(owner.acquirer_id.clone()),
                    remaining_ms: Some((owner.deadline_ms - request.now_ms).max(0)),
                })
            }
        }
    }
}

/// Release decrements the reentrant acquire count; the record is only deleted once
/// it reaches zero (§4.3 "Release protocol"). Idempotent for a key with no current
/// lock; releasing a lock held by someone else echoes back the current owner and
/// remaining lease, same shape as an `OwnedByOther` acquisition, instead of erroring.
pub(crate) fn key_lock_release(
    db: &DB,
    key: &[u8],
    acquirer_id: &str,
    now_ms: i64,
) -> Result<LockReleaseOutcome, EngineError> {
    let locking_cf = cf(db, CF_LOCKING);
    let codec = BincodeOwnerCodec;
    match db.get_cf(locking_cf, key)? {
        None => Ok(LockReleaseOutcome::NotFound),
        Some(bytes) => {
            let mut owner = codec.decode(&bytes)?;
            if owner.acquirer_id != acquirer_id {
                return Ok(LockReleaseOutcome::OwnedByOther {
                    current_owner: owner.acquirer_id.clone(),
                    remaining_ms: (owner.deadline_ms - now_ms).max(0),
                });
            }
            if owner.acquires > 1 {
                owner.acquires -= 1;
                db.put_cf(locking_cf, key, codec.encode(&owner)?)?;
            } else {
                db.delete_cf(locking_cf, key)?;
            }
            Ok(LockReleaseOutcome::Released)
        }
    }
}
