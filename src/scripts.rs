//! Server-side Lua scripts for atomic record transitions.
//!
//! Every transition that touches two lists (retry re-queue, dead-lettering,
//! GC reclamation) must be a single server-side step so a record is never in
//! both lists or in neither. Client-side read-then-write is not an option
//! for these moves.

use deadpool_redis::redis::Script;
use once_cell::sync::Lazy;

/// Remove one occurrence of a record from a source list and push its
/// replacement onto a destination list, atomically.
///
/// `KEYS[1]` source list, `KEYS[2]` destination list, `ARGV[1]` the record
/// as currently stored, `ARGV[2]` the record to push (usually the same
/// record with `attempts` bumped). Returns 1 when the record was found and
/// moved, 0 when another party already removed it.
pub(crate) static MOVE_RECORD: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 1 then
    redis.call('LPUSH', KEYS[2], ARGV[2])
    return 1
end
return 0
"#,
    )
});

/// Delete a volatile lock key only if it still holds the caller's id.
///
/// `KEYS[1]` lock key, `ARGV[1]` owner id. Returns 1 when the lock was
/// released, 0 when the caller no longer owned it.
pub(crate) static RELEASE_LOCK: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#,
    )
});
