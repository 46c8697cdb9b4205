//! Redis implementation of CoordinationStore
//!
//! Production store shared by every broker and worker process:
//! - Selection, release, heartbeat and reaping run as server-side Lua scripts
//! - Registration and deregistration run as MULTI/EXEC pipelines
//! - Record liveness is bounded by key TTLs
//!
//! The scripts reach worker records through keys they build themselves, so
//! they require a standalone Redis (or a single-shard deployment), not
//! Redis Cluster.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::Script;
use tracing::{debug, instrument, warn};

use super::keys::*;
use super::store::*;
use crate::config::TimingConfig;

/// Atomic selection: build the candidate pool, pick, and commit both counters
const SELECT_SCRIPT: &str = r#"
local index_key = KEYS[1]
local active_key = KEYS[2]
local lifetime_key = KEYS[3]
local capability = ARGV[1]
local max_concurrent = tonumber(ARGV[2])
local max_lifetime = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local liveness = tonumber(ARGV[5])

local workers = {}
for _, id in ipairs(redis.call('SMEMBERS', index_key)) do
    local fields = redis.call('HMGET', 'worker:' .. capability .. ':' .. id,
        'status', 'last_heartbeat', 'endpoint', 'registered_at')
    if fields[1] then
        local field = capability .. ':' .. id
        table.insert(workers, {
            id = id,
            field = field,
            status = fields[1],
            heartbeat = tonumber(fields[2]) or 0,
            endpoint = fields[3],
            registered_at = tonumber(fields[4]) or 0,
            active = tonumber(redis.call('HGET', active_key, field)) or 0,
            lifetime = tonumber(redis.call('HGET', lifetime_key, field)) or 0,
        })
    end
end

if #workers == 0 then
    return false
end

local margin = math.max(1, math.floor(max_lifetime / #workers))
local ceiling = max_lifetime - margin

local function better(current, other)
    if current == nil then return other end
    if other.lifetime ~= current.lifetime then
        if other.lifetime > current.lifetime then return other end
        return current
    end
    if other.active ~= current.active then
        if other.active < current.active then return other end
        return current
    end
    if other.id < current.id then return other end
    return current
end

local primary = nil
local fallback = nil
for _, w in ipairs(workers) do
    local candidate = w.status == 'available'
        and (now - w.heartbeat) <= liveness
        and w.active < max_concurrent
        and w.lifetime < max_lifetime
    if candidate then
        if w.lifetime < ceiling then
            primary = better(primary, w)
        elseif w.lifetime + 1 <= max_lifetime then
            fallback = better(fallback, w)
        end
    end
end

local chosen = primary or fallback
if chosen == nil then
    return false
end

local active = redis.call('HINCRBY', active_key, chosen.field, 1)
local lifetime = redis.call('HINCRBY', lifetime_key, chosen.field, 1)
return {chosen.id, chosen.endpoint, active, lifetime, chosen.registered_at}
"#;

/// Decrement floored at zero; -1 marks a worker whose counters are gone or
/// belong to a later registration than ARGV[2] (empty skips that check)
const RELEASE_SCRIPT: &str = r#"
if ARGV[2] ~= '' then
    local registered = redis.call('HGET', KEYS[3], 'registered_at')
    if registered and registered ~= ARGV[2] then
        return {-1, 0}
    end
end
local current = redis.call('HGET', KEYS[1], ARGV[1])
local lifetime = tonumber(redis.call('HGET', KEYS[2], ARGV[1])) or 0
if not current then
    return {-1, lifetime}
end
local active = tonumber(current) or 0
if active > 0 then
    active = redis.call('HINCRBY', KEYS[1], ARGV[1], -1)
end
return {active, lifetime}
"#;

const HEARTBEAT_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return {0, 0}
end
redis.call('HSET', KEYS[1], 'last_heartbeat', ARGV[1])
redis.call('PEXPIRE', KEYS[1], ARGV[2])
return {1, redis.call('EXISTS', KEYS[2])}
"#;

const SET_STATUS_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return 0
end
redis.call('HSET', KEYS[1], 'status', ARGV[1])
return 1
"#;

/// One sweep: stale records, index entries without a record, and counter
/// fields without a record. Returns a flat list of kind, capability, id.
const REAP_SCRIPT: &str = r#"
local capabilities_key = KEYS[1]
local active_key = KEYS[2]
local lifetime_key = KEYS[3]
local now = tonumber(ARGV[1])
local stale = tonumber(ARGV[2])
local out = {}

local function purge(capability, id)
    local field = capability .. ':' .. id
    redis.call('DEL', 'worker:' .. capability .. ':' .. id, 'worker:cmd:' .. capability .. ':' .. id)
    redis.call('HDEL', active_key, field)
    redis.call('HDEL', lifetime_key, field)
    redis.call('SREM', 'cluster:workers:' .. capability, id)
end

local function report(kind, capability, id)
    table.insert(out, kind)
    table.insert(out, capability)
    table.insert(out, id)
end

for _, capability in ipairs(redis.call('SMEMBERS', capabilities_key)) do
    local index_key = 'cluster:workers:' .. capability
    for _, id in ipairs(redis.call('SMEMBERS', index_key)) do
        local heartbeat = redis.call('HGET', 'worker:' .. capability .. ':' .. id, 'last_heartbeat')
        if not heartbeat then
            purge(capability, id)
            report('orphaned', capability, id)
        elseif now - (tonumber(heartbeat) or 0) > stale then
            purge(capability, id)
            report('stale', capability, id)
        end
    end
    if redis.call('SCARD', index_key) == 0 then
        redis.call('SREM', capabilities_key, capability)
    end
end

local seen = {}
for _, counters in ipairs({active_key, lifetime_key}) do
    for _, field in ipairs(redis.call('HKEYS', counters)) do
        if not seen[field] then
            seen[field] = true
            local sep = string.find(field, ':', 1, true)
            if sep then
                local capability = string.sub(field, 1, sep - 1)
                local id = string.sub(field, sep + 1)
                if redis.call('EXISTS', 'worker:' .. capability .. ':' .. id) == 0 then
                    purge(capability, id)
                    report('orphaned', capability, id)
                end
            end
        end
    end
end

return out
"#;

struct Scripts {
    select: Script,
    release: Script,
    heartbeat: Script,
    set_status: Script,
    reap: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            select: Script::new(SELECT_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
            heartbeat: Script::new(HEARTBEAT_SCRIPT),
            set_status: Script::new(SET_STATUS_SCRIPT),
            reap: Script::new(REAP_SCRIPT),
        }
    }
}

/// Redis implementation of CoordinationStore
///
/// Cloning is cheap; clones share one multiplexed, auto-reconnecting
/// connection.
///
/// # Example
///
/// ```ignore
/// use browserfleet_coordination::{RedisCoordinationStore, TimingConfig};
///
/// let store = RedisCoordinationStore::connect("redis://127.0.0.1:6379", &TimingConfig::default()).await?;
/// ```
#[derive(Clone)]
pub struct RedisCoordinationStore {
    conn: ConnectionManager,
    scripts: Arc<Scripts>,
}

impl RedisCoordinationStore {
    /// Wrap an existing connection manager
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            scripts: Arc::new(Scripts::load()),
        }
    }

    /// Connect with connection and response timeouts bounded by `store_timeout`
    pub async fn connect(url: &str, timing: &TimingConfig) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let config = ConnectionManagerConfig::new()
            .set_connection_timeout(timing.store_timeout)
            .set_response_timeout(timing.store_timeout);
        let conn = ConnectionManager::new_with_config(client, config).await?;
        debug!("Connected to coordination store");
        Ok(Self::new(conn))
    }

    async fn capabilities(&self, filter: &WorkerFilter) -> Result<Vec<String>, StoreError> {
        if let Some(capability) = &filter.capability {
            validate_capability(capability)?;
            return Ok(vec![capability.clone()]);
        }
        let mut conn = self.conn.clone();
        let mut capabilities: Vec<String> = redis::cmd("SMEMBERS")
            .arg(CAPABILITIES)
            .query_async(&mut conn)
            .await?;
        capabilities.sort();
        Ok(capabilities)
    }

    async fn list_capability(&self, capability: &str) -> Result<Vec<WorkerSnapshot>, StoreError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(index_key(capability))
            .query_async(&mut conn)
            .await?;
        if ids.is_empty() {
            return Ok(vec![]);
        }

        let keys = ids
            .iter()
            .map(|id| WorkerKey::new(capability, id.as_str()))
            .collect::<Result<Vec<_>, _>>()?;
        let fields: Vec<String> = keys.iter().map(WorkerKey::counter_field).collect();

        let mut pipe = redis::pipe();
        for key in &keys {
            pipe.hgetall(record_key(key));
        }
        let hashes: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;

        let active: Vec<Option<u32>> = redis::cmd("HMGET")
            .arg(ACTIVE_COUNTERS)
            .arg(&fields)
            .query_async(&mut conn)
            .await?;
        let lifetime: Vec<Option<u32>> = redis::cmd("HMGET")
            .arg(LIFETIME_COUNTERS)
            .arg(&fields)
            .query_async(&mut conn)
            .await?;

        let mut workers = Vec::with_capacity(keys.len());
        for (i, key) in keys.into_iter().enumerate() {
            // An empty hash means the record expired; the reaper cleans the index.
            let Some(record) = decode_record(key, &hashes[i])? else {
                continue;
            };
            workers.push(WorkerSnapshot {
                record,
                active: active.get(i).copied().flatten().unwrap_or(0),
                lifetime: lifetime.get(i).copied().flatten().unwrap_or(0),
            });
        }
        Ok(workers)
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn decode_record(
    key: WorkerKey,
    fields: &HashMap<String, String>,
) -> Result<Option<WorkerRecord>, StoreError> {
    if fields.is_empty() {
        return Ok(None);
    }
    let corrupt = |reason: String| StoreError::Corrupt {
        key: record_key(&key),
        reason,
    };
    let field = |name: &str| {
        fields
            .get(name)
            .ok_or_else(|| corrupt(format!("missing field '{name}'")))
    };
    let timestamp = |name: &str| -> Result<DateTime<Utc>, StoreError> {
        let raw = field(name)?;
        raw.parse::<i64>()
            .ok()
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| corrupt(format!("bad timestamp in '{name}': {raw}")))
    };

    let endpoint = field(FIELD_ENDPOINT)?.clone();
    let status = field(FIELD_STATUS)?
        .parse::<WorkerStatus>()
        .map_err(|e| corrupt(e.to_string()))?;
    let last_heartbeat = timestamp(FIELD_LAST_HEARTBEAT)?;
    let registered_at = timestamp(FIELD_REGISTERED_AT)?;

    Ok(Some(WorkerRecord {
        key,
        endpoint,
        status,
        last_heartbeat,
        registered_at,
    }))
}

#[async_trait]
impl CoordinationStore for RedisCoordinationStore {
    #[instrument(skip(self, record), fields(worker = %record.key))]
    async fn register_worker(
        &self,
        record: WorkerRecord,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let key = &record.key;
        let record_key = record_key(key);
        let field = key.counter_field();
        let hash = [
            (FIELD_ID, key.id().to_string()),
            (FIELD_CAPABILITY, key.capability().to_string()),
            (FIELD_ENDPOINT, record.endpoint.clone()),
            (FIELD_STATUS, record.status.as_str().to_string()),
            (
                FIELD_LAST_HEARTBEAT,
                record.last_heartbeat.timestamp_millis().to_string(),
            ),
            (
                FIELD_REGISTERED_AT,
                record.registered_at.timestamp_millis().to_string(),
            ),
        ];

        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .del(&record_key)
            .ignore()
            .hset_multiple(&record_key, &hash)
            .ignore()
            .pexpire(&record_key, millis(ttl))
            .ignore()
            .sadd(index_key(key.capability()), key.id())
            .ignore()
            .sadd(CAPABILITIES, key.capability())
            .ignore()
            .hset(ACTIVE_COUNTERS, &field, 0)
            .ignore()
            .hset(LIFETIME_COUNTERS, &field, 0)
            .ignore()
            .del(command_key(key))
            .ignore()
            .query_async(&mut conn)
            .await?;

        debug!(endpoint = %record.endpoint, "Worker registered");
        Ok(())
    }

    #[instrument(skip(self, now), fields(worker = %worker))]
    async fn heartbeat_worker(
        &self,
        worker: &WorkerKey,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<HeartbeatResponse, StoreError> {
        let mut conn = self.conn.clone();
        let (accepted, pending): (i64, i64) = self
            .scripts
            .heartbeat
            .key(record_key(worker))
            .key(command_key(worker))
            .arg(now.timestamp_millis())
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await?;

        Ok(HeartbeatResponse {
            accepted: accepted == 1,
            shutdown_requested: pending == 1,
        })
    }

    #[instrument(skip(self), fields(worker = %worker))]
    async fn set_worker_status(
        &self,
        worker: &WorkerKey,
        status: WorkerStatus,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let updated: i64 = self
            .scripts
            .set_status
            .key(record_key(worker))
            .arg(status.as_str())
            .invoke_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    #[instrument(skip(self), fields(worker = %worker))]
    async fn deregister_worker(&self, worker: &WorkerKey) -> Result<bool, StoreError> {
        let field = worker.counter_field();
        let mut conn = self.conn.clone();
        let removed: Vec<i64> = redis::pipe()
            .atomic()
            .del(record_key(worker))
            .hdel(ACTIVE_COUNTERS, &field)
            .hdel(LIFETIME_COUNTERS, &field)
            .srem(index_key(worker.capability()), worker.id())
            .del(command_key(worker))
            .query_async(&mut conn)
            .await?;

        let removed = removed.iter().any(|count| *count > 0);
        debug!(removed, "Worker deregistered");
        Ok(removed)
    }

    #[instrument(skip(self))]
    async fn list_workers(&self, filter: WorkerFilter) -> Result<Vec<WorkerSnapshot>, StoreError> {
        let mut workers = Vec::new();
        for capability in self.capabilities(&filter).await? {
            workers.extend(self.list_capability(&capability).await?);
        }
        workers.sort_by(|a, b| a.record.key.cmp(&b.record.key));
        Ok(workers)
    }

    #[instrument(skip(self, request), fields(capability = %request.capability))]
    async fn select_worker(&self, request: &SelectionRequest) -> Result<Selection, StoreError> {
        validate_capability(&request.capability)?;

        let mut conn = self.conn.clone();
        let picked: Option<(String, String, u32, u32, i64)> = self
            .scripts
            .select
            .key(index_key(&request.capability))
            .key(ACTIVE_COUNTERS)
            .key(LIFETIME_COUNTERS)
            .arg(&request.capability)
            .arg(request.limits.max_concurrent)
            .arg(request.limits.max_lifetime)
            .arg(request.now.timestamp_millis())
            .arg(millis(request.liveness_window))
            .invoke_async(&mut conn)
            .await?;

        let Some((id, endpoint, active, lifetime, registered_ms)) = picked else {
            debug!("No worker available");
            return Ok(Selection::Unavailable);
        };

        let worker = WorkerKey::new(request.capability.as_str(), id)?;
        let registered_at = DateTime::from_timestamp_millis(registered_ms).ok_or_else(|| {
            StoreError::Corrupt {
                key: record_key(&worker),
                reason: format!("bad registration timestamp {registered_ms}"),
            }
        })?;
        debug!(worker = %worker, active, lifetime, "Worker selected");
        Ok(Selection::Assigned(Assignment {
            worker,
            endpoint,
            active,
            lifetime,
            registered_at,
        }))
    }

    #[instrument(skip(self, registered_at), fields(worker = %worker))]
    async fn release_worker(
        &self,
        worker: &WorkerKey,
        registered_at: Option<DateTime<Utc>>,
    ) -> Result<ReleaseOutcome, StoreError> {
        let registration = registered_at
            .map(|at| at.timestamp_millis().to_string())
            .unwrap_or_default();
        let mut conn = self.conn.clone();
        let (active, lifetime): (i64, i64) = self
            .scripts
            .release
            .key(ACTIVE_COUNTERS)
            .key(LIFETIME_COUNTERS)
            .key(record_key(worker))
            .arg(worker.counter_field())
            .arg(registration)
            .invoke_async(&mut conn)
            .await?;

        let lifetime = u32::try_from(lifetime).unwrap_or(0);
        if active < 0 {
            return Ok(ReleaseOutcome {
                tracked: false,
                active: 0,
                lifetime,
            });
        }
        Ok(ReleaseOutcome {
            tracked: true,
            active: u32::try_from(active).unwrap_or(0),
            lifetime,
        })
    }

    #[instrument(skip(self))]
    async fn total_active(&self) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let counts: Vec<i64> = redis::cmd("HVALS")
            .arg(ACTIVE_COUNTERS)
            .query_async(&mut conn)
            .await?;
        Ok(counts.into_iter().map(|count| count.max(0) as u64).sum())
    }

    #[instrument(skip(self), fields(worker = %worker))]
    async fn send_shutdown(&self, worker: &WorkerKey, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(command_key(worker))
            .arg(SHUTDOWN_COMMAND)
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(worker = %worker))]
    async fn clear_shutdown(&self, worker: &WorkerKey) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL")
            .arg(command_key(worker))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    #[instrument(skip(self, now))]
    async fn reap_stale_workers(
        &self,
        stale_threshold: Duration,
        now: DateTime<Utc>,
    ) -> Result<ReapReport, StoreError> {
        let mut conn = self.conn.clone();
        let flat: Vec<String> = self
            .scripts
            .reap
            .key(CAPABILITIES)
            .key(ACTIVE_COUNTERS)
            .key(LIFETIME_COUNTERS)
            .arg(now.timestamp_millis())
            .arg(millis(stale_threshold))
            .invoke_async(&mut conn)
            .await?;

        let mut report = ReapReport::default();
        for entry in flat.chunks_exact(3) {
            let worker = match WorkerKey::new(entry[1].as_str(), entry[2].as_str()) {
                Ok(worker) => worker,
                Err(e) => {
                    warn!(error = %e, "Reaped entry with an unparseable key");
                    continue;
                }
            };
            match entry[0].as_str() {
                "stale" => report.stale.push(worker),
                _ => report.orphaned.push(worker),
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_decode_record() {
        let key = WorkerKey::new("chromium", "w-1").unwrap();
        let fields = hash(&[
            (FIELD_ID, "w-1"),
            (FIELD_CAPABILITY, "chromium"),
            (FIELD_ENDPOINT, "ws://10.0.0.5:9222"),
            (FIELD_STATUS, "draining"),
            (FIELD_LAST_HEARTBEAT, "1700000005000"),
            (FIELD_REGISTERED_AT, "1700000000000"),
        ]);

        let record = decode_record(key.clone(), &fields).unwrap().unwrap();
        assert_eq!(record.key, key);
        assert_eq!(record.endpoint, "ws://10.0.0.5:9222");
        assert_eq!(record.status, WorkerStatus::Draining);
        assert_eq!(record.last_heartbeat.timestamp_millis(), 1_700_000_005_000);
        assert_eq!(record.registered_at.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_decode_expired_record_is_none() {
        let key = WorkerKey::new("chromium", "w-1").unwrap();
        assert!(decode_record(key, &HashMap::new()).unwrap().is_none());
    }

    #[test]
    fn test_decode_rejects_bad_fields() {
        let key = WorkerKey::new("chromium", "w-1").unwrap();
        let fields = hash(&[
            (FIELD_ENDPOINT, "ws://x"),
            (FIELD_STATUS, "available"),
            (FIELD_LAST_HEARTBEAT, "yesterday"),
            (FIELD_REGISTERED_AT, "0"),
        ]);
        assert!(matches!(
            decode_record(key.clone(), &fields),
            Err(StoreError::Corrupt { .. })
        ));

        let fields = hash(&[(FIELD_ENDPOINT, "ws://x")]);
        assert!(matches!(
            decode_record(key, &fields),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::from_millis(1500)), 1500);
        assert_eq!(millis(Duration::MAX), i64::MAX);
    }
}
