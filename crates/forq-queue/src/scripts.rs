//! Server-side Lua primitives.
//!
//! Each script is one atomic step of the storage contract: a payload is
//! either in its queue list, in exactly one node's backup list, in a
//! scheduled set, or gone.

/// Move up to ARGV[1] payloads from the tail of the queue list (KEYS[1])
/// into the head of the node's backup list (KEYS[2]); returns the payloads.
pub const DEQUEUE: &str = r#"
local fetched = {}
for _ = 1, tonumber(ARGV[1]) do
  local payload = redis.call('RPOPLPUSH', KEYS[1], KEYS[2])
  if not payload then break end
  fetched[#fetched + 1] = payload
end
return fetched
"#;

/// Pop every member of the sorted set (KEYS[1]) whose score is at or below
/// ARGV[1] and push it onto its target queue list. The ZREM guard makes the
/// migration at-most-once under concurrent callers.
pub const DESCHEDULE: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
local moved = 0
for _, payload in ipairs(due) do
  if redis.call('ZREM', KEYS[1], payload) == 1 then
    local queue = 'default'
    local ok, decoded = pcall(cjson.decode, payload)
    if ok and type(decoded) == 'table' and type(decoded['queue']) == 'string' then
      queue = decoded['queue']
    end
    redis.call('LPUSH', 'queue:' .. queue, payload)
    redis.call('SADD', 'queues', queue)
    moved = moved + 1
  end
end
return moved
"#;

/// Take the unique lock (KEYS[1]) for jid ARGV[1] with a TTL of ARGV[2]
/// milliseconds, or report the current holder. Returns the holding jid
/// either way.
pub const LOCK: &str = r#"
if redis.call('SET', KEYS[1], ARGV[1], 'NX', 'PX', ARGV[2]) then
  return ARGV[1]
end
return redis.call('GET', KEYS[1])
"#;

/// Delete the unique lock (KEYS[1]) only while it is still held by jid
/// ARGV[1], so a racing holder's lock is never released.
pub const UNLOCK: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Drain a backup list (KEYS[1]) back onto the tail of its queue list
/// (KEYS[2]), preserving the order payloads were fetched in.
pub const RESURRECT: &str = r#"
local moved = 0
while true do
  local payload = redis.call('LPOP', KEYS[1])
  if not payload then break end
  redis.call('RPUSH', KEYS[2], payload)
  moved = moved + 1
end
return moved
"#;
