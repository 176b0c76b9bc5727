//! Server-side scripts for every multi-key mutation.
//!
//! Each script receives the run's keys in [`RunKeys::all`] order and the TTL
//! in seconds as `ARGV[1]`, checks that the run still exists and refreshes
//! the expiry of every key it was given.
//!
//! [`RunKeys::all`]: super::codec::RunKeys::all

use std::sync::LazyLock;

use redis::Script;

macro_rules! run_script {
    ($body:literal) => {
        LazyLock::new(|| {
            Script::new(concat!(
                r#"
local function touch()
  local ttl = tonumber(ARGV[1])
  if ttl > 0 then
    for i = 1, #KEYS do redis.call('EXPIRE', KEYS[i], ttl) end
  end
end
local function is_terminal(status)
  return status == 'succeeded' or status == 'failed' or status == 'cancelled'
end
"#,
                $body
            ))
        })
    };
}

/// Result codes returned by the status scripts.
pub const OK: i64 = 0;
pub const NOT_FOUND: i64 = 1;
pub const TERMINAL: i64 = 2;

/// Allocate the next sequence and add the event to the capped stream in one
/// step. ARGV: ttl, maxlen, type, node_id, timestamp, data.
/// Returns the sequence, or nil when the run does not exist.
pub static APPEND_EVENT: LazyLock<Script> = run_script!(
    r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return false end
local seq = redis.call('INCR', KEYS[2])
local fields = {'type', ARGV[3], 'timestamp', ARGV[5], 'data', ARGV[6]}
if ARGV[4] ~= '' then
  fields[#fields + 1] = 'node_id'
  fields[#fields + 1] = ARGV[4]
end
redis.call('XADD', KEYS[3], 'MAXLEN', ARGV[2], seq .. '-0', unpack(fields))
redis.call('HSET', KEYS[1], 'updated_at', ARGV[5])
touch()
return seq
"#
);

/// ARGV: ttl, status, started_at, finished_at, error, now.
/// Returns `{code, status}` where status is the one in effect afterwards.
pub static UPDATE_STATUS: LazyLock<Script> = run_script!(
    r#"
local current = redis.call('HGET', KEYS[1], 'status')
if not current then return {1, ''} end
if is_terminal(current) then
  if current == ARGV[2] then return {0, current} end
  return {2, current}
end
redis.call('HSET', KEYS[1], 'status', ARGV[2], 'updated_at', ARGV[6])
if ARGV[3] ~= '' then redis.call('HSET', KEYS[1], 'started_at', ARGV[3]) end
if ARGV[4] ~= '' then redis.call('HSET', KEYS[1], 'finished_at', ARGV[4]) end
if ARGV[5] ~= '' then redis.call('HSET', KEYS[1], 'error', ARGV[5]) end
touch()
return {0, ARGV[2]}
"#
);

/// ARGV: ttl, now. Returns `{code, status}`; `TERMINAL` means the run had
/// already finished and nothing changed. Records the last sequence allocated
/// before the cancel as `cancel_seq`; tail readers deliver nothing past it.
pub static CANCEL_RUN: LazyLock<Script> = run_script!(
    r#"
local current = redis.call('HGET', KEYS[1], 'status')
if not current then return {1, ''} end
if is_terminal(current) then return {2, current} end
local seq = redis.call('GET', KEYS[2]) or '0'
redis.call('HSET', KEYS[1], 'status', 'cancelled', 'cancelled', '1',
  'cancel_seq', seq, 'finished_at', ARGV[2], 'updated_at', ARGV[2])
touch()
return {0, 'cancelled'}
"#
);

/// Replace the node-state blob. ARGV: ttl, json, now. Returns 1, or 0 when
/// the run does not exist.
pub static WRITE_NODES: LazyLock<Script> = run_script!(
    r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
redis.call('SET', KEYS[4], ARGV[2])
redis.call('HSET', KEYS[1], 'updated_at', ARGV[3])
touch()
return 1
"#
);

/// Store one node's outputs. ARGV: ttl, node_id, json, now. Returns 1, or 0
/// when the run does not exist.
pub static WRITE_OUTPUTS: LazyLock<Script> = run_script!(
    r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
redis.call('HSET', KEYS[5], ARGV[2], ARGV[3])
redis.call('HSET', KEYS[1], 'updated_at', ARGV[4])
touch()
return 1
"#
);
