//! Lua scripts for the Redis signal store.
//!
//! Each script runs atomically on the server, so concurrent relays never
//! observe a half-trimmed or half-purged stream log.

/// Append one entry and trim the log to its retention cap.
///
/// Arguments:
/// - KEYS[1]: Stream log key (e.g., `airwave:stream:{id}:signals`)
/// - ARGV[1]: Entry (JSON string)
/// - ARGV[2]: Retention cap
///
/// Returns: the log length after trimming.
pub const APPEND_SIGNAL: &str = r#"
local cap = tonumber(ARGV[2])
if cap == nil or cap <= 0 then
    return redis.error_reply('invalid retention cap')
end

redis.call('RPUSH', KEYS[1], ARGV[1])
redis.call('LTRIM', KEYS[1], -cap, -1)
return redis.call('LLEN', KEYS[1])
"#;

/// Remove every entry sent by one peer.
///
/// Arguments:
/// - KEYS[1]: Stream log key
/// - ARGV[1]: Sender id
///
/// Returns: number of entries removed. Undecodable entries are left alone.
pub const PURGE_SENDER: &str = r#"
local entries = redis.call('LRANGE', KEYS[1], 0, -1)
local removed = 0

for _, entry in ipairs(entries) do
    local ok, decoded = pcall(cjson.decode, entry)
    if ok and type(decoded) == 'table' and decoded['sender_id'] == ARGV[1] then
        removed = removed + redis.call('LREM', KEYS[1], 1, entry)
    end
end

return removed
"#;

/// Delete a stream's whole log.
///
/// Arguments:
/// - KEYS[1]: Stream log key
///
/// Returns: number of entries that were in the log.
pub const PURGE_STREAM: &str = r#"
local count = redis.call('LLEN', KEYS[1])
redis.call('DEL', KEYS[1])
return count
"#;
