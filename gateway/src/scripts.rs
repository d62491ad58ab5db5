//! Lua sources executed atomically by the Redis backend.
//!
//! Each script is loaded once into a `redis::Script`, which sends EVALSHA and
//! falls back to EVAL when the server has not cached it yet.

/// KEYS[1] bucket hash. ARGV: rate (tokens/s), burst, now (ms), requested.
/// Returns `{allowed, tokens}`.
pub const TOKEN_BUCKET: &str = r#"
local key = KEYS[1]
local rate = tonumber(ARGV[1])
local burst = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local requested = tonumber(ARGV[4])

local state = redis.call('HMGET', key, 'tokens', 'lastRefill')
local tokens = tonumber(state[1])
local last_refill = tonumber(state[2])
if tokens == nil or last_refill == nil then
    tokens = burst
    last_refill = now
end

local elapsed = math.max(0, now - last_refill)
local refill = math.floor(elapsed * rate / 1000)
tokens = math.min(burst, tokens + refill)

local allowed = 0
if tokens >= requested then
    tokens = tokens - requested
    allowed = 1
end

redis.call('HSET', key, 'tokens', tokens, 'lastRefill', now)

local ttl = burst + 1
if rate > 0 then
    ttl = math.ceil(burst / rate) + 1
end
redis.call('EXPIRE', key, ttl)

return {allowed, tokens}
"#;

/// KEYS[1] sorted set. ARGV: window (s), limit, now (ms), member.
/// Returns `{admitted, count}`.
pub const SLIDING_WINDOW: &str = r#"
local key = KEYS[1]
local window = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local member = ARGV[4]

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window * 1000)
local count = redis.call('ZCARD', key)
if count < limit then
    redis.call('ZADD', key, now, member)
    redis.call('EXPIRE', key, window + 1)
    return {1, count + 1}
end
return {0, count}
"#;

/// KEYS[1] entry hash. ARGV: reason, timestamp, ttl (s, <= 0 is permanent).
pub const BLACKLIST_ADD: &str = r#"
local key = KEYS[1]
redis.call('HSET', key, 'reason', ARGV[1], 'timestamp', ARGV[2])
local ttl = tonumber(ARGV[3])
if ttl > 0 then
    redis.call('EXPIRE', key, ttl)
else
    redis.call('PERSIST', key)
end
return 1
"#;

/// KEYS[1] lock key. ARGV[1] owner token. Deletes only when the owner matches.
pub const LOCK_RELEASE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;
