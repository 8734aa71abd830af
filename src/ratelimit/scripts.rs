//! # Redis Lua 脚本
//!
//! 所有时间取自 Redis 服务端 `TIME`，多个网关实例之间不依赖本机时钟。

use std::sync::LazyLock;

use crate::cache::LuaScript;

/// 滑动窗口
///
/// KEYS[1] 有序集合；ARGV: limit, window_ms, expiry_secs, count, member, mode。
/// 成员格式为 `ts:uuid:count`，求和时解析末尾的 count。
const SLIDING_WINDOW_SRC: &str = r"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local expiry = tonumber(ARGV[3])
local count = tonumber(ARGV[4])
local member = ARGV[5]
local mode = ARGV[6]

local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)

if mode ~= 'record' then
  local current = 0
  local members = redis.call('ZRANGE', key, 0, -1)
  for _, m in ipairs(members) do
    local c = tonumber(string.match(m, ':(%-?%d+)$'))
    current = current + (c or 1)
  end
  if current >= limit then
    return 0
  end
  if mode == 'peek' then
    return 1
  end
end

redis.call('ZADD', key, now, now .. ':' .. member .. ':' .. count)
redis.call('EXPIRE', key, expiry)
return 1
";

/// 并发计数加一
///
/// KEYS[1] 计数键；ARGV: limit, ttl_secs。ttl 防止进程崩溃后计数永久泄漏。
const CONCURRENCY_ACQUIRE_SRC: &str = r"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current >= tonumber(ARGV[1]) then
  return 0
end
redis.call('INCR', KEYS[1])
redis.call('EXPIRE', KEYS[1], tonumber(ARGV[2]))
return 1
";

/// 并发计数减一，不低于零
const CONCURRENCY_RELEASE_SRC: &str = r"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current <= 0 then
  return 0
end
return redis.call('DECR', KEYS[1])
";

/// 自然日计数
///
/// KEYS[1] 计数键（已包含日期）；ARGV: limit, count, expire_at, mode。
const DAILY_SRC: &str = r"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
local mode = ARGV[4]
if mode ~= 'record' then
  if current >= tonumber(ARGV[1]) then
    return 0
  end
  if mode == 'peek' then
    return 1
  end
end
redis.call('INCRBY', KEYS[1], tonumber(ARGV[2]))
redis.call('EXPIREAT', KEYS[1], tonumber(ARGV[3]))
return 1
";

/// 令牌桶
///
/// KEYS[1] 哈希 {tokens, ts}；ARGV: capacity, rate_per_sec, cost, ttl_ms。
/// 返回 {allowed, wait_ms}。
const TOKEN_BUCKET_SRC: &str = r"
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local cost = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)

local data = redis.call('HMGET', KEYS[1], 'tokens', 'ts')
local tokens = tonumber(data[1]) or capacity
local ts = tonumber(data[2]) or now
local elapsed = math.max(0, now - ts) / 1000
tokens = math.min(capacity, tokens + elapsed * rate)

local allowed = 0
local wait_ms = 0
if tokens >= cost then
  tokens = tokens - cost
  allowed = 1
elseif rate > 0 then
  wait_ms = math.ceil((cost - tokens) / rate * 1000)
  if wait_ms > 9007199254740991 then
    wait_ms = -1
  end
else
  wait_ms = -1
end

redis.call('HSET', KEYS[1], 'tokens', tostring(tokens), 'ts', now)
redis.call('PEXPIRE', KEYS[1], ttl)
return {allowed, wait_ms}
";

pub static SLIDING_WINDOW: LazyLock<LuaScript> = LazyLock::new(|| LuaScript::new(SLIDING_WINDOW_SRC));
pub static CONCURRENCY_ACQUIRE: LazyLock<LuaScript> =
    LazyLock::new(|| LuaScript::new(CONCURRENCY_ACQUIRE_SRC));
pub static CONCURRENCY_RELEASE: LazyLock<LuaScript> =
    LazyLock::new(|| LuaScript::new(CONCURRENCY_RELEASE_SRC));
pub static DAILY: LazyLock<LuaScript> = LazyLock::new(|| LuaScript::new(DAILY_SRC));
pub static TOKEN_BUCKET: LazyLock<LuaScript> = LazyLock::new(|| LuaScript::new(TOKEN_BUCKET_SRC));
