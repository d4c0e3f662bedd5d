use super::Decision;
use rand::Rng;
use redis::aio::ConnectionManager;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Timeout for a single Redis script round trip. A slow or partitioned Redis
/// must not stall the request path.
const REDIS_DEADLINE: Duration = Duration::from_millis(100);

/// Atomic sliding-window admission over a Redis sorted set:
/// trim expired members, count, conditionally add a unique member, refresh
/// the key TTL, and report remaining/reset in one round trip.
const WINDOW_SCRIPT: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], 0, tonumber(ARGV[1]) - tonumber(ARGV[2]))
local count = redis.call('ZCARD', KEYS[1])
local limit = tonumber(ARGV[3])
if count < limit then
    redis.call('ZADD', KEYS[1], ARGV[1], ARGV[1] .. '-' .. ARGV[4])
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
    return {1, limit - count - 1, tonumber(ARGV[1]) + tonumber(ARGV[2])}
end
local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
local reset = tonumber(ARGV[1]) + tonumber(ARGV[2])
if oldest[2] then
    reset = tonumber(oldest[2]) + tonumber(ARGV[2])
end
return {0, 0, reset}
"#;

/// Sliding-window limiter shared across gateway instances through Redis.
///
/// On any Redis failure (network, timeout, script error) the limiter fails
/// open and admits the request — availability over strictness; the event is
/// logged and counted so operators can see when enforcement degrades.
pub struct DistributedWindowLimiter {
    conn: ConnectionManager,
    script: redis::Script,
    key_prefix: String,
    limit: u64,
    window: Duration,
}

impl DistributedWindowLimiter {
    pub async fn connect(
        url: &str,
        key_prefix: impl Into<String>,
        limit: u64,
        window: Duration,
    ) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            script: redis::Script::new(WINDOW_SCRIPT),
            key_prefix: key_prefix.into(),
            limit: limit.max(1),
            window,
        })
    }

    pub async fn allow(&self, key: &str) -> Decision {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let window_ms = self.window.as_millis() as u64;
        let tag: u64 = rand::thread_rng().gen();

        let mut conn = self.conn.clone();
        let mut invocation = self.script.key(format!("{}{}", self.key_prefix, key));
        invocation
            .arg(now_ms)
            .arg(window_ms)
            .arg(self.limit)
            .arg(tag);

        let result = tokio::time::timeout(
            REDIS_DEADLINE,
            invocation.invoke_async::<_, Vec<i64>>(&mut conn),
        )
        .await;
        match result {
            Ok(Ok(reply)) if reply.len() == 3 => {
                let allowed = reply[0] == 1;
                let remaining = reply[1].max(0) as u64;
                let reset_at = UNIX_EPOCH + Duration::from_millis(reply[2].max(0) as u64);
                if allowed {
                    Decision::allow(self.limit, remaining, reset_at)
                } else {
                    let retry_after = reset_at
                        .duration_since(SystemTime::now())
                        .unwrap_or(Duration::from_secs(1));
                    Decision::deny(self.limit, reset_at, retry_after)
                }
            }
            Ok(Ok(reply)) => {
                warn!(
                    "distributed rate limit: unexpected script reply of {} values, failing open",
                    reply.len()
                );
                self.fail_open()
            }
            Ok(Err(e)) => {
                warn!("distributed rate limit: redis error, failing open: {}", e);
                metrics::counter!("gateway_rate_limit_fail_open_total").increment(1);
                self.fail_open()
            }
            Err(_) => {
                warn!(
                    "distributed rate limit: redis deadline ({:?}) exceeded, failing open",
                    REDIS_DEADLINE
                );
                metrics::counter!("gateway_rate_limit_fail_open_total").increment(1);
                self.fail_open()
            }
        }
    }

    fn fail_open(&self) -> Decision {
        Decision::allow(self.limit, self.limit, SystemTime::now() + self.window)
    }
}
