use bytes::Bytes;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Byte-rate budget in bytes/sec with a burst allowance. Waiters reserve
/// bytes up front and sleep out the deficit, so concurrent streams share the
/// budget fairly.
pub struct ByteBudget {
    rate_per_sec: f64,
    burst: usize,
    state: Mutex<BudgetState>,
}

struct BudgetState {
    tokens: f64,
    last: Instant,
}

impl ByteBudget {
    pub fn new(bytes_per_sec: u64, burst: Option<u64>) -> Self {
        let rate = bytes_per_sec.max(1) as f64;
        Self {
            rate_per_sec: rate,
            burst: burst.unwrap_or(bytes_per_sec).max(1) as usize,
            state: Mutex::new(BudgetState {
                tokens: burst.unwrap_or(bytes_per_sec).max(1) as f64,
                last: Instant::now(),
            }),
        }
    }

    pub fn burst(&self) -> usize {
        self.burst
    }

    /// Reserve `n` bytes, sleeping until the budget covers them. `n` must not
    /// exceed the burst (callers chunk to `burst()` first). Dropping the
    /// future cancels the wait.
    pub async fn wait_n(&self, n: usize) {
        let wait = {
            let now = Instant::now();
            let mut s = self.state.lock().expect("byte budget lock poisoned");
            let elapsed = now.saturating_duration_since(s.last).as_secs_f64();
            s.tokens = (s.tokens + elapsed * self.rate_per_sec).min(self.burst as f64);
            s.last = now;
            s.tokens -= n as f64;
            if s.tokens >= 0.0 {
                Duration::ZERO
            } else {
                Duration::from_secs_f64(-s.tokens / self.rate_per_sec)
            }
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

/// Per-route bandwidth shaper: independent request and response byte
/// budgets. Unlimited directions stay `None` and bodies pass through with no
/// wrapping at all.
pub struct BandwidthLimiter {
    request: Option<Arc<ByteBudget>>,
    response: Option<Arc<ByteBudget>>,
}

impl BandwidthLimiter {
    pub fn new(request: Option<Arc<ByteBudget>>, response: Option<Arc<ByteBudget>>) -> Self {
        Self { request, response }
    }

    pub fn wrap_request(&self, body: BoxBody) -> BoxBody {
        match &self.request {
            Some(budget) => shape_body(body, budget.clone()),
            None => body,
        }
    }

    pub fn wrap_response(&self, body: BoxBody) -> BoxBody {
        match &self.response {
            Some(budget) => shape_body(body, budget.clone()),
            None => body,
        }
    }

    pub fn limits_request(&self) -> bool {
        self.request.is_some()
    }

    pub fn limits_response(&self) -> bool {
        self.response.is_some()
    }
}

/// Wrap a body so every data frame is paced through the budget. Frames larger
/// than the burst are split so a single oversized chunk cannot blow past the
/// budget in one write. Non-data frames (trailers) pass through untouched.
fn shape_body(body: BoxBody, budget: Arc<ByteBudget>) -> BoxBody {
    struct ShapeState {
        body: BoxBody,
        budget: Arc<ByteBudget>,
        pending: VecDeque<Bytes>,
    }

    let state = ShapeState {
        body,
        budget,
        pending: VecDeque::new(),
    };

    let stream = futures_util::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(chunk) = st.pending.pop_front() {
                st.budget.wait_n(chunk.len()).await;
                let frame: Result<Frame<Bytes>, hyper::Error> = Ok(Frame::data(chunk));
                return Some((frame, st));
            }
            match st.body.frame().await {
                None => return None,
                Some(Err(e)) => return Some((Err(e), st)),
                Some(Ok(frame)) => match frame.into_data() {
                    Ok(mut data) => {
                        let burst = st.budget.burst();
                        while data.len() > burst {
                            st.pending.push_back(data.split_to(burst));
                        }
                        if !data.is_empty() {
                            st.pending.push_back(data);
                        }
                    }
                    Err(other) => return Some((Ok(other), st)),
                },
            }
        }
    });

    BodyExt::boxed(StreamBody::new(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;

    fn full_body(data: impl Into<Bytes>) -> BoxBody {
        Full::new(data.into()).map_err(|never| match never {}).boxed()
    }

    async fn collect(body: BoxBody) -> Bytes {
        body.collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn test_wait_n_is_instant_within_burst() {
        let budget = ByteBudget::new(1000, Some(100));
        let start = Instant::now();
        budget.wait_n(100).await;
        assert!(start.elapsed() < Duration::from_millis(5));
    }

    #[tokio::test]
    async fn test_wait_n_paces_over_budget() {
        // 1000 B/s, burst 10: a second 10-byte reservation needs ~10ms.
        let budget = ByteBudget::new(1000, Some(10));
        budget.wait_n(10).await;
        let start = Instant::now();
        budget.wait_n(10).await;
        assert!(start.elapsed() >= Duration::from_millis(5));
    }

    #[tokio::test]
    async fn test_shaped_body_preserves_content() {
        let budget = Arc::new(ByteBudget::new(1_000_000, Some(8)));
        let payload = Bytes::from(vec![7u8; 100]);
        let shaped = shape_body(full_body(payload.clone()), budget);
        assert_eq!(collect(shaped).await, payload);
    }

    #[tokio::test]
    async fn test_shaping_slows_throughput() {
        // 1000 B/s with a 50-byte burst: 150 bytes needs ~100ms beyond burst.
        let budget = Arc::new(ByteBudget::new(1000, Some(50)));
        let payload = Bytes::from(vec![1u8; 150]);

        let start = Instant::now();
        let collected = collect(shape_body(full_body(payload.clone()), budget)).await;
        assert_eq!(collected, payload);
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_unlimited_direction_passes_through() {
        let limiter = BandwidthLimiter::new(None, None);
        assert!(!limiter.limits_request());
        assert!(!limiter.limits_response());

        let payload = Bytes::from_static(b"untouched");
        let body = limiter.wrap_request(full_body(payload.clone()));
        assert_eq!(collect(body).await, payload);
    }

    #[tokio::test]
    async fn test_mixed_directions() {
        let limiter = BandwidthLimiter::new(
            Some(Arc::new(ByteBudget::new(1_000_000, None))),
            None,
        );
        assert!(limiter.limits_request());
        assert!(!limiter.limits_response());
    }
}
