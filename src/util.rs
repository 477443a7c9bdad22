use core::time::Duration;

/// Retries the supplied function until it returns `Ok` or the supplied
/// maximum retry limit is reached, sleeping `interval` between attempts.
pub async fn retry_loop<F, Fut, T, E>(mut func: F, max_tries: u32, interval: Duration) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut tries = 0;

    loop {
        match func().await {
            ok @ Ok(_) => return ok,
            err @ Err(_) => {
                tries += 1;

                if tries >= max_tries {
                    return err;
                }
                tokio::time::sleep(interval).await;
            }
        }
    }
}

/// Exponential backoff schedule for transport retries: the interval doubles
/// per attempt and is capped at `max_interval`; the iterator ends when the
/// attempt budget is spent.
pub struct ExponentialBackoff {
    interval: Duration,
    max_interval: Duration,
    attempts_left: u32,
}

impl ExponentialBackoff {
    pub fn new(interval: Duration, max_interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_interval,
            attempts_left: max_attempts,
        }
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.attempts_left == 0 {
            return None;
        }
        self.attempts_left -= 1;

        let current = self.interval.min(self.max_interval);
        self.interval = (self.interval * 2).min(self.max_interval);
        Some(current)
    }
}
