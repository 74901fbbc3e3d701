use e2e_model::PollPolicy;
use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// A poll that ran out of time. `last` holds what the final attempt reported.
#[derive(Debug, Clone, PartialEq)]
pub struct Exhausted<S> {
    pub attempts: u32,
    pub elapsed: Duration,
    pub last: Option<S>,
}

/// Calls `probe` every `policy.interval` until it breaks or `policy.deadline` has passed since
/// the first call. The probe always runs at least once and never starts after the deadline.
pub async fn poll_until<T, S, F, Fut>(
    policy: &PollPolicy,
    mut probe: F,
) -> Result<(T, Duration), Exhausted<S>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ControlFlow<T, S>>,
{
    let start = Instant::now();
    let deadline = start + policy.deadline;
    let mut attempts = 0;
    loop {
        attempts += 1;
        let last = match probe().await {
            ControlFlow::Break(value) => return Ok((value, start.elapsed())),
            ControlFlow::Continue(state) => state,
        };
        let next = Instant::now() + policy.interval;
        if next > deadline {
            return Err(Exhausted {
                attempts,
                elapsed: start.elapsed(),
                last: Some(last),
            });
        }
        sleep_until(next).await;
    }
}
