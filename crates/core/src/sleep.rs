use rand::Rng;
use std::thread;
use std::time::Duration;

use crate::cancel::CancellationToken;

/// `base` with +/-30% random jitter, never below 10ms.
pub fn jittered(base: Duration) -> Duration {
    let secs = base.as_secs_f64();
    if secs <= 0.0 {
        return Duration::from_millis(10);
    }
    let jitter = secs * 0.3;
    let actual = secs + rand::thread_rng().gen_range(-jitter..jitter);
    Duration::from_secs_f64(actual.max(0.01))
}

/// Sleep for `base` with +/-30% random jitter.
pub fn sleep_jitter(base: Duration) {
    thread::sleep(jittered(base));
}

/// Jittered sleep that returns early (with `true`) once `token` is raised.
pub fn sleep_jitter_unless(token: &CancellationToken, base: Duration) -> bool {
    token.wait(jittered(base))
}
