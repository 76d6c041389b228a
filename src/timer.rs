use std::time::{Duration, Instant};
#[cfg(windows)]
use winapi::um::timeapi;

/// Wakes its caller once per configured sampling interval.
///
/// Each call to `next()` sleeps until the next interval boundary measured
/// from `start`, so a slow tick is made up on the following one rather than
/// compounding drift; if a tick still can't catch up, `Err` reports by how
/// much it fell behind instead of sleeping a negative duration.
pub struct Timer {
    start: Instant,
    interval: Duration,
    desired: Duration,
}

impl Timer {
    pub fn new(rate: f64) -> Timer {
        // This changes a system-wide setting on Windows so that the OS wakes up every 1ms
        // instead of the default 15.6ms. This is required to have a sleep call
        // take less than 15ms, which we need since we usually profile at more than 64hz.
        #[cfg(windows)]
        unsafe { timeapi::timeBeginPeriod(1); }

        Timer {
            start: Instant::now(),
            interval: Duration::from_secs_f64(1.0 / rate),
            desired: Duration::from_secs(0),
        }
    }
}

impl Iterator for Timer {
    type Item = Result<Duration, Duration>;

    fn next(&mut self) -> Option<Self::Item> {
        let elapsed = self.start.elapsed();

        // Since we want to account for the amount of time sampling itself
        // takes, we track when we should sleep to (rather than sleeping the
        // fixed interval from whenever `next()` happens to be called).
        self.desired += self.interval;

        if self.desired > elapsed {
            let sleep_for = self.desired - elapsed;
            std::thread::sleep(sleep_for);
            Some(Ok(sleep_for))
        } else {
            Some(Err(elapsed - self.desired))
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        #[cfg(windows)]
        unsafe { timeapi::timeEndPeriod(1); }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_matches_requested_rate() {
        let timer = Timer::new(1000.0);
        assert_eq!(timer.interval, Duration::from_millis(1));
    }
}
