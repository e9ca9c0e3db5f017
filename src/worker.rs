use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Join `handle`, giving up after `timeout`. A thread that does not finish
/// in time is left detached. Returns whether the join happened.
pub fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) -> bool {
    let name = handle.thread().name().unwrap_or("worker").to_string();
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            log::warn!("Thread '{name}' did not stop within {timeout:?}; detaching it");
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
    if handle.join().is_err() {
        log::error!("Thread '{name}' panicked");
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_finished_thread() {
        let handle = thread::spawn(|| {});
        assert!(join_with_timeout(handle, Duration::from_secs(1)));
    }

    #[test]
    fn gives_up_on_stuck_thread() {
        let handle = thread::spawn(|| thread::sleep(Duration::from_millis(500)));
        let started = Instant::now();
        assert!(!join_with_timeout(handle, Duration::from_millis(50)));
        assert!(started.elapsed() < Duration::from_millis(400));
    }
}
