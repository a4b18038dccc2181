use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Cloneable stop flag. Sleeping on it wakes up as soon as a stop is requested.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        let (flag, condvar) = &*self.inner;
        match flag.lock() {
            Ok(mut requested) => *requested = true,
            Err(poisoned) => *poisoned.into_inner() = true,
        }
        condvar.notify_all();
    }

    pub fn is_requested(&self) -> bool {
        let (flag, _) = &*self.inner;
        match flag.lock() {
            Ok(requested) => *requested,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Sleeps for up to `timeout`. Returns true if a stop was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, condvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut requested = match flag.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        while !*requested {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            requested = match condvar.wait_timeout(requested, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    /// Routes SIGINT/SIGTERM into this token. A second signal exits at once.
    pub fn install_signal_handler(&self) -> Result<(), String> {
        let shutdown = self.clone();
        ctrlc::set_handler(move || {
            if shutdown.is_requested() {
                warn!("Second interrupt received, exiting immediately");
                std::process::exit(130);
            }
            info!("Interrupt received, shutting down");
            shutdown.request();
        })
        .map_err(|err| format!("Failed to install signal handler: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wait_times_out_without_request() {
        let shutdown = Shutdown::new();
        let started = Instant::now();
        assert!(!shutdown.wait_timeout(Duration::from_millis(20)));
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert!(!shutdown.is_requested());
    }

    #[test]
    fn request_interrupts_long_wait() {
        let shutdown = Shutdown::new();
        let remote = shutdown.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.request();
        });

        let started = Instant::now();
        assert!(shutdown.wait_timeout(Duration::from_secs(30)));
        assert!(started.elapsed() < Duration::from_secs(5));
        handle.join().expect("join");
    }

    #[test]
    fn wait_returns_immediately_once_requested() {
        let shutdown = Shutdown::new();
        shutdown.request();
        assert!(shutdown.is_requested());
        assert!(shutdown.wait_timeout(Duration::from_secs(30)));
    }
}
