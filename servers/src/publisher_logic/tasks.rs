//! Periodic publishing, one task per discovered subscription.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Running publishers keyed by subscription name.
pub struct PublishTasks {
    label: &'static str,
    interval: Duration,
    running: Mutex<HashMap<String, CancellationToken>>,
}

impl PublishTasks {
    pub fn new(label: &'static str, interval: Duration) -> Self {
        Self {
            label,
            interval,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Starts calling `tick(count)` for `name` right away and then every
    /// interval. Returns false if a task for `name` is already running.
    pub fn start<F>(&self, name: &str, mut tick: F) -> bool
    where
        F: FnMut(u64) + Send + 'static,
    {
        let mut running = self.running.lock().expect("PublishTasks lock poisoned");
        if running.contains_key(name) {
            log::debug!("{} publisher for '{}' already running", self.label, name);
            return false;
        }
        let token = CancellationToken::new();
        running.insert(name.to_string(), token.clone());
        drop(running);

        let interval = self.interval;
        let label = self.label;
        let name = name.to_string();
        log::info!("Starting {} publisher for '{}'", label, name);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut count: u64 = 0;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        tick(count);
                        count += 1;
                    }
                }
            }
            log::info!("Stopped {} publisher for '{}'", label, name);
        });
        true
    }

    pub fn stop(&self, name: &str) -> bool {
        match self.running.lock().expect("PublishTasks lock poisoned").remove(name) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        for (_, token) in self.running.lock().expect("PublishTasks lock poisoned").drain() {
            token.cancel();
        }
    }

    pub fn running(&self) -> Vec<String> {
        let mut names: Vec<String> = self.running.lock().expect("PublishTasks lock poisoned").keys().cloned().collect();
        names.sort();
        names
    }
}

impl Drop for PublishTasks {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_until_stopped() {
        let tasks = PublishTasks::new("record", Duration::from_secs(5));
        let counts = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&counts);

        assert!(tasks.start("record/a", move |n| sink.lock().unwrap().push(n)));
        assert!(!tasks.start("record/a", |_| {}));
        assert_eq!(tasks.running(), vec!["record/a".to_string()]);

        tokio::time::sleep(Duration::from_millis(10_100)).await;
        assert_eq!(*counts.lock().unwrap(), vec![0, 1, 2]);

        assert!(tasks.stop("record/a"));
        assert!(!tasks.stop("record/a"));
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(counts.lock().unwrap().len(), 3);
    }
}
