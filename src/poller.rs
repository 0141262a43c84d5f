//! A background poller thread that periodically fetches flag definitions and stores them in a
//! definitions store.
use std::{
    sync::{
        mpsc::{Receiver, RecvTimeoutError, SyncSender},
        Arc,
    },
    time::Duration,
};

use crate::{definitions_fetcher::DefinitionsSource, definitions_store::DefinitionsStore};
use crate::{Error, Result};

/// Configuration for [`PollerThread`].
#[derive(Debug, Clone)]
pub struct PollerThreadConfig {
    /// Interval to wait between requests for flag definitions.
    ///
    /// Defaults to [`PollerThreadConfig::DEFAULT_POLL_INTERVAL`].
    pub interval: Duration,
}

impl PollerThreadConfig {
    /// Default value for [`PollerThreadConfig::interval`].
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

    /// Create a new `PollerThreadConfig` using default configuration.
    pub fn new() -> PollerThreadConfig {
        PollerThreadConfig::default()
    }

    /// Update poll interval with `interval`.
    pub fn with_interval(mut self, interval: Duration) -> PollerThreadConfig {
        self.interval = interval;
        self
    }
}

impl Default for PollerThreadConfig {
    fn default() -> PollerThreadConfig {
        PollerThreadConfig {
            interval: PollerThreadConfig::DEFAULT_POLL_INTERVAL,
        }
    }
}

/// A flag definitions poller thread.
///
/// The thread waits one interval, fetches definitions from a [`DefinitionsSource`] and stores them
/// in a [`DefinitionsStore`], and repeats until stopped. Fetch failures and panics raised by the
/// source are logged and retried on the next tick. Polls never overlap since a single thread
/// performs them. A zero interval is replaced by [`PollerThreadConfig::DEFAULT_POLL_INTERVAL`].
pub struct PollerThread {
    join_handle: std::thread::JoinHandle<()>,

    /// Used to send a stop command to the poller thread.
    stop_sender: SyncSender<()>,

    /// Receives a single message when the thread exits: `true` if it panicked.
    exited: Receiver<bool>,
}

impl PollerThread {
    /// How long [`PollerThread::shutdown`] waits for the thread to exit.
    pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

    /// Starts the poller thread.
    ///
    /// # Errors
    ///
    /// - IO Error if poller thread failed to start.
    pub fn start(
        source: Arc<dyn DefinitionsSource>,
        store: Arc<DefinitionsStore>,
        config: PollerThreadConfig,
    ) -> std::io::Result<PollerThread> {
        // Buffer size of 1 is enough as we only ever send a stop command, and `try_send()` can
        // be ignored if the buffer is full (a stop command is already pending).
        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);
        let (exit_sender, exited) = std::sync::mpsc::sync_channel::<bool>(1);

        let interval = if config.interval.is_zero() {
            log::warn!(target: "mixpanel", default_ms = PollerThreadConfig::DEFAULT_POLL_INTERVAL.as_millis() as u64; "zero poll interval, using the default");
            PollerThreadConfig::DEFAULT_POLL_INTERVAL
        } else {
            config.interval
        };

        let join_handle = std::thread::Builder::new()
            .name("mixpanel-flags-poller".to_owned())
            .spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| loop {
                    match stop_receiver.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            // Timed out. Fetch new definitions below.
                        }
                        Ok(()) => {
                            log::debug!(target: "mixpanel", "poller thread received stop command");
                            return;
                        }
                        Err(RecvTimeoutError::Disconnected) => {
                            log::debug!(target: "mixpanel", "poller thread received disconnected");
                            return;
                        }
                    }

                    log::debug!(target: "mixpanel", "polling flag definitions");
                    // Errors are logged by the store. A panicking source only loses this tick.
                    let refreshed = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        store.refresh_from(source.as_ref())
                    }));
                    if refreshed.is_err() {
                        log::error!(target: "mixpanel", "definitions source panicked, skipping this poll");
                    }
                }));

                if result.is_err() {
                    log::error!(target: "mixpanel", "poller thread panicked");
                }
                let _ = exit_sender.try_send(result.is_err());
            })?;

        Ok(PollerThread {
            join_handle,
            stop_sender,
            exited,
        })
    }

    /// Stop the poller thread.
    ///
    /// This function does not wait for the thread to actually stop.
    pub fn stop(&self) {
        // Error means that the receiver was dropped (thread exited) or the channel buffer is
        // full (a stop command was sent already). Either way the thread is stopping.
        let _ = self.stop_sender.try_send(());
    }

    /// Stop the poller thread and wait up to [`PollerThread::DEFAULT_SHUTDOWN_TIMEOUT`] for it to
    /// exit.
    ///
    /// # Errors
    ///
    /// - [`Error::PollerThreadPanicked`] if the thread has panicked.
    pub fn shutdown(self) -> Result<()> {
        self.shutdown_timeout(PollerThread::DEFAULT_SHUTDOWN_TIMEOUT)
    }

    /// Stop the poller thread and wait up to `timeout` for it to exit.
    ///
    /// A thread still busy with a fetch when `timeout` elapses is detached. It exits on its own
    /// once the fetch completes.
    ///
    /// # Errors
    ///
    /// - [`Error::PollerThreadPanicked`] if the thread has panicked.
    pub fn shutdown_timeout(self, timeout: Duration) -> Result<()> {
        // Send stop signal in case it wasn't sent before.
        self.stop();

        match self.exited.recv_timeout(timeout) {
            Ok(panicked) => {
                self.join_handle
                    .join()
                    .map_err(|_| Error::PollerThreadPanicked)?;
                if panicked {
                    return Err(Error::PollerThreadPanicked);
                }
                Ok(())
            }
            Err(RecvTimeoutError::Disconnected) => {
                // The thread died without reporting, which only happens if it panicked outside of
                // the guarded loop.
                let _ = self.join_handle.join();
                Err(Error::PollerThreadPanicked)
            }
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(target: "mixpanel", timeout_ms = timeout.as_millis() as u64; "poller thread did not stop in time, detaching it");
                Ok(())
            }
        }
    }
}
