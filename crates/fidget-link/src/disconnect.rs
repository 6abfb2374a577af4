//! Disconnect sequencing.
//!
//! Teardown is best effort: every step logs its failure and moves on, and
//! the session always ends `Disconnected`.

use fidget_core::Command;
use tokio::time;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::session::LinkSession;
use crate::transport::Channel;

impl LinkSession {
    /// Gracefully disconnects from the device.
    ///
    /// 1. With a writer held: clock sync, `D`, settle. Otherwise `D` goes
    ///    through a temporary writer if the port is open and unlocked, and
    ///    the same settle follows when it was sent.
    /// 2. Cancel the streaming reader and give it time to notice.
    /// 3. Release both handles and wait again.
    /// 4. Force-unlock any handle that still reports itself locked.
    /// 5. Close the port, retrying once.
    /// 6. Clear the raw buffer, the processed data and the availability flag.
    pub async fn disconnect(&mut self) {
        info!("disconnecting from device");
        let timings = self.config.timings.clone();

        if let Some(writer) = self.writer.as_mut() {
            crate::handshake::sync_clock(writer, timings.clock_sync_settle()).await;
            match writer.send(&Command::Disconnect).await {
                Ok(()) => debug!("disconnect command sent"),
                Err(e) => warn!("failed to send disconnect command: {}", e),
            }
            time::sleep(timings.disconnect_settle()).await;
        } else if let Some(channel) = self.channel.as_ref().filter(|c| !c.is_writer_locked()) {
            if send_with_temporary_writer(channel, &Command::Disconnect).await {
                time::sleep(timings.disconnect_settle()).await;
            }
        }

        self.cancel.cancel();
        time::sleep(timings.cancel_grace()).await;

        if let Some(mut task) = self.reader_task.take() {
            match time::timeout(timings.lock_release_grace(), &mut task).await {
                Ok(Ok(exit)) => debug!("streaming reader stopped: {:?}", exit),
                Ok(Err(e)) => warn!("streaming reader task failed: {}", e),
                Err(_) => {
                    warn!("streaming reader did not stop in time");
                    task.abort();
                }
            }
        }
        self.writer = None;
        time::sleep(timings.lock_release_grace()).await;

        if let Some(channel) = self.channel.take() {
            let report = channel.force_unlock();
            if report.exercised() {
                warn!(
                    "force unlocked port {} (reader: {}, writer: {})",
                    channel.name(),
                    report.reader,
                    report.writer
                );
            }
            close_with_retry(&channel, timings.close_retry()).await;
        }

        self.clear_session_data();
        self.enter_disconnected();
        info!("disconnected");
    }

    /// Closes the port after a registration-only handshake. The device was
    /// never told to stream, so no disconnect command is sent.
    pub async fn close_after_init(&mut self) {
        info!("closing port after initialization");
        self.sync_clock().await;
        self.writer = None;
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }

        if let Some(channel) = self.channel.take() {
            close_with_retry(&channel, self.config.timings.close_retry()).await;
        }
        self.enter_disconnected();
    }
}

/// Returns whether the command went out.
async fn send_with_temporary_writer(channel: &Channel, command: &Command) -> bool {
    match channel.acquire_writer() {
        Ok(mut writer) => {
            let sent = writer.send(command).await;
            writer.release();
            match sent {
                Ok(()) => {
                    debug!("{} sent through a temporary writer", command);
                    true
                }
                Err(e) => {
                    warn!("failed to send {} through a temporary writer: {}", command, e);
                    false
                }
            }
        }
        Err(e) => {
            warn!("no writer available for {}: {}", command, e);
            false
        }
    }
}

/// Gives up after one retry rather than waiting on a stuck handle.
async fn close_with_retry(channel: &Channel, retry: std::time::Duration) {
    match channel.close() {
        Ok(()) => {}
        Err(TransportError::StillLocked(which)) => {
            debug!("{} stream still locked, retrying close", which);
            time::sleep(retry).await;
            if let Err(e) = channel.close() {
                warn!("abandoning close of port {}: {}", channel.name(), e);
            }
        }
        Err(e) => warn!("failed to close port {}: {}", channel.name(), e),
    }
}
