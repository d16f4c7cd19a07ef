use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::types::OutputBlob;

/// Default ceiling on the size of a single streamed chunk.
pub const DEFAULT_MESSAGE_SIZE: usize = 1024;

/// How often an idle reader re-checks the buffer for new data.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// An `OutputStreamer` collects the combined stdout/stderr of one job and
/// fans it out to clients who want to read that data as a stream. Callers of
/// `new_reader` get a channel that will receive every byte written since the
/// streamer was created, in write order, no matter how late they subscribe.
///
/// Once `close_writer` has been called no further data is accepted, and
/// readers terminate after draining to the end of the buffer. The buffer is
/// never truncated, so a finished job can be replayed any number of times.
pub struct OutputStreamer {
    output: RwLock<Vec<u8>>,
    length: AtomicUsize,
    writer_closed: AtomicBool,
    message_size: usize,
}

impl Default for OutputStreamer {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputStreamer {
    pub fn new() -> Self {
        Self::with_message_size(DEFAULT_MESSAGE_SIZE)
    }

    pub fn with_message_size(message_size: usize) -> Self {
        assert!(message_size > 0, "stream message size must be greater than 0");
        Self {
            output: RwLock::new(Vec::new()),
            length: AtomicUsize::new(0),
            writer_closed: AtomicBool::new(false),
            message_size,
        }
    }

    /// Append data to the buffer. Returns the number of bytes accepted,
    /// which is always the full input on success.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let mut output = self.output.write().expect("output lock poisoned");
        if self.writer_closed.load(Ordering::Acquire) {
            return Err(Error::WriterClosed);
        }
        output.extend_from_slice(data);
        self.length.store(output.len(), Ordering::Release);
        Ok(data.len())
    }

    /// Declare that no further data will be written. Idempotent.
    ///
    /// Taking the write lock here serializes the close against in-flight
    /// writes: once this returns, the observable length is final.
    pub fn close_writer(&self) {
        let _output = self.output.write().expect("output lock poisoned");
        self.writer_closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.writer_closed.load(Ordering::Acquire)
    }

    /// Total bytes written so far.
    pub fn len(&self) -> usize {
        self.length.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Next chunk starting at `index`, at most `message_size` bytes. The
    // chunk is copied out so readers never alias the live buffer.
    fn next(&self, index: usize) -> Option<OutputBlob> {
        if index >= self.length.load(Ordering::Acquire) {
            return None;
        }
        let output = self.output.read().expect("output lock poisoned");
        let end = usize::min(index + self.message_size, output.len());
        Some(OutputBlob::copy_from_slice(&output[index..end]))
    }

    /// Subscribe to the buffer from offset 0.
    ///
    /// The returned channel receives chunks of at most `message_size` bytes
    /// until either the reader's token is cancelled or the reader has caught
    /// up to a closed writer, at which point the channel closes. A reader
    /// that lags behind the writer checks for new data at least once per
    /// second; while it lags it sends without waiting on the tick.
    pub fn new_reader(self: &Arc<Self>, cancel: CancellationToken) -> mpsc::Receiver<OutputBlob> {
        let (tx, rx) = mpsc::channel(2);
        let streamer = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = interval(POLL_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut index = 0;
            loop {
                if let Some(chunk) = streamer.next(index) {
                    index += chunk.len();
                    if tx.send(chunk).await.is_err() {
                        // receiver dropped, nobody is listening anymore
                        return;
                    }
                    continue;
                }
                // The closed flag is checked before the length: the close is
                // serialized behind every write, so a true flag means the
                // length we compare against is final.
                if streamer.writer_closed.load(Ordering::Acquire)
                    && index == streamer.length.load(Ordering::Acquire)
                {
                    return;
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
            }
        });

        rx
    }
}
