use std::sync::{Mutex, mpsc};
use std::thread;

use tracing::{debug, warn};

use super::{Snapshot, SnapshotStore};

enum WriterMessage {
    Save(Snapshot),
    Flush(mpsc::Sender<()>),
}

/// Background snapshot writer.
///
/// Captures are queued and saved on a dedicated thread so that commands never
/// wait for (or fail because of) snapshot storage. Failures are logged.
#[derive(Debug)]
pub struct SnapshotWriter {
    tx: Mutex<Option<mpsc::Sender<WriterMessage>>>,
    join: Mutex<Option<thread::JoinHandle<()>>>,
}

impl SnapshotWriter {
    pub fn spawn<S>(store: S) -> Self
    where
        S: SnapshotStore + 'static,
    {
        let (tx, rx) = mpsc::channel::<WriterMessage>();

        let join = thread::Builder::new()
            .name("snapshot-writer".to_string())
            .spawn(move || writer_loop(store, rx))
            .expect("failed to spawn snapshot writer thread");

        Self {
            tx: Mutex::new(Some(tx)),
            join: Mutex::new(Some(join)),
        }
    }

    /// Queue a snapshot for saving.
    pub fn submit(&self, snapshot: Snapshot) {
        let stream = snapshot.stream_id.clone();
        let sent = self
            .tx
            .lock()
            .ok()
            .and_then(|tx| tx.as_ref().map(|tx| tx.send(WriterMessage::Save(snapshot)).is_ok()))
            .unwrap_or(false);
        if !sent {
            warn!(stream = %stream, "snapshot writer stopped; capture dropped");
        }
    }

    /// Block until every snapshot queued before this call has been handled.
    pub fn flush(&self) {
        let (ack_tx, ack_rx) = mpsc::channel();
        let sent = self
            .tx
            .lock()
            .ok()
            .and_then(|tx| tx.as_ref().map(|tx| tx.send(WriterMessage::Flush(ack_tx)).is_ok()))
            .unwrap_or(false);
        if sent {
            let _ = ack_rx.recv();
        }
    }

    /// Drain the queue and stop the writer thread.
    pub fn shutdown(&self) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        let join = self.join.lock().ok().and_then(|mut j| j.take());
        if let Some(j) = join {
            let _ = j.join();
        }
    }
}

impl Drop for SnapshotWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn writer_loop<S: SnapshotStore>(store: S, rx: mpsc::Receiver<WriterMessage>) {
    // Ends once every sender is gone and the queue is drained.
    for message in rx {
        match message {
            WriterMessage::Save(snapshot) => {
                let stream = snapshot.stream_id.clone();
                let sequence = snapshot.sequence_number;
                match store.save(snapshot) {
                    Ok(()) => debug!(stream = %stream, sequence, "snapshot saved"),
                    Err(err) => warn!(stream = %stream, sequence, error = %err, "snapshot save failed"),
                }
            }
            WriterMessage::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}
