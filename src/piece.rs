use crossbeam_channel::{unbounded, Receiver, Sender};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceWork {
    pub index: u32,
    pub hash: [u8; 20],
    pub len: u32,
}

#[derive(Debug)]
pub struct PieceResult {
    pub index: u32,
    pub buf: Vec<u8>,
}

/// Length of piece `index`; every piece is `piece_len` except a shorter last one.
pub fn piece_size(index: u32, piece_len: u32, file_len: u64) -> u32 {
    let begin = index as u64 * piece_len as u64;
    let end = (begin + piece_len as u64).min(file_len);
    end.saturating_sub(begin) as u32
}

/// Number of pieces needed to cover `file_len` bytes.
pub fn piece_count(piece_len: u32, file_len: u64) -> usize {
    if piece_len == 0 {
        return 0;
    }
    ((file_len + piece_len as u64 - 1) / piece_len as u64) as usize
}

/// Multi-producer, multi-consumer FIFO of pieces nobody has downloaded yet.
///
/// Workers pop from it and push a piece back untouched when they give up on it.
pub struct WorkQueue {
    tx: Sender<PieceWork>,
    rx: Receiver<PieceWork>,
    ready: Notify,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        WorkQueue {
            tx,
            rx,
            ready: Notify::new(),
        }
    }

    pub fn push(&self, pw: PieceWork) {
        // the receiver lives as long as the queue, so this cannot disconnect
        if let Err(e) = self.tx.send(pw) {
            error!("work queue closed, dropping piece #{}", e.0.index);
            return;
        }
        self.ready.notify_one();
    }

    /// Waits for the next piece. Returns `None` once `cancel` fires.
    pub async fn pop(&self, cancel: &CancellationToken) -> Option<PieceWork> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }

            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Ok(pw) = self.rx.try_recv() {
                return Some(pw);
            }

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = &mut notified => {}
            }
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
