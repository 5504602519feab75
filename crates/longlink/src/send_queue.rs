use bytes::Bytes;

/// A frame waiting to go out on the link.
#[derive(Debug, Clone)]
pub struct SendEntry {
    pub task_id: u32,
    pub cmd_id: u32,
    pub send_only: bool,
    buffer: Bytes,
    cursor: usize,
    in_write: bool,
}

impl SendEntry {
    pub fn new(task_id: u32, cmd_id: u32, buffer: Vec<u8>, send_only: bool) -> Self {
        Self {
            task_id,
            cmd_id,
            send_only,
            buffer: Bytes::from(buffer),
            cursor: 0,
            in_write: false,
        }
    }

    pub fn written(&self) -> usize {
        self.cursor
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Progress reported for one entry after a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteProgress {
    pub task_id: u32,
    pub cmd_id: u32,
    pub send_only: bool,
    /// First bytes of this entry went out in this write.
    pub started: bool,
    pub completed: bool,
}

/// FIFO of outgoing frames. Entries leave only when fully written, or via
/// [`SendQueue::stop`] while none of their bytes were written.
#[derive(Debug, Default)]
pub struct SendQueue {
    entries: Vec<SendEntry>,
}

impl SendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn push(&mut self, entry: SendEntry) {
        self.entries.push(entry);
    }

    /// Enqueues only when nothing else is waiting.
    pub fn push_when_empty(&mut self, entry: SendEntry) -> bool {
        if !self.entries.is_empty() {
            return false;
        }
        self.entries.push(entry);
        true
    }

    pub fn contains(&self, task_id: u32) -> bool {
        self.entries.iter().any(|e| e.task_id == task_id)
    }

    pub fn stop(&mut self, task_id: u32) -> bool {
        match self
            .entries
            .iter()
            .position(|e| e.task_id == task_id && e.cursor == 0 && !e.in_write)
        {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Unwritten remainders of every entry, in order. Marks them as being
    /// written until [`SendQueue::advance`] or [`SendQueue::release`].
    pub fn snapshot(&mut self) -> Vec<Bytes> {
        self.entries
            .iter_mut()
            .map(|e| {
                e.in_write = true;
                e.buffer.slice(e.cursor..)
            })
            .collect()
    }

    pub fn release(&mut self) {
        for entry in &mut self.entries {
            entry.in_write = false;
        }
    }

    /// Accounts `written` bytes against the queue head and drops finished entries.
    pub fn advance(&mut self, mut written: usize) -> Vec<WriteProgress> {
        let mut progress = Vec::new();
        let mut finished = 0;
        for entry in &mut self.entries {
            if written == 0 {
                break;
            }
            let remaining = entry.buffer.len() - entry.cursor;
            let step = remaining.min(written);
            let started = entry.cursor == 0 && step > 0;
            entry.cursor += step;
            written -= step;
            let completed = entry.cursor == entry.buffer.len();
            if completed {
                finished += 1;
            }
            progress.push(WriteProgress {
                task_id: entry.task_id,
                cmd_id: entry.cmd_id,
                send_only: entry.send_only,
                started,
                completed,
            });
        }
        self.entries.drain(..finished);
        self.release();
        progress
    }
}
