use std::collections::{HashSet, VecDeque};

use watchroom_core::room::QueueItem;

use crate::error::RoomError;

/// Result of accepting a queue add.
#[derive(Debug, Clone, PartialEq)]
pub enum Enqueued {
    /// Appended behind an active video.
    Queued,
    /// Nothing was playing, so the queue head became the current video.
    Started(QueueItem),
}

/// Result of moving past the current video.
#[derive(Debug, Clone, PartialEq)]
pub enum Advance {
    Next {
        finished: Option<QueueItem>,
        next: QueueItem,
    },
    Exhausted {
        finished: Option<QueueItem>,
    },
}

/// FIFO of pending videos plus the current video and the set of video ids
/// already played.
///
/// A video id lives in at most one of `pending`, `current` and `played`.
/// `current` is `None` only while `pending` is empty, and it is assigned in
/// exactly one place, `promote_head`.
pub struct VideoQueue {
    pending: VecDeque<QueueItem>,
    current: Option<QueueItem>,
    played: HashSet<String>,
    max_size: usize,
}

impl VideoQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            current: None,
            played: HashSet::new(),
            max_size,
        }
    }

    /// Whether `video_id` is queued, playing, or already played.
    pub fn contains(&self, video_id: &str) -> bool {
        self.played.contains(video_id)
            || self
                .current
                .as_ref()
                .is_some_and(|item| item.video_id == video_id)
            || self.pending.iter().any(|item| item.video_id == video_id)
    }

    pub fn enqueue(&mut self, item: QueueItem) -> Result<Enqueued, RoomError> {
        if self.played.contains(&item.video_id) {
            return Err(RoomError::Duplicate(
                "This video has already been played in this room".to_string(),
            ));
        }
        if self.contains(&item.video_id) {
            return Err(RoomError::Duplicate(
                "This video is already in the queue".to_string(),
            ));
        }
        if self.pending.len() >= self.max_size {
            return Err(RoomError::Capacity(format!(
                "Queue is full (max {} videos)",
                self.max_size
            )));
        }

        self.pending.push_back(item);
        if self.current.is_none()
            && let Some(started) = self.promote_head()
        {
            return Ok(Enqueued::Started(started));
        }
        Ok(Enqueued::Queued)
    }

    /// Remove a pending entry matched by item id or video id.
    pub fn remove(&mut self, key: &str) -> Option<QueueItem> {
        let index = self
            .pending
            .iter()
            .position(|item| item.id == key || item.video_id == key)?;
        self.pending.remove(index)
    }

    /// Retire the current video into the played set and promote the next one.
    pub fn advance(&mut self) -> Advance {
        let finished = self.current.take();
        if let Some(ref item) = finished {
            self.played.insert(item.video_id.clone());
        }
        match self.promote_head() {
            Some(next) => Advance::Next { finished, next },
            None => Advance::Exhausted { finished },
        }
    }

    fn promote_head(&mut self) -> Option<QueueItem> {
        let next = self.pending.pop_front()?;
        self.current = Some(next.clone());
        Some(next)
    }

    pub fn current(&self) -> Option<&QueueItem> {
        self.current.as_ref()
    }

    pub fn items(&self) -> Vec<QueueItem> {
        self.pending.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn played_count(&self) -> usize {
        self.played.len()
    }
}
