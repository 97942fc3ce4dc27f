use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// A task's media family, derived from its URL at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Mp4,
    Hls,
}

impl TaskKind {
    /// A URL whose lowercased form contains `.m3u8` is HLS; otherwise MP4.
    pub fn classify(url: &str) -> Self {
        if url.to_lowercase().contains(".m3u8") {
            TaskKind::Hls
        } else {
            TaskKind::Mp4
        }
    }

    pub fn as_ordinal(self) -> i64 {
        match self {
            TaskKind::Mp4 => 0,
            TaskKind::Hls => 1,
        }
    }

    pub fn from_ordinal(value: i64) -> Option<Self> {
        match value {
            0 => Some(TaskKind::Mp4),
            1 => Some(TaskKind::Hls),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }

    pub fn as_ordinal(self) -> i64 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Downloading => 1,
            TaskStatus::Paused => 2,
            TaskStatus::Completed => 3,
            TaskStatus::Failed => 4,
            TaskStatus::Cancelled => 5,
        }
    }

    pub fn from_ordinal(value: i64) -> Option<Self> {
        match value {
            0 => Some(TaskStatus::Pending),
            1 => Some(TaskStatus::Downloading),
            2 => Some(TaskStatus::Paused),
            3 => Some(TaskStatus::Completed),
            4 => Some(TaskStatus::Failed),
            5 => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }
}

/// The central entity: a single download, whatever its origin (MP4 or HLS).
///
/// `cancel_handle` is transient and never persisted or serialized to callers; it is
/// recreated by the runner on every active run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub url: String,
    pub title: String,
    pub kind: TaskKind,
    pub save_path: Option<String>,
    pub status: TaskStatus,
    pub progress: f32,
    pub downloaded_units: i64,
    pub total_units: i64,
    pub error: Option<String>,
    pub key: Option<String>,
    pub iv: Option<String>,
    #[serde(skip)]
    pub cancel_handle: Option<CancellationToken>,
}

impl Task {
    pub fn new(id: String, url: String, title: String, key: Option<String>, iv: Option<String>) -> Self {
        let kind = TaskKind::classify(&url);
        Task {
            id,
            url,
            title,
            kind,
            save_path: None,
            status: TaskStatus::Pending,
            progress: 0.0,
            downloaded_units: 0,
            total_units: 0,
            error: None,
            key,
            iv,
            cancel_handle: None,
        }
    }

    /// A snapshot is the serializable, event-stream-safe view of a task: identical fields
    /// minus the transient cancel handle. `Task` already skips it in `Serialize`, so a
    /// snapshot is just a clone.
    pub fn snapshot(&self) -> Task {
        let mut copy = self.clone();
        copy.cancel_handle = None;
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_m3u8_case_insensitively() {
        assert_eq!(TaskKind::classify("http://x/a.M3U8"), TaskKind::Hls);
        assert_eq!(TaskKind::classify("http://x/a.mp4"), TaskKind::Mp4);
        assert_eq!(TaskKind::classify("http://x/a.m3u8?token=1"), TaskKind::Hls);
    }

    #[test]
    fn ordinal_round_trips() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Downloading,
            TaskStatus::Paused,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(TaskStatus::from_ordinal(status.as_ordinal()), Some(status));
        }
        assert_eq!(TaskKind::from_ordinal(TaskKind::Mp4.as_ordinal()), Some(TaskKind::Mp4));
        assert_eq!(TaskKind::from_ordinal(TaskKind::Hls.as_ordinal()), Some(TaskKind::Hls));
    }

    #[test]
    fn new_task_is_pending_with_derived_kind() {
        let task = Task::new("id1".into(), "http://x/a.m3u8".into(), "title".into(), None, None);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.kind, TaskKind::Hls);
        assert_eq!(task.progress, 0.0);
    }
}
