//! Overall queue progress and the host notification built from it
//!
//! Everything in here works on a [`QueueView`], a copy of the queue taken
//! under the queue lock, so the functions are pure and easy to test.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::models::DownloadStatus;

/// Progress of one queued download as seen by the aggregator
#[derive(Debug, Clone, PartialEq)]
pub struct UnitProgress {
    pub item_id: String,
    pub title: Option<String>,
    pub status: DownloadStatus,
    pub progress: f32,
    pub silent: bool,
}

impl UnitProgress {
    fn percent(&self) -> u32 {
        (self.progress * 100.0) as u32
    }
}

/// Snapshot of the queue and its session counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueView {
    pub units: Vec<UnitProgress>,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: bool,
    pub paused: bool,
    pub started_at: Option<DateTime<Utc>>,
}

impl QueueView {
    fn all_silent(&self) -> bool {
        !self.units.is_empty() && self.units.iter().all(|unit| unit.silent)
    }
}

/// Overall progress of the session in `0.0..=1.0`
///
/// Downloads that already ended this session count as fully done, so the bar
/// never jumps backwards when one leaves the queue.
pub fn total_progress(view: &QueueView) -> f32 {
    if view.units.is_empty() {
        return 1.0;
    }

    let finished = view.completed + view.failed;
    let sum: f32 = view.units.iter().map(|unit| unit.progress).sum();
    (finished as f32 + sum) / (view.units.len() + finished) as f32
}

/// One line summary such as `40%, 12% (1 queued, 2 finished)`
///
/// `None` when every queued download is silent.
pub fn summary_text(view: &QueueView) -> Option<String> {
    if view.all_silent() {
        return None;
    }

    let active: Vec<String> = view
        .units
        .iter()
        .filter(|unit| unit.status.is_downloading())
        .map(|unit| format!("{}%", unit.percent()))
        .collect();

    let mut additional = Vec::new();
    let queued = view.units.len() - active.len();
    if queued > 0 {
        additional.push(format!("{queued} queued"));
    }
    if view.completed > 0 {
        additional.push(format!("{} finished", view.completed));
    }
    if view.failed > 0 {
        additional.push(format!("{} failed", view.failed));
    }

    let text = active.join(", ");
    Some(if additional.is_empty() {
        text
    } else {
        format!("{text} ({})", additional.join(", "))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Progress,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationAction {
    Pause,
    Resume,
    CancelAll,
}

/// The single aggregate notification shown by the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub title: String,
    pub text: String,
    pub sub_text: Option<String>,
    pub progress_percent: Option<u32>,
    pub ongoing: bool,
    pub actions: Vec<NotificationAction>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NotificationUpdate {
    /// Leave whatever is shown alone
    Unchanged,
    Show(Notification),
    Dismiss,
}

/// Work out what the host notification should show for `view`
///
/// `visible` tells whether a non-silent download created the notification
/// this session.
pub fn render_notification(view: &QueueView, visible: bool, now: DateTime<Utc>) -> NotificationUpdate {
    if view.all_silent() || !visible {
        return NotificationUpdate::Unchanged;
    }

    if view.units.is_empty() {
        let (kind, title) = if view.cancelled {
            (NotificationKind::Cancelled, "Download cancelled")
        } else if view.completed == 0 {
            (NotificationKind::Failed, "Download failed")
        } else {
            return NotificationUpdate::Dismiss;
        };

        return NotificationUpdate::Show(Notification {
            kind,
            title: title.to_string(),
            text: String::new(),
            sub_text: None,
            progress_percent: None,
            ongoing: false,
            actions: Vec::new(),
        });
    }

    let progress = total_progress(view);

    let title = match view.units.as_slice() {
        [UnitProgress {
            title: Some(title), ..
        }] => format!("Downloading {title}"),
        units => format!("Downloading {} songs", units.len()),
    };
    let title = if view.paused {
        format!("{title} (paused)")
    } else {
        title
    };

    let sub_text = view.started_at.map(|started| {
        let minutes = (now - started).num_minutes();
        if minutes <= 0 {
            "Just started".to_string()
        } else {
            format!("Started {minutes} minutes ago")
        }
    });

    let actions = if progress >= 1.0 {
        Vec::new()
    } else {
        vec![
            if view.paused {
                NotificationAction::Resume
            } else {
                NotificationAction::Pause
            },
            NotificationAction::CancelAll,
        ]
    };

    NotificationUpdate::Show(Notification {
        kind: NotificationKind::Progress,
        title,
        text: summary_text(view).unwrap_or_default(),
        sub_text,
        progress_percent: Some((progress * 100.0) as u32),
        ongoing: true,
        actions,
    })
}
