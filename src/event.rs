//! Filesystem change descriptors.
//!
//! The observer produces raw `notify` events; the rest of the crate only
//! sees [`ChangeEvent`]s, one per affected path, with the event kinds the
//! configuration model knows about.

use notify::event::{ModifyKind, RenameMode};
use notify::EventKind;
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;

/// The four event kinds a task can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    Moved,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeKind::Created => "created",
            ChangeKind::Modified => "modified",
            ChangeKind::Deleted => "deleted",
            ChangeKind::Moved => "moved",
        };
        f.write_str(s)
    }
}

/// A single filesystem change, the trigger handed to task runs.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

impl ChangeEvent {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        ChangeEvent {
            path: path.into(),
            kind,
        }
    }
}

/// Flatten a raw notify event into per-path change events. Access events
/// and other noise map to nothing.
pub fn change_events(event: &notify::Event) -> Vec<ChangeEvent> {
    let kind = match event.kind {
        EventKind::Create(_) => ChangeKind::Created,
        EventKind::Remove(_) => ChangeKind::Deleted,
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            // A paired rename reports [from, to]; report the move once.
            RenameMode::Both => {
                return event
                    .paths
                    .first()
                    .map(|p| vec![ChangeEvent::new(p.clone(), ChangeKind::Moved)])
                    .unwrap_or_default();
            }
            _ => ChangeKind::Moved,
        },
        EventKind::Modify(_) => ChangeKind::Modified,
        _ => return Vec::new(),
    };

    event
        .paths
        .iter()
        .map(|p| ChangeEvent::new(p.clone(), kind))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, ModifyKind, RemoveKind};

    fn raw(kind: EventKind, paths: Vec<PathBuf>) -> notify::Event {
        paths
            .into_iter()
            .fold(notify::Event::new(kind), |ev, p| ev.add_path(p))
    }

    #[test]
    fn create_and_remove_map_directly() {
        let ev = raw(EventKind::Create(CreateKind::File), vec!["/a".into()]);
        assert_eq!(change_events(&ev)[0].kind, ChangeKind::Created);

        let ev = raw(EventKind::Remove(RemoveKind::File), vec!["/a".into()]);
        assert_eq!(change_events(&ev)[0].kind, ChangeKind::Deleted);
    }

    #[test]
    fn data_modify_maps_to_modified() {
        let ev = raw(
            EventKind::Modify(ModifyKind::Data(DataChange::Content)),
            vec!["/a".into()],
        );
        assert_eq!(change_events(&ev)[0].kind, ChangeKind::Modified);
    }

    #[test]
    fn paired_rename_reports_one_move() {
        let ev = raw(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            vec!["/from".into(), "/to".into()],
        );
        let out = change_events(&ev);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, ChangeKind::Moved);
        assert_eq!(out[0].path, PathBuf::from("/from"));
    }

    #[test]
    fn access_events_are_dropped() {
        let ev = raw(
            EventKind::Access(notify::event::AccessKind::Read),
            vec!["/a".into()],
        );
        assert!(change_events(&ev).is_empty());
    }

    #[test]
    fn kinds_display_lowercase() {
        assert_eq!(ChangeKind::Modified.to_string(), "modified");
        assert_eq!(ChangeKind::Created.to_string(), "created");
    }
}
