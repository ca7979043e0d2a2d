use thiserror::Error;

use crate::{
    collaborators::CollaboratorError, idle_tracker::TrackerError,
    snapshot::SnapshotError,
};

// Errors that drop a whole tick of the poll loop
#[derive(Debug, Error)]
pub enum WardenError {
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
}
