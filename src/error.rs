use crate::pipeline::job::{JobId, JobState};

/// Errors the search service returns synchronously to its caller.
///
/// Failures that happen while a job runs (no face in the probe, unreachable
/// corpus) are not errors here: they end the job in a failure state that the
/// caller reads from the job's progress.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("face models are still loading, try again shortly")]
    ModelsLoading,
    #[error("the reference photo is empty")]
    EmptyProbe,
    #[error("search {0} not found")]
    JobNotFound(JobId),
    #[error("search {id} has not completed (state: {state:?})")]
    NotCompleted { id: JobId, state: JobState },
}
