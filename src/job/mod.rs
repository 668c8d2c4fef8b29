mod record;
mod status;

pub use record::{DevOpsFiles, Job, JobFields, ProjectContext};
pub use status::{JobStatus, UnknownStatus};
