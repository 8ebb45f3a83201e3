//! Jobs, o registro de tipos e as operações de fila que os levam pelo ciclo
//! de vida.

mod model;
mod queue;
mod registry;
mod sleep;
mod status;

pub use model::{DEFAULT_TIME_ESTIMATE, Job, JobId};
pub use queue::JobQueue;
pub use registry::{JobHandler, JobTypeRegistry};
pub use sleep::{SLEEP_JOB_TYPE, SleepJob};
pub use status::{JobStatus, Transition};
