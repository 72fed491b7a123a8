pub mod capabilities;
pub mod events;
pub mod ids;
pub mod job;
pub mod priority;
pub mod stats;
pub mod tenant;
pub mod worker;

pub use capabilities::Capabilities;
pub use events::JobEvent;
pub use ids::{JobId, ReservationToken, WorkerId};
pub use job::{EnqueueOptions, Job, JobState, ReservedJob};
pub use priority::Priority;
pub use stats::{PendingCounts, QueueStats};
pub use tenant::{QuotaPeriod, QuotaSettings, TenantCtx, TenantId, TenantRecord, TenantStatus};
pub use worker::{Lane, WorkerRecord, WorkerState};
