pub mod condition;
pub mod jobset;
pub mod workload;

pub use condition::Condition;
pub use jobset::{JobSet, JobSetSpec, JobSetStatus, ReplicatedJob, ReplicatedJobStatus};
pub use workload::{
    Admission, PodSet, PodSetAssignment, ResourceFlavor, ResourceFlavorSpec, Workload,
    WorkloadSpec, WorkloadStatus,
};
