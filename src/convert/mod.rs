//! Document conversion core
//!
//! - `router`: extension allow-list and backend descriptors
//! - `work_area`: per-job directories with guaranteed teardown
//! - `invoker`: runs the external renderer with a deadline
//! - `job`: per-request lifecycle state

pub mod invoker;
pub mod job;
pub mod router;
pub mod work_area;

pub use invoker::{
    sanitize_file_name, truncate_diagnostic, Artifact, BackendInvoker, CommandTemplate,
    ConversionResult, Invocation,
};
pub use job::{ConversionJob, JobPhase};
pub use router::{BackendClass, BackendDescriptor, BackendTable, OUTPUT_EXTENSION};
pub use work_area::{WorkArea, WorkAreaManager};
