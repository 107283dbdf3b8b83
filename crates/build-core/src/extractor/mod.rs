//! Status and result extraction.
//!
//! Reads what a finished or running job reports (results, step termination
//! messages, the pod behind it) and turns it into BuildRun status fields.

mod failures;
mod results;

pub use failures::{failure_details, pipeline_failure_details, pod_init_finished};
pub use results::{apply_results, child_results, parse_vulnerabilities};
