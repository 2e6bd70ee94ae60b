//! Self-enrollment of the driver process into its own job object.

use damon::win32::job::{ExtendedLimits, JobObject};

use crate::DriverError;

/// Put the calling process into a fresh job object with kill-on-job-close.
///
/// Holding the returned handle for the driver's lifetime ties every task to
/// the driver: when the driver dies and the handle closes, the kernel kills
/// all children assigned to the same job tree.
///
/// # Errors
///
/// Surfaces job creation, limit installation, or assignment failures.
pub fn wrap_current_process() -> Result<JobObject, DriverError> {
    let job = JobObject::create(&format!("damon-{}", std::process::id()))
        .map_err(damon::container::ContainerError::from)?;
    job.set_extended_limits(&ExtendedLimits {
        kill_on_job_close: true,
        ..ExtendedLimits::default()
    })
    .map_err(damon::container::ContainerError::from)?;
    job.assign_current_process()
        .map_err(damon::container::ContainerError::from)?;
    Ok(job)
}
