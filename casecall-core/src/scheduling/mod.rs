//! Scheduler run: select or claim due cases, then dispatch call jobs.

pub mod dispatch;
pub mod run;
pub mod selection;

pub use dispatch::{DispatchReport, dispatch_claimed};
pub use run::{DueCaseScheduler, ScheduleReport, ScheduleRequest};
