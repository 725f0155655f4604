//! Core data model.
//!
//! Templates and tokens describe what a project folder should look like,
//! contracts describe what a storage root may contain, and jobs carry
//! workflow requests between enqueuers and workers.

pub mod contract;
pub mod job;
pub mod provisioning;
pub mod template;
