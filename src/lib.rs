//! Staged experiment orchestrator for fleets of physical mobile devices.
//!
//! The library drives paired control/treatment phones through a long-running
//! experiment protocol: factory reset, configuration, eSIM insertion,
//! account login, optional persona signalling, barrier synchronization with
//! the sibling device, and repeated ad-extraction sampling. It survives
//! flaky hardware and instrumentation by classifying every failure and
//! retrying, escalating, or recovering accordingly.
//!
//! Layering, leaves first: [`device`] builds and runs vendor commands,
//! [`task`] turns one command into a classified outcome, [`recovery`]
//! repairs unreachable hardware, [`barrier`] aligns the worker pair,
//! [`pipeline`] sequences the stages, [`sampling`] loops measurements until
//! the sample counter is satisfied, and [`supervisor`] runs the batch.

pub mod barrier;
pub mod config;
pub mod console;
pub mod device;
pub mod error;
pub mod harvester;
pub mod pipeline;
pub mod recovery;
pub mod sampling;
pub mod spec;
pub mod supervisor;
pub mod task;

#[cfg(test)]
pub(crate) mod testutil;
