//! # taskroot-beat
//!
//! Periodic task scheduling backed by the taskroot event store.
//!
//! This crate provides:
//! - Crontab matching for five-field expressions
//! - [`DatabaseScheduler`]: loads one app's schedules, fires due entries
//!   through a [`TaskDispatcher`] and writes run state back
//! - [`BeatController`]: app-scoped list/save/delete for editing surfaces
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use taskroot_beat::{DatabaseScheduler, TracingDispatcher};
//! use taskroot_core::BeatConfig;
//!
//! let mut scheduler = DatabaseScheduler::new(store, BeatConfig::new("billing"));
//! scheduler.setup_schedule().await?;
//! scheduler.fire_due(chrono::Utc::now(), &TracingDispatcher).await?;
//! scheduler.sync().await?;
//! ```

pub mod controller;
pub mod cron;
pub mod scheduler;

pub use controller::{parse_schedule_text, BeatController};
pub use cron::CronMatcher;
pub use scheduler::{DatabaseScheduler, ScheduleEntry, TaskDispatcher, TracingDispatcher};
