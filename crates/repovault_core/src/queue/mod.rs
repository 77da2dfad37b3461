//! Reservation-scoped task queue.
//!
//! # Responsibility
//! - Persist submitted tasks and their outcomes (the task status store).
//! - Serialize execution per reservation key, FIFO, across threads and
//!   processes, using only the database.
//! - Run registered task handlers on a pool of worker threads.
//!
//! # Invariants
//! - At most one task per reservation key is running at any instant.
//! - Tasks sharing a key start in submission order.
//! - A failing or panicking handler marks its task failed and releases the
//!   reservation; the worker keeps running.

pub mod registry;
pub mod reservation;
pub mod worker;
