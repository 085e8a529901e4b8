// Copyright (c) Aptos
// SPDX-License-Identifier: Apache-2.0

//! In-memory implementations of the three adapter seams. They honor
//! the same contracts as the production adapters (unique index,
//! conditional updates, visibility locks, backoff, stall budget) and
//! are what the test suites and local development run against.

mod object;
mod queue;
mod variant;

pub use object::InMemoryObjectStore;
pub use queue::InMemoryJobQueue;
pub use variant::InMemoryVariantStore;
