//! A generational, compacting garbage-collected heap for managed runtimes.
//!
//! `molten-gc` provides the allocation and collection engine an interpreter
//! or VM embeds: segment-based object memory with three small-object
//! generations and a non-moving large-object space, a card-marking write
//! barrier, cooperative stop-the-world suspension, and an optional
//! concurrent background collector for the old generation.
//!
//! # Features
//!
//! - **Generational collection**: objects age by whole-segment promotion;
//!   minor collections sweep only the young generations guided by cards
//! - **Sliding compaction**: full collections defragment small-object
//!   segments, with pinned objects acting as immovable barriers
//! - **Cooperative suspension**: mutators park at safepoints; threads that
//!   miss the deadline are scanned conservatively instead of blocking the
//!   collection forever
//! - **Background collection**: an optional concurrent mark of the old
//!   generation with a snapshot-at-the-beginning write barrier
//!
//! # Quick Start
//!
//! ```no_run
//! use molten_gc::{HeapConfig, RuntimeHeap, TypeDescriptor};
//!
//! let heap = RuntimeHeap::new(HeapConfig::default());
//! // A pair: two reference slots, no scalar fields.
//! let pair = heap.register_type(TypeDescriptor::new("pair", 2, vec![0, 1], false));
//!
//! let mutator = heap.register_mutator();
//! let frame = mutator.frame();
//!
//! let a = heap.allocate(pair).unwrap();
//! let slot = frame.push(Some(a));
//! let b = heap.allocate(pair).unwrap();
//! heap.write_ref(slot.get().unwrap(), 0, Some(b));
//!
//! heap.collect();
//! ```
//!
//! # Threading
//!
//! Every thread that touches managed objects registers with
//! [`RuntimeHeap::register_mutator`] and keeps the guard alive. References
//! held across an allocation or an explicit [`safepoint`] must live in a
//! shadow-stack frame ([`MutatorGuard::frame`]); anything kept only in
//! locals is invisible to the collector and may be freed or moved under
//! the caller's feet. Long blocking calls are bracketed with
//! [`enter_external`]/[`leave_external`] so collections do not wait on
//! them.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod collect;
mod config;
mod finalize;
mod metrics;
mod object;
mod roots;
mod suspend;
mod threads;

/// Segment and allocation internals.
///
/// This module is public for testing and advanced embedders. Most users
/// interact with [`RuntimeHeap`] directly.
pub mod heap;

pub use config::{default_budget_policy, BudgetPolicy, HeapConfig, SurvivalStats};
pub use finalize::FinalizeQueue;
pub use heap::alloc::AllocError;
pub use heap::{Generation, RuntimeHeap, LARGE_OBJECT_THRESHOLD};
pub use metrics::{CollectionType, GcMetrics, MetricsStore};
pub use object::{ObjRef, TypeDescriptor, TypeId};
pub use roots::{Handle, HandleKind, HandleTable, Root, ShadowFrame, ShadowSlot, StaticRoots};
pub use suspend::{PollBackend, SuspensionBackend};
#[cfg(unix)]
pub use suspend::SignalBackend;
pub use threads::{enter_external, leave_external, safepoint, MutatorGuard};
