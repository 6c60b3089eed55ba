// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Profile status shared between a tracing context and the thread profiler
//! watching it.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering},
    Arc,
};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProfileStatus {
    /// Not selected by any profiling task
    None = 0,
    /// Selected, waiting for the segment to live long enough to be worth
    /// dumping
    Pending = 1,
    /// Actively dumped by the sampling thread
    Profiling = 2,
}

#[derive(Debug)]
struct Inner {
    status: AtomicU8,
    first_segment_create_time_ms: AtomicU64,
    from_first_segment: AtomicBool,
    // Shared across every context continued from the same first segment, so
    // the sub-thread budget is enforced trace wide.
    sub_thread_profiling_count: ArcSwap<AtomicUsize>,
}

/// A shared handle on the profile status of one tracing context.
///
/// `Clone` shares the underlying state: the profiler promoting the status to
/// `Profiling` is immediately observed by the owning context and vice versa.
/// Use [`ProfileStatusContext::captured`] to get the detached copy that goes
/// into a context snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "ProfileStatusRepr", into = "ProfileStatusRepr")]
pub struct ProfileStatusContext {
    inner: Arc<Inner>,
}

impl ProfileStatusContext {
    fn with(status: ProfileStatus, create_time_ms: u64, from_first_segment: bool) -> Self {
        ProfileStatusContext {
            inner: Arc::new(Inner {
                status: AtomicU8::new(status as u8),
                first_segment_create_time_ms: AtomicU64::new(create_time_ms),
                from_first_segment: AtomicBool::new(from_first_segment),
                sub_thread_profiling_count: ArcSwap::from_pointee(AtomicUsize::new(0)),
            }),
        }
    }

    /// Status of a context no profiling task cares about
    pub fn none() -> Self {
        Self::with(ProfileStatus::None, 0, true)
    }

    /// Status of a context selected at creation time
    pub fn pending(first_segment_create_time_ms: u64) -> Self {
        Self::with(ProfileStatus::Pending, first_segment_create_time_ms, true)
    }

    pub fn get(&self) -> ProfileStatus {
        match self.inner.status.load(Ordering::SeqCst) {
            1 => ProfileStatus::Pending,
            2 => ProfileStatus::Profiling,
            _ => ProfileStatus::None,
        }
    }

    pub fn is_being_watched(&self) -> bool {
        self.get() != ProfileStatus::None
    }

    pub fn is_profiling(&self) -> bool {
        self.get() == ProfileStatus::Profiling
    }

    /// Whether this context started the profiled endpoint, as opposed to
    /// being continued from it on another thread
    pub fn is_from_first_segment(&self) -> bool {
        self.inner.from_first_segment.load(Ordering::SeqCst)
    }

    pub fn first_segment_create_time_ms(&self) -> u64 {
        self.inner.first_segment_create_time_ms.load(Ordering::SeqCst)
    }

    pub fn sub_thread_profiling_count(&self) -> usize {
        self.inner
            .sub_thread_profiling_count
            .load()
            .load(Ordering::SeqCst)
    }

    /// Moves the status forward. Only the profiling side should call this.
    pub fn update_status(&self, status: ProfileStatus) {
        self.inner.status.store(status as u8, Ordering::SeqCst);
    }

    /// Marks the context as selected by a profiling task. Only the profiling
    /// side should call this.
    pub fn update_pending(&self, first_segment_create_time_ms: u64) {
        self.inner
            .first_segment_create_time_ms
            .store(first_segment_create_time_ms, Ordering::SeqCst);
        self.update_status(ProfileStatus::Pending);
    }

    /// A detached copy for a context snapshot. Mutations of the live status
    /// no longer reach the copy; only the sub-thread budget counter stays
    /// shared so continued contexts are capped trace wide.
    pub fn captured(&self) -> Self {
        ProfileStatusContext {
            inner: Arc::new(Inner {
                status: AtomicU8::new(self.get() as u8),
                first_segment_create_time_ms: AtomicU64::new(self.first_segment_create_time_ms()),
                from_first_segment: AtomicBool::new(self.is_from_first_segment()),
                sub_thread_profiling_count: ArcSwap::new(
                    self.inner.sub_thread_profiling_count.load_full(),
                ),
            }),
        }
    }

    /// Adopts the status captured in a snapshot on continuation. Returns
    /// whether profiling should carry on in this context: the parent must be
    /// watched and the trace-wide sub-thread budget must not be exhausted.
    pub fn continued(&self, from: &ProfileStatusContext, max_accept_sub_parallel: usize) -> bool {
        self.inner
            .status
            .store(from.get() as u8, Ordering::SeqCst);
        self.inner.first_segment_create_time_ms.store(
            from.first_segment_create_time_ms(),
            Ordering::SeqCst,
        );
        self.inner.from_first_segment.store(false, Ordering::SeqCst);

        let counter = from.inner.sub_thread_profiling_count.load_full();
        self.inner
            .sub_thread_profiling_count
            .store(Arc::clone(&counter));

        from.is_being_watched()
            && counter.fetch_add(1, Ordering::SeqCst) + 1 <= max_accept_sub_parallel
    }
}

#[derive(Serialize, Deserialize)]
struct ProfileStatusRepr {
    status: ProfileStatus,
    first_segment_create_time_ms: u64,
    from_first_segment: bool,
}

impl From<ProfileStatusRepr> for ProfileStatusContext {
    fn from(repr: ProfileStatusRepr) -> Self {
        ProfileStatusContext::with(
            repr.status,
            repr.first_segment_create_time_ms,
            repr.from_first_segment,
        )
    }
}

impl From<ProfileStatusContext> for ProfileStatusRepr {
    fn from(status: ProfileStatusContext) -> Self {
        ProfileStatusRepr {
            status: status.get(),
            first_segment_create_time_ms: status.first_segment_create_time_ms(),
            from_first_segment: status.is_from_first_segment(),
        }
    }
}
