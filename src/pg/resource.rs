//! Bounded resource pool.
//!
//! Tracks how many resources exist, hands out idle ones LIFO, and limits the
//! number checked out at once with a semaphore. It knows nothing about
//! PostgreSQL: creating, validating and closing resources is the caller's job.
//!
//! Every [`Resource`] must end in exactly one of [`Resource::release`],
//! [`Resource::destroy`] or [`Resource::hijack`]. Dropping one without doing so
//! counts as destroying it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::error::{PgError, PgResult};

struct IdleEntry<T> {
    value: T,
    created_at: Instant,
    idle_since: Instant,
}

/// Timestamps of an idle resource, passed to [`ResourcePool::remove_idle`].
#[derive(Debug, Clone, Copy)]
pub struct IdleInfo {
    pub created_at: Instant,
    pub idle_since: Instant,
}

pub struct ResourcePool<T> {
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<IdleEntry<T>>>,
    total: AtomicUsize,
    max_size: usize,
}

/// Outcome of [`ResourcePool::acquire`].
pub enum Acquired<T> {
    /// A previously released resource.
    Idle(Resource<T>),
    /// Room for a new resource; the caller constructs it.
    Vacant(Slot<T>),
}

/// Capacity reserved for a resource that is not constructed yet.
/// Dropping the slot gives the capacity back.
pub struct Slot<T> {
    permit: OwnedSemaphorePermit,
    pool: Arc<ResourcePool<T>>,
}

impl<T> Slot<T> {
    /// Install a newly created value.
    pub fn fill(self, value: T) -> Resource<T> {
        self.pool.total.fetch_add(1, Ordering::AcqRel);
        Resource {
            value,
            ticket: Ticket {
                created_at: Instant::now(),
                pool: self.pool,
                _permit: self.permit,
                settled: false,
            },
        }
    }
}

/// A checked-out resource.
pub struct Resource<T> {
    value: T,
    ticket: Ticket<T>,
}

struct Ticket<T> {
    created_at: Instant,
    pool: Arc<ResourcePool<T>>,
    _permit: OwnedSemaphorePermit,
    settled: bool,
}

impl<T> Drop for Ticket<T> {
    fn drop(&mut self) {
        if !self.settled {
            self.pool.total.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl<T> ResourcePool<T> {
    pub fn new(max_size: usize) -> Arc<Self> {
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(max_size)),
            idle: Mutex::new(Vec::with_capacity(max_size)),
            total: AtomicUsize::new(0),
            max_size,
        })
    }

    /// Wait for capacity, then take the most recently released idle resource
    /// or a vacant slot.
    pub async fn acquire(self: &Arc<Self>) -> PgResult<Acquired<T>> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| PgError::PoolClosed)?;
        Ok(self.take_idle_or_vacant(permit))
    }

    /// Reserve capacity for a new resource without waiting.
    pub fn try_reserve(self: &Arc<Self>) -> Option<Slot<T>> {
        let permit = Arc::clone(&self.semaphore).try_acquire_owned().ok()?;
        Some(Slot {
            permit,
            pool: Arc::clone(self),
        })
    }

    fn take_idle_or_vacant(self: &Arc<Self>, permit: OwnedSemaphorePermit) -> Acquired<T> {
        match self.idle.lock().pop() {
            Some(entry) => Acquired::Idle(Resource {
                value: entry.value,
                ticket: Ticket {
                    created_at: entry.created_at,
                    pool: Arc::clone(self),
                    _permit: permit,
                    settled: false,
                },
            }),
            None => Acquired::Vacant(Slot {
                permit,
                pool: Arc::clone(self),
            }),
        }
    }

    /// Remove idle resources matching `predicate` and hand them back for
    /// closing. They no longer count toward [`total`](Self::total).
    pub fn remove_idle(&self, mut predicate: impl FnMut(&T, IdleInfo) -> bool) -> Vec<T> {
        let mut idle = self.idle.lock();
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(idle.len());
        for entry in idle.drain(..) {
            let info = IdleInfo {
                created_at: entry.created_at,
                idle_since: entry.idle_since,
            };
            if predicate(&entry.value, info) {
                removed.push(entry.value);
            } else {
                kept.push(entry);
            }
        }
        *idle = kept;
        drop(idle);
        self.total.fetch_sub(removed.len(), Ordering::AcqRel);
        removed
    }

    /// Stop handing out resources and return every idle one.
    pub fn close(&self) -> Vec<T> {
        self.semaphore.close();
        self.remove_idle(|_, _| true)
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    /// Resources in existence: idle, checked out, or just created.
    pub fn total(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    pub fn idle_len(&self) -> usize {
        self.idle.lock().len()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }
}

impl<T> Resource<T> {
    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut T {
        &mut self.value
    }

    pub fn created_at(&self) -> Instant {
        self.ticket.created_at
    }

    pub fn age(&self) -> Duration {
        self.ticket.created_at.elapsed()
    }

    /// Return the resource to the idle list. On a closed pool the value is
    /// dropped instead.
    pub fn release(self) {
        let Resource { value, mut ticket } = self;
        if ticket.pool.is_closed() {
            return;
        }
        ticket.pool.idle.lock().push(IdleEntry {
            value,
            created_at: ticket.created_at,
            idle_since: Instant::now(),
        });
        ticket.settled = true;
    }

    /// Remove the resource from the pool and return it for closing.
    pub fn destroy(self) -> T {
        self.value
    }

    /// Remove the resource from the pool and give it to the caller for good.
    pub fn hijack(self) -> T {
        self.value
    }
}
