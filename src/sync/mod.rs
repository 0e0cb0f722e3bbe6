/*
 * Synchronization Primitives
 *
 * Every primitive shares the same skeleton: take the scheduler lock,
 * check the structure tag, mutate the primitive's state and its
 * priority-sorted wait queue, wake whoever becomes eligible, reschedule.
 */

pub mod event;
pub mod fastmutex;
pub mod msgqueue;
pub mod mutex;
pub mod rendezvous;
pub mod semaphore;
pub mod spinlock;

pub use event::{EventMode, OsEvent};
pub use fastmutex::OsFastMutex;
pub use msgqueue::{MessageFlags, OsMessage, OsMessageQueue};
pub use mutex::{OsCondition, OsMutex};
pub use rendezvous::OsRendezvous;
pub use semaphore::OsSemaphore;
pub use spinlock::OsSpinLock;

#[cfg(test)]
mod tests;
