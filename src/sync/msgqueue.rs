/*
 * Message Queue
 *
 * Ring buffer of fixed 16-byte messages with separate send and receive
 * wait queues. Blocking send sleeps while the ring is full; blocking
 * receive while it is empty. High-priority messages are inserted at the
 * front of the ring.
 */

use bitflags::bitflags;

use crate::guest::VirtAddr;
use crate::scheduler;
use crate::thread::ThreadQueue;
use crate::Core;

pub const MESSAGE_QUEUE_TAG: u32 = 0x6D53_6751; // "mSgQ"

bitflags! {
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub struct MessageFlags: u32 {
        const BLOCKING = 1 << 0;
        const HIGH_PRIORITY = 1 << 1;
    }
}

guest_struct! {
    /// One 16-byte message: a header word plus three payload words.
    pub struct OsMessage : 0x10 {
        0x00 => message, set_message: u32;
        0x04 => arg0, set_arg0: u32;
        0x08 => arg1, set_arg1: u32;
        0x0C => arg2, set_arg2: u32;
    }
}

guest_struct! {
    pub struct OsMessageQueue : 0x3C {
        0x00 => tag, set_tag: u32;
        0x04 => name, set_name: addr;
        0x0C => send_queue: struct ThreadQueue;
        0x1C => recv_queue: struct ThreadQueue;
        0x2C => messages, set_messages: addr;
        0x30 => size, set_size: u32;
        0x34 => first, set_first: u32;
        0x38 => used, set_used: u32;
    }
}

fn message_at(queue: OsMessageQueue, mem: &crate::guest::GuestMemory, index: u32) -> VirtAddr {
    queue.messages(mem).offset(index * OsMessage::SIZE)
}

impl<'k> Core<'k> {
    pub fn init_message_queue(&self, queue: OsMessageQueue, messages: VirtAddr, size: u32) {
        self.init_message_queue_ex(queue, messages, size, VirtAddr::NULL)
    }

    pub fn init_message_queue_ex(
        &self,
        queue: OsMessageQueue,
        messages: VirtAddr,
        size: u32,
        name: VirtAddr,
    ) {
        let mem = self.mem();
        queue.set_tag(mem, MESSAGE_QUEUE_TAG);
        queue.set_name(mem, name);
        queue.set_messages(mem, messages);
        queue.set_size(mem, size);
        queue.set_first(mem, 0);
        queue.set_used(mem, 0);
        crate::thread::init_thread_queue_ex(mem, queue.send_queue(), queue.addr());
        crate::thread::init_thread_queue_ex(mem, queue.recv_queue(), queue.addr());
    }

    /// Insert a message. Without `BLOCKING` a full queue fails
    /// immediately; `HIGH_PRIORITY` inserts at the front.
    pub fn send_message(
        &self,
        queue: OsMessageQueue,
        message: OsMessage,
        flags: MessageFlags,
    ) -> bool {
        let k = self.k;
        let mem = self.mem();
        scheduler::lock(k, self.id);
        debug_assert!(queue.tag(mem) == MESSAGE_QUEUE_TAG);

        if !flags.contains(MessageFlags::BLOCKING) && queue.used(mem) == queue.size(mem) {
            scheduler::unlock(k, self.id);
            return false;
        }

        while queue.used(mem) == queue.size(mem) {
            scheduler::sleep_thread_no_lock(self, queue.send_queue().addr());
            scheduler::reschedule_self_no_lock(self);
        }

        let index = if flags.contains(MessageFlags::HIGH_PRIORITY) {
            let first = if queue.first(mem) == 0 {
                queue.size(mem) - 1
            } else {
                queue.first(mem) - 1
            };
            queue.set_first(mem, first);
            first
        } else {
            (queue.first(mem) + queue.used(mem)) % queue.size(mem)
        };

        mem.copy(message_at(queue, mem, index), message.addr(), OsMessage::SIZE);
        queue.set_used(mem, queue.used(mem) + 1);

        scheduler::wakeup_thread_no_lock(k, queue.recv_queue().addr());
        scheduler::reschedule_all_cores_no_lock(self);

        scheduler::unlock(k, self.id);
        true
    }

    /// Remove the front message. Without `BLOCKING` an empty queue fails
    /// immediately.
    pub fn receive_message(
        &self,
        queue: OsMessageQueue,
        message: OsMessage,
        flags: MessageFlags,
    ) -> bool {
        let k = self.k;
        let mem = self.mem();
        scheduler::lock(k, self.id);
        debug_assert!(queue.tag(mem) == MESSAGE_QUEUE_TAG);

        if !flags.contains(MessageFlags::BLOCKING) && queue.used(mem) == 0 {
            scheduler::unlock(k, self.id);
            return false;
        }

        while queue.used(mem) == 0 {
            scheduler::sleep_thread_no_lock(self, queue.recv_queue().addr());
            scheduler::reschedule_self_no_lock(self);
        }

        mem.copy(message.addr(), message_at(queue, mem, queue.first(mem)), OsMessage::SIZE);
        queue.set_first(mem, (queue.first(mem) + 1) % queue.size(mem));
        queue.set_used(mem, queue.used(mem) - 1);

        scheduler::wakeup_thread_no_lock(k, queue.send_queue().addr());
        scheduler::reschedule_all_cores_no_lock(self);

        scheduler::unlock(k, self.id);
        true
    }

    /// Copy the front message without removing it.
    pub fn peek_message(&self, queue: OsMessageQueue, message: OsMessage) -> bool {
        let k = self.k;
        let mem = self.mem();
        scheduler::lock(k, self.id);
        debug_assert!(queue.tag(mem) == MESSAGE_QUEUE_TAG);

        if queue.used(mem) == 0 {
            scheduler::unlock(k, self.id);
            return false;
        }

        mem.copy(message.addr(), message_at(queue, mem, queue.first(mem)), OsMessage::SIZE);
        scheduler::unlock(k, self.id);
        true
    }
}
