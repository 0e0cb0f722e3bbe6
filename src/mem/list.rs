/*
 * MEMList
 *
 * Offset-based doubly linked list used by the heap registry. Unlike the
 * thread queues, the link offset is stored in the list header itself, so
 * one implementation serves any object carrying a MEMListLink.
 */

use crate::guest::{GuestMemory, VirtAddr};

guest_struct! {
    pub struct MemListLink : 0x08 {
        0x00 => prev, set_prev: addr;
        0x04 => next, set_next: addr;
    }
}

guest_struct! {
    pub struct MemList : 0x0C {
        0x00 => head, set_head: addr;
        0x04 => tail, set_tail: addr;
        0x08 => count, set_count: u16;
        0x0A => link_offset, set_link_offset: u16;
    }
}

fn link(mem: &GuestMemory, list: MemList, object: VirtAddr) -> MemListLink {
    MemListLink(object.offset(list.link_offset(mem) as u32))
}

pub fn init_list(mem: &GuestMemory, list: MemList, link_offset: u16) {
    list.set_head(mem, VirtAddr::NULL);
    list.set_tail(mem, VirtAddr::NULL);
    list.set_count(mem, 0);
    list.set_link_offset(mem, link_offset);
}

fn set_first_object(mem: &GuestMemory, list: MemList, object: VirtAddr) {
    let l = link(mem, list, object);
    list.set_head(mem, object);
    list.set_tail(mem, object);
    l.set_next(mem, VirtAddr::NULL);
    l.set_prev(mem, VirtAddr::NULL);
    list.set_count(mem, 1);
}

pub fn append_object(mem: &GuestMemory, list: MemList, object: VirtAddr) {
    let tail = list.tail(mem);
    if tail.is_null() {
        set_first_object(mem, list, object);
    } else {
        let l = link(mem, list, object);
        let t = link(mem, list, tail);
        t.set_next(mem, object);
        l.set_prev(mem, tail);
        l.set_next(mem, VirtAddr::NULL);
        list.set_tail(mem, object);
        list.set_count(mem, list.count(mem) + 1);
    }
}

pub fn prepend_object(mem: &GuestMemory, list: MemList, object: VirtAddr) {
    let head = list.head(mem);
    if head.is_null() {
        set_first_object(mem, list, object);
    } else {
        let l = link(mem, list, object);
        let h = link(mem, list, head);
        h.set_prev(mem, object);
        l.set_prev(mem, VirtAddr::NULL);
        l.set_next(mem, head);
        list.set_head(mem, object);
        list.set_count(mem, list.count(mem) + 1);
    }
}

pub fn remove_object(mem: &GuestMemory, list: MemList, object: VirtAddr) {
    let l = link(mem, list, object);
    let prev = l.prev(mem);
    let next = l.next(mem);

    if prev.is_null() {
        list.set_head(mem, next);
    } else {
        link(mem, list, prev).set_next(mem, next);
    }

    if next.is_null() {
        list.set_tail(mem, prev);
    } else {
        link(mem, list, next).set_prev(mem, prev);
    }

    l.set_prev(mem, VirtAddr::NULL);
    l.set_next(mem, VirtAddr::NULL);
    list.set_count(mem, list.count(mem).saturating_sub(1));
}

/// Iterate: pass null to get the head, then the previous object to walk.
pub fn next_object(mem: &GuestMemory, list: MemList, prev: VirtAddr) -> VirtAddr {
    if prev.is_null() {
        list.head(mem)
    } else {
        link(mem, list, prev).next(mem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest::{GuestMemory, VirtAddr};

    #[test]
    fn append_remove_iterate() {
        let mut gm = GuestMemory::new();
        gm.map(0x1000, 0x1000);
        let mem = &gm;

        let list = MemList(VirtAddr(0x1000));
        init_list(mem, list, 4);

        let a = VirtAddr(0x1100);
        let b = VirtAddr(0x1120);
        let c = VirtAddr(0x1140);
        append_object(mem, list, a);
        append_object(mem, list, b);
        prepend_object(mem, list, c);

        assert_eq!(list.count(mem), 3);
        assert_eq!(next_object(mem, list, VirtAddr::NULL), c);
        assert_eq!(next_object(mem, list, c), a);
        assert_eq!(next_object(mem, list, a), b);
        assert!(next_object(mem, list, b).is_null());

        remove_object(mem, list, a);
        assert_eq!(list.count(mem), 2);
        assert_eq!(next_object(mem, list, c), b);
    }
}
