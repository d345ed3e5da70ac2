//! Append-only list readable without locks while one writer grows it.
//!
//! Growth builds a new backing array, bit-copies the existing elements over,
//! publishes the new pointer with a release store, and only then bumps the
//! published count. A reader that acquires the count therefore always sees a
//! backing that holds every element below it. Retired backings are kept
//! allocated (their element bits untouched, ownership having moved to the
//! copy) until the list itself drops, so a reader that raced the resize keeps
//! a valid reference.
//!
//! Elements are immutable once appended; there is no removal.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use parking_lot::Mutex;

pub struct AppendList<T> {
    current: AtomicPtr<T>,
    count:   AtomicUsize,
    grow:    Mutex<Grow<T>>,
}

struct Grow<T> {
    cap:     usize,
    /// Former backings: pointer and capacity. Freed, never dropped
    /// element-wise, when the list drops.
    retired: Vec<(NonNull<T>, usize)>,
}

// Elements are reachable from any thread through `get`; the raw pointers are
// tied to allocations owned by `grow`.
unsafe impl<T: Send> Send for AppendList<T> {}
unsafe impl<T: Send + Sync> Sync for AppendList<T> {}

impl<T> AppendList<T> {
    pub fn new() -> Self {
        assert!(std::mem::size_of::<T>() != 0);
        Self {
            current: AtomicPtr::new(NonNull::dangling().as_ptr()),
            count:   AtomicUsize::new(0),
            grow:    Mutex::new(Grow { cap: 0, retired: Vec::new() }),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a value. Visible to `get` as soon as this returns.
    pub fn append(&self, value: T) {
        let mut grow = self.grow.lock();
        let n = self.count.load(Ordering::Relaxed);
        let mut cur = self.current.load(Ordering::Relaxed);

        if n == grow.cap {
            let new_cap = if grow.cap == 0 { 16 } else { grow.cap * 2 };
            let layout = Layout::array::<T>(new_cap).unwrap();
            let fresh = unsafe { alloc(layout) } as *mut T;
            if fresh.is_null() {
                handle_alloc_error(layout);
            }
            if grow.cap > 0 {
                // Bit-move: ownership transfers to the copy; the old backing
                // is retired without running drops.
                unsafe { ptr::copy_nonoverlapping(cur, fresh, n) };
                let old = unsafe { NonNull::new_unchecked(cur) };
                let old_cap = grow.cap;
                grow.retired.push((old, old_cap));
            }
            self.current.store(fresh, Ordering::Release);
            grow.cap = new_cap;
            cur = fresh;
        }

        unsafe { cur.add(n).write(value) };
        self.count.store(n + 1, Ordering::Release);
    }

    /// Read an element. Returns `None` above the published count.
    pub fn get(&self, index: usize) -> Option<&T> {
        if index >= self.count.load(Ordering::Acquire) {
            return None;
        }
        let cur = self.current.load(Ordering::Acquire);
        Some(unsafe { &*cur.add(index) })
    }
}

impl<T> Default for AppendList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for AppendList<T> {
    fn drop(&mut self) {
        let grow = self.grow.get_mut();
        let n = *self.count.get_mut();
        let cur = *self.current.get_mut();
        unsafe {
            if grow.cap > 0 {
                for i in 0..n {
                    ptr::drop_in_place(cur.add(i));
                }
                dealloc(cur as *mut u8, Layout::array::<T>(grow.cap).unwrap());
            }
            for (old, cap) in grow.retired.drain(..) {
                dealloc(old.as_ptr() as *mut u8, Layout::array::<T>(cap).unwrap());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn appended_values_are_immediately_readable() {
        let list = AppendList::new();
        assert!(list.is_empty());
        for i in 0..100u64 {
            list.append(i);
            assert_eq!(list.len(), i as usize + 1);
            assert_eq!(list.get(i as usize), Some(&i));
        }
        assert_eq!(list.get(100), None);
    }

    #[test]
    fn growth_preserves_existing_elements() {
        let list = AppendList::new();
        for i in 0..1000u32 {
            list.append(i);
        }
        for i in 0..1000u32 {
            assert_eq!(list.get(i as usize), Some(&i));
        }
    }

    #[test]
    fn drops_run_once_for_live_elements() {
        let marker = Arc::new(());
        {
            let list = AppendList::new();
            for _ in 0..100 {
                list.append(marker.clone());
            }
            assert_eq!(Arc::strong_count(&marker), 101);
        }
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn readers_race_a_growing_writer() {
        let list = Arc::new(AppendList::new());
        let writer = {
            let list = list.clone();
            std::thread::spawn(move || {
                for i in 0..100_000u64 {
                    list.append(i);
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let list = list.clone();
                std::thread::spawn(move || {
                    loop {
                        let n = list.len();
                        if n > 0 {
                            // Every index below the published count holds its
                            // appended value.
                            let probe = n - 1;
                            assert_eq!(list.get(probe), Some(&(probe as u64)));
                        }
                        if n == 100_000 {
                            break;
                        }
                    }
                })
            })
            .collect();
        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
    }
}
