// 单生产者/单消费者字节环形缓冲
// 下行音频接收通路的分帧基础，读写双方无锁并发

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// SPSC 字节 FIFO。
///
/// 约定：同一时刻最多一个线程调用写端操作（`write`）、最多一个线程调用
/// 读端操作（`read`/`peek`/`discard`）。满足该约定时无数据竞争，且写入的
/// 字节按原序变为可读。容量中保留一个空槽区分空/满，因此恒有
/// `readable + writable + 1 == capacity`。
pub struct RingBuffer {
    buf: UnsafeCell<Box<[u8]>>,
    capacity: usize,
    read_pos: AtomicUsize,
    write_pos: AtomicUsize,
}

// 指针推进只由各自持有方执行，内容可见性由 release/acquire 配对保证
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 2, "ring buffer capacity must be at least 2");
        Self {
            buf: UnsafeCell::new(vec![0u8; capacity].into_boxed_slice()),
            capacity,
            read_pos: AtomicUsize::new(0),
            write_pos: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn base(&self) -> *mut u8 {
        unsafe { (*self.buf.get()).as_mut_ptr() }
    }

    /// 写入数据，返回实际写入的字节数（不足时截断）。
    pub fn write(&self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }

        let write_pos = self.write_pos.load(Ordering::Relaxed);
        let read_pos = self.read_pos.load(Ordering::Acquire);
        let writable = self.writable_at(read_pos, write_pos);

        let to_write = data.len().min(writable);
        if to_write == 0 {
            return 0;
        }

        // 环绕时拆成两段拷贝；[write_pos, write_pos+to_write) 此刻只归写端所有
        let first = to_write.min(self.capacity - write_pos);
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.base().add(write_pos), first);
            if first < to_write {
                std::ptr::copy_nonoverlapping(data.as_ptr().add(first), self.base(), to_write - first);
            }
        }

        self.write_pos
            .store((write_pos + to_write) % self.capacity, Ordering::Release);
        to_write
    }

    /// 读取数据，返回实际读取的字节数。
    pub fn read(&self, out: &mut [u8]) -> usize {
        if out.is_empty() {
            return 0;
        }

        let read_pos = self.read_pos.load(Ordering::Relaxed);
        let write_pos = self.write_pos.load(Ordering::Acquire);
        let readable = self.readable_at(read_pos, write_pos);

        let to_read = out.len().min(readable);
        if to_read == 0 {
            return 0;
        }

        let first = to_read.min(self.capacity - read_pos);
        unsafe {
            std::ptr::copy_nonoverlapping(self.base().add(read_pos), out.as_mut_ptr(), first);
            if first < to_read {
                std::ptr::copy_nonoverlapping(self.base(), out.as_mut_ptr().add(first), to_read - first);
            }
        }

        self.read_pos
            .store((read_pos + to_read) % self.capacity, Ordering::Release);
        to_read
    }

    /// 从读位置偏移 `offset` 处非破坏性拷贝 `out.len()` 字节。
    /// 可读数据不足 `offset + out.len()` 时返回 0，否则返回 `out.len()`。
    pub fn peek(&self, out: &mut [u8], offset: usize) -> usize {
        if out.is_empty() {
            return 0;
        }

        let read_pos = self.read_pos.load(Ordering::Relaxed);
        let write_pos = self.write_pos.load(Ordering::Acquire);
        let readable = self.readable_at(read_pos, write_pos);

        if readable < offset + out.len() {
            return 0;
        }

        let peek_pos = (read_pos + offset) % self.capacity;
        let first = out.len().min(self.capacity - peek_pos);
        unsafe {
            std::ptr::copy_nonoverlapping(self.base().add(peek_pos), out.as_mut_ptr(), first);
            if first < out.len() {
                std::ptr::copy_nonoverlapping(self.base(), out.as_mut_ptr().add(first), out.len() - first);
            }
        }
        out.len()
    }

    /// 丢弃最多 `len` 字节，返回实际丢弃的字节数。
    pub fn discard(&self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }

        let read_pos = self.read_pos.load(Ordering::Relaxed);
        let write_pos = self.write_pos.load(Ordering::Acquire);
        let readable = self.readable_at(read_pos, write_pos);

        let to_discard = len.min(readable);
        if to_discard == 0 {
            return 0;
        }

        self.read_pos
            .store((read_pos + to_discard) % self.capacity, Ordering::Release);
        to_discard
    }

    pub fn readable_size(&self) -> usize {
        let read_pos = self.read_pos.load(Ordering::Relaxed);
        let write_pos = self.write_pos.load(Ordering::Acquire);
        self.readable_at(read_pos, write_pos)
    }

    pub fn writable_size(&self) -> usize {
        let read_pos = self.read_pos.load(Ordering::Acquire);
        let write_pos = self.write_pos.load(Ordering::Relaxed);
        self.writable_at(read_pos, write_pos)
    }

    pub fn is_empty(&self) -> bool {
        self.readable_size() == 0
    }

    /// 复位读写指针。调用方必须保证此刻没有并发的读写线程。
    pub fn clear(&self) {
        self.read_pos.store(0, Ordering::Release);
        self.write_pos.store(0, Ordering::Release);
    }

    fn readable_at(&self, read_pos: usize, write_pos: usize) -> usize {
        (write_pos + self.capacity - read_pos) % self.capacity
    }

    fn writable_at(&self, read_pos: usize, write_pos: usize) -> usize {
        self.capacity - self.readable_at(read_pos, write_pos) - 1
    }
}
