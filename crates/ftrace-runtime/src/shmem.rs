//! Per-thread shared-memory buffer ring
//!
//! Each traced thread streams its records through a sequence of fixed-size
//! shmem segments. The producer appends to the current segment and rotates
//! when a record no longer fits; the recorder maps segments by name and
//! drains the ones handed over at rotation. The segment flag word is the
//! only datum shared with the recorder: the producer ORs bits in, the
//! consumer clears RECORDING when it has drained a segment.
//!
//! When no writable segment can be obtained the ring switches to dropping
//! (`curr = -1`); dropped events are counted and surfaced as a LOST record
//! at the head of the next good segment.

use std::ffi::CString;
use std::sync::atomic::{AtomicU32, Ordering};

use ftrace_core::buffer::{self, BUF_HDR_SIZE, SHMEM_FL_NEW, SHMEM_FL_RECORDING, SHMEM_FL_WRITTEN};
use ftrace_core::dbg::Domain;
use ftrace_core::error::{ResourceError, TraceResult};
use ftrace_core::record::{align_up, Record, RECORD_SIZE};
use ftrace_core::tdbg;

use crate::pipe::ControlPipe;

#[repr(C)]
struct BufHeader {
    size: AtomicU32,
    flag: AtomicU32,
}

/// One mapped segment
pub struct ShmemBuffer {
    ptr: *mut u8,
    len: usize,
}

impl ShmemBuffer {
    /// Create (or truncate) the named segment and map it
    pub fn allocate(name: &str, len: usize) -> TraceResult<ShmemBuffer> {
        let cname = CString::new(name).map_err(|_| ResourceError::ShmOpen)?;

        let fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_TRUNC,
                0o600 as libc::mode_t,
            )
        };
        if fd < 0 {
            tdbg!(Domain::Shmem, 1, "failed to open shmem buffer: {}", name);
            return Err(ResourceError::ShmOpen.into());
        }

        if unsafe { libc::ftruncate(fd, len as libc::off_t) } < 0 {
            tdbg!(Domain::Shmem, 1, "failed to resize shmem buffer: {}", name);
            unsafe { libc::close(fd) };
            return Err(ResourceError::ShmResize.into());
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };

        if ptr == libc::MAP_FAILED {
            tdbg!(Domain::Shmem, 1, "failed to mmap shmem buffer: {}", name);
            return Err(ResourceError::ShmMap.into());
        }

        let buf = ShmemBuffer { ptr: ptr as *mut u8, len };
        buf.header().size.store(0, Ordering::Release);
        buf.header().flag.store(SHMEM_FL_NEW, Ordering::Release);
        Ok(buf)
    }

    /// Remove the backing name; mappings stay valid until unmapped
    pub fn unlink(name: &str) {
        if let Ok(cname) = CString::new(name) {
            unsafe {
                libc::shm_unlink(cname.as_ptr());
            }
        }
    }

    fn header(&self) -> &BufHeader {
        unsafe { &*(self.ptr as *const BufHeader) }
    }

    pub fn flag(&self) -> u32 {
        self.header().flag.load(Ordering::Acquire)
    }

    pub fn store_flag(&self, v: u32) {
        self.header().flag.store(v, Ordering::Release);
    }

    pub fn or_flag(&self, bits: u32) {
        self.header().flag.fetch_or(bits, Ordering::AcqRel);
    }

    pub fn data_size(&self) -> usize {
        self.header().size.load(Ordering::Acquire) as usize
    }

    fn set_data_size(&self, n: usize) {
        self.header().size.store(n as u32, Ordering::Release);
    }

    pub fn capacity(&self) -> usize {
        self.len - BUF_HDR_SIZE
    }

    /// The record bytes written so far
    pub fn data(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.add(BUF_HDR_SIZE), self.data_size()) }
    }

    fn write_at(&self, offset: usize, bytes: &[u8]) {
        debug_assert!(offset + bytes.len() <= self.capacity());
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.ptr.add(BUF_HDR_SIZE + offset),
                bytes.len(),
            );
        }
    }
}

impl Drop for ShmemBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

/// The per-thread ring of segments
pub struct ShmemRing {
    buffers: Vec<ShmemBuffer>,
    /// Index of the current write segment; -1 means dropping
    curr: isize,
    seqnum: u32,
    losts: u64,
    max_buf: usize,
    bufsize: usize,
    sid: String,
    tid: u32,
    alloc_limit: usize,
}

impl Default for ShmemRing {
    fn default() -> Self {
        Self::new()
    }
}

impl ShmemRing {
    pub const fn new() -> Self {
        ShmemRing {
            buffers: Vec::new(),
            curr: -1,
            seqnum: 0,
            losts: 0,
            max_buf: 0,
            bufsize: 0,
            sid: String::new(),
            tid: 0,
            alloc_limit: usize::MAX,
        }
    }

    pub fn is_prepared(&self) -> bool {
        !self.buffers.is_empty()
    }

    pub fn nr_buf(&self) -> usize {
        self.buffers.len()
    }

    pub fn max_buf(&self) -> usize {
        self.max_buf
    }

    pub fn seqnum(&self) -> u32 {
        self.seqnum
    }

    pub fn losts(&self) -> u64 {
        self.losts
    }

    pub fn add_lost(&mut self, n: u64) {
        self.losts += n;
    }

    pub fn curr_index(&self) -> Option<usize> {
        if self.curr < 0 {
            None
        } else {
            Some(self.curr as usize)
        }
    }

    pub fn buffer(&self, idx: usize) -> Option<&ShmemBuffer> {
        self.buffers.get(idx)
    }

    pub fn curr_buf(&self) -> Option<&ShmemBuffer> {
        self.curr_index().and_then(|i| self.buffers.get(i))
    }

    pub fn segment_name(&self, idx: usize) -> String {
        buffer::segment_name(&self.sid, self.tid, idx)
    }

    /// Cap ring growth; used to exercise the drop path in tests
    #[cfg(test)]
    pub(crate) fn set_alloc_limit(&mut self, n: usize) {
        self.alloc_limit = n;
    }

    fn allocate_at(&self, idx: usize) -> TraceResult<ShmemBuffer> {
        if self.bufsize <= BUF_HDR_SIZE || idx >= self.alloc_limit {
            return Err(ResourceError::ShmOpen.into());
        }
        ShmemBuffer::allocate(&buffer::segment_name(&self.sid, self.tid, idx), self.bufsize)
    }

    /// Pre-allocate two segments and start recording into segment 0
    pub fn prepare(&mut self, sid: &str, tid: u32, bufsize: usize, pipe: &ControlPipe) -> TraceResult<()> {
        tdbg!(Domain::Shmem, 2, "preparing shmem buffers for tid {}", tid);

        self.sid = sid.to_string();
        self.tid = tid;
        self.bufsize = bufsize;

        for idx in 0..2 {
            let buf = self.allocate_at(idx)?;
            self.buffers.push(buf);
        }
        self.max_buf = 2;

        self.buffers[0].store_flag(SHMEM_FL_RECORDING);
        self.curr = 0;
        pipe.send_rec_start(&self.segment_name(0));
        Ok(())
    }

    /// Hand the current segment to the recorder and start a new one.
    /// On allocation failure the ring enters dropping mode.
    pub fn rotate(&mut self, pipe: &ControlPipe) {
        if let Some(idx) = self.curr_index() {
            pipe.send_rec_end(&self.segment_name(idx));
            self.buffers[idx].or_flag(SHMEM_FL_WRITTEN);
        }

        // always reuse the lowest segment the consumer is done with
        let reuse = self
            .buffers
            .iter()
            .position(|b| b.flag() & SHMEM_FL_RECORDING == 0);

        let idx = match reuse {
            Some(idx) => idx,
            None => {
                let idx = self.buffers.len();
                match self.allocate_at(idx) {
                    Ok(buf) => {
                        self.buffers.push(buf);
                        self.max_buf = self.max_buf.max(self.buffers.len());
                        idx
                    }
                    Err(_) => {
                        self.curr = -1;
                        return;
                    }
                }
            }
        };

        let buf = &self.buffers[idx];
        buf.set_data_size(0);
        buf.or_flag(SHMEM_FL_RECORDING);
        self.seqnum += 1;
        self.curr = idx as isize;

        self.shrink(idx);

        pipe.send_rec_start(&self.segment_name(idx));
        tdbg!(Domain::Shmem, 2, "new buffer: [{}] {}", idx, self.segment_name(idx));

        if self.losts > 0 {
            let mut head = [0u8; RECORD_SIZE];
            Record::lost(self.losts).encode(&mut head);
            let buf = &self.buffers[idx];
            buf.write_at(0, &head);
            buf.set_data_size(RECORD_SIZE);

            pipe.send_lost(self.losts as u32);
            self.losts = 0;
        }
    }

    /// Unmap the trailing segment once three or more segments behind the
    /// current one have been drained by the consumer.
    fn shrink(&mut self, curr_idx: usize) {
        let drained = self.buffers[curr_idx + 1..]
            .iter()
            .filter(|b| b.flag() == SHMEM_FL_WRITTEN)
            .count();

        if drained >= 3 && self.buffers.last().map_or(false, |b| b.flag() == SHMEM_FL_WRITTEN) {
            self.buffers.pop();
            tdbg!(Domain::Shmem, 2, "shrink to {} buffers", self.buffers.len());
        }
    }

    /// Append one whole record plus an optional payload (padded to 8).
    /// Returns false and counts a lost event when the record was dropped.
    pub fn append(&mut self, pipe: &ControlPipe, rec: &Record, payload: Option<&[u8]>) -> bool {
        let padded = payload.map_or(0, |p| align_up(p.len(), 8));
        let total = RECORD_SIZE + padded;

        let fits = self
            .curr_buf()
            .map_or(false, |b| b.data_size() + total <= b.capacity());
        if !fits {
            self.rotate(pipe);
        }

        let idx = match self.curr_index() {
            Some(idx) => idx,
            None => {
                self.losts += 1;
                return false;
            }
        };
        if self.buffers[idx].data_size() + total > self.buffers[idx].capacity() {
            self.losts += 1;
            return false;
        }

        let buf = &self.buffers[idx];
        let off = buf.data_size();
        let mut hdr = [0u8; RECORD_SIZE];
        rec.encode(&mut hdr);
        buf.write_at(off, &hdr);

        if let Some(p) = payload {
            buf.write_at(off + RECORD_SIZE, p);
            let pad = padded - p.len();
            if pad > 0 {
                buf.write_at(off + RECORD_SIZE + p.len(), &[0u8; 8][..pad]);
            }
        }

        buf.set_data_size(off + total);
        true
    }

    /// Hand over any segment still recording and unmap everything
    pub fn finish(&mut self, pipe: &ControlPipe) {
        for (idx, buf) in self.buffers.iter().enumerate() {
            if buf.flag() & SHMEM_FL_RECORDING != 0 {
                pipe.send_rec_end(&self.segment_name(idx));
            }
        }

        if self.is_prepared() {
            tdbg!(
                Domain::Shmem,
                1,
                "tid {}: seqnum={} nr_buf={} max_buf={}",
                self.tid,
                self.seqnum,
                self.buffers.len(),
                self.max_buf
            );
        }

        self.buffers.clear();
        self.curr = -1;
    }

    /// Fork child: the mappings belong to the parent's ring. Leave the
    /// pages untouched and reset to an empty ring.
    pub fn discard_inherited(&mut self) {
        for buf in self.buffers.drain(..) {
            std::mem::forget(buf);
        }
        self.curr = -1;
        self.seqnum = 0;
        self.losts = 0;
        self.max_buf = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock;
    use ftrace_core::record::RecordType;

    const BUFSIZE: usize = BUF_HDR_SIZE + 4 * RECORD_SIZE;

    struct TestRing {
        ring: ShmemRing,
        pipe: ControlPipe,
    }

    impl TestRing {
        fn new(bufsize: usize) -> Self {
            let sid = clock::gen_session_id().unwrap();
            let mut ring = ShmemRing::new();
            let pipe = ControlPipe::disabled();
            ring.prepare(&sid, clock::tid(), bufsize, &pipe).unwrap();
            TestRing { ring, pipe }
        }

        fn entry(&self, addr: u64) -> Record {
            Record {
                time: 100,
                rtype: RecordType::Entry,
                more: false,
                depth: 0,
                addr,
            }
        }
    }

    impl Drop for TestRing {
        fn drop(&mut self) {
            for idx in 0..self.ring.max_buf().max(self.ring.nr_buf()) {
                ShmemBuffer::unlink(&self.ring.segment_name(idx));
            }
        }
    }

    #[test]
    fn test_prepare() {
        let t = TestRing::new(BUFSIZE);
        assert_eq!(t.ring.nr_buf(), 2);
        assert_eq!(t.ring.curr_index(), Some(0));
        assert_eq!(t.ring.buffer(0).unwrap().flag(), SHMEM_FL_RECORDING);
        assert_eq!(t.ring.buffer(1).unwrap().flag(), SHMEM_FL_NEW);
    }

    #[test]
    fn test_append_and_read_back() {
        let mut t = TestRing::new(BUFSIZE);
        let rec = t.entry(0x1234);
        assert!(t.ring.append(&t.pipe, &rec, None));

        let data = t.ring.curr_buf().unwrap().data();
        assert_eq!(data.len(), RECORD_SIZE);
        assert_eq!(Record::decode(data), Some(rec));
    }

    #[test]
    fn test_payload_padded_to_eight() {
        let mut t = TestRing::new(BUFSIZE);
        let mut rec = t.entry(0x1234);
        rec.more = true;
        assert!(t.ring.append(&t.pipe, &rec, Some(&[1, 2, 3, 4, 5])));

        let data = t.ring.curr_buf().unwrap().data();
        assert_eq!(data.len(), RECORD_SIZE + 8);
        assert_eq!(&data[RECORD_SIZE..RECORD_SIZE + 5], &[1, 2, 3, 4, 5]);
        assert_eq!(&data[RECORD_SIZE + 5..], &[0, 0, 0]);
    }

    #[test]
    fn test_rotation_reuses_second_buffer() {
        let mut t = TestRing::new(BUFSIZE);
        for i in 0..5 {
            assert!(t.ring.append(&t.pipe, &t.entry(i), None));
        }
        // four records filled segment 0, the fifth rotated to segment 1
        assert_eq!(t.ring.curr_index(), Some(1));
        assert_eq!(t.ring.seqnum(), 1);
        assert_eq!(t.ring.nr_buf(), 2);

        let prev = t.ring.buffer(0).unwrap();
        assert!(prev.flag() & SHMEM_FL_WRITTEN != 0);
        assert!(prev.flag() & SHMEM_FL_RECORDING != 0); // consumer not done yet
        assert_eq!(t.ring.curr_buf().unwrap().data().len(), RECORD_SIZE);
    }

    #[test]
    fn test_records_never_straddle_buffers() {
        let mut t = TestRing::new(BUFSIZE);
        for i in 0..11 {
            assert!(t.ring.append(&t.pipe, &t.entry(i), None));
        }
        for idx in 0..t.ring.nr_buf() {
            assert_eq!(t.ring.buffer(idx).unwrap().data_size() % RECORD_SIZE, 0);
        }
    }

    #[test]
    fn test_ring_extends_when_consumer_is_slow() {
        let mut t = TestRing::new(BUFSIZE);
        for i in 0..9 {
            assert!(t.ring.append(&t.pipe, &t.entry(i), None));
        }
        // 9 records, 4 per segment, nothing drained: a third segment exists
        assert_eq!(t.ring.nr_buf(), 3);
        assert_eq!(t.ring.max_buf(), 3);
    }

    #[test]
    fn test_drops_counted_and_lost_record_emitted() {
        let mut t = TestRing::new(BUFSIZE);
        t.ring.set_alloc_limit(2);

        for i in 0..8 {
            assert!(t.ring.append(&t.pipe, &t.entry(i), None));
        }
        // both segments full and still recording: the next three drop
        for i in 0..3 {
            assert!(!t.ring.append(&t.pipe, &t.entry(100 + i), None));
        }
        assert_eq!(t.ring.losts(), 3);
        assert_eq!(t.ring.curr_index(), None);

        // consumer drains segment 0
        t.ring.buffer(0).unwrap().store_flag(SHMEM_FL_WRITTEN);

        assert!(t.ring.append(&t.pipe, &t.entry(200), None));
        assert_eq!(t.ring.losts(), 0);

        let data = t.ring.curr_buf().unwrap().data();
        let lost = Record::decode(data).unwrap();
        assert_eq!(lost.rtype, RecordType::Lost);
        assert_eq!(lost.addr, 3);
        assert_eq!(lost.time, 0);

        let real = Record::decode(&data[RECORD_SIZE..]).unwrap();
        assert_eq!(real.addr, 200);
    }

    #[test]
    fn test_shrink_after_three_drained() {
        let mut t = TestRing::new(BUFSIZE);
        for i in 0..20 {
            assert!(t.ring.append(&t.pipe, &t.entry(i), None));
        }
        assert_eq!(t.ring.nr_buf(), 5);
        assert_eq!(t.ring.curr_index(), Some(4));

        // consumer drains everything behind the writer
        for idx in 0..4 {
            t.ring.buffer(idx).unwrap().store_flag(SHMEM_FL_WRITTEN);
        }
        t.ring.rotate(&t.pipe); // reuses segment 0, segment 4 still recording
        assert_eq!(t.ring.nr_buf(), 5);

        t.ring.buffer(4).unwrap().store_flag(SHMEM_FL_WRITTEN);
        t.ring.rotate(&t.pipe); // trailing segment drained: ring shrinks
        assert_eq!(t.ring.nr_buf(), 4);
    }

    #[test]
    fn test_finish_clears_ring() {
        let mut t = TestRing::new(BUFSIZE);
        t.ring.append(&t.pipe, &t.entry(1), None);
        t.ring.finish(&t.pipe);
        assert!(!t.ring.is_prepared());
        assert_eq!(t.ring.curr_index(), None);
    }

    #[test]
    fn test_discard_inherited_resets() {
        let mut t = TestRing::new(BUFSIZE);
        t.ring.append(&t.pipe, &t.entry(1), None);
        t.ring.add_lost(2);
        t.ring.discard_inherited();
        assert!(!t.ring.is_prepared());
        assert_eq!(t.ring.losts(), 0);
        assert_eq!(t.ring.seqnum(), 0);
    }
}
