// Copyright (c) 2021 Ant Group
//
// SPDX-License-Identifier: Apache-2.0
//

//! Bulk data transfer between two open handles.
//!
//! The engine picks the cheapest strategy each side supports: map both
//! sides and copy memory to memory, map one side and run plain I/O on the
//! other, or fall back to a small bounce buffer. Capability checks happen
//! up front, but a side can still be demoted mid-transfer when a window
//! fails to map; the loop then continues with the remaining strategy and
//! already-copied bytes are kept.
//!
//! Cursor discipline: on success, each handle's cursor lands exactly after
//! the bytes it produced or consumed. On failure after a partial transfer,
//! both cursors are positioned at start plus the number of bytes copied,
//! so a caller can retry from where the engine stopped.

use std::cell::Cell;
use std::cmp::min;
use std::io::SeekFrom;

use crate::error::{Result, VfsError};
use crate::fs::{MappedRegion, StreamCaps, StreamOps};
use crate::handle::{OpenFlags, VfsHandle};

/// Window size for mapped transfers.
const MAP_SIZE: u64 = 1 << 20;

/// Bounce-buffer size for the doubly-unmapped fallback.
const BUF_SIZE: usize = 2048;

const PAGE_SIZE: u64 = 4096;

fn align_down(v: u64) -> u64 {
    v & !(PAGE_SIZE - 1)
}

fn align_up(v: u64) -> u64 {
    align_down(v + PAGE_SIZE - 1)
}

/// Switch a non-blocking handle to blocking mode for the duration of the
/// copy, remembering the demotion in `mark` so the caller restores it.
fn demote_to_blocking(h: &VfsHandle, ops: &dyn StreamOps, mark: &Cell<bool>) {
    if !h.flags().contains(OpenFlags::NONBLOCK) {
        return;
    }
    if !h.stream_caps().contains(StreamCaps::SET_BLOCKING) {
        return;
    }
    if ops.set_blocking(h, true).is_ok() {
        mark.set(true);
        h.update_flags(OpenFlags::empty(), OpenFlags::NONBLOCK);
    }
}

fn map_window(
    h: &VfsHandle,
    ops: &dyn StreamOps,
    off: u64,
    len: u64,
    writable: bool,
) -> Result<(Box<dyn MappedRegion>, usize)> {
    let boff = off - align_down(off);
    let region = ops.mmap(h, off - boff, align_up(len + boff) as usize, writable)?;
    Ok((region, boff as usize))
}

/// Copy up to `count` bytes (to end of input when `None`) from `inp` to
/// `out`, returning the number of bytes transferred.
///
/// With `in_offset`, the input is read starting there instead of at its
/// cursor; the caller is responsible for any cursor restoration it wants.
/// A bounded request that ends early reports `WouldBlock` after
/// positioning both cursors past the partial transfer.
pub fn handle_copy(
    inp: &VfsHandle,
    in_offset: Option<u64>,
    out: &VfsHandle,
    count: Option<u64>,
) -> Result<u64> {
    let ops_in = inp.stream_ops()?.clone();
    let ops_out = out.stream_ops()?.clone();
    if count == Some(0) {
        return Ok(0);
    }

    let in_caps = inp.stream_caps();
    let out_caps = out.stream_caps();
    let mut do_mapi = in_caps.contains(StreamCaps::MMAP);
    let mut do_mapo = out_caps.contains(StreamCaps::MMAP);

    let mut offi = match in_offset {
        Some(off) => {
            if !in_caps.contains(StreamCaps::SEEK) {
                return Err(VfsError::AccessDenied(inp.path().to_string()));
            }
            ops_in.seek(inp, SeekFrom::Start(off))?;
            off
        }
        None => {
            if in_caps.contains(StreamCaps::SEEK) {
                match ops_in.seek(inp, SeekFrom::Current(0)) {
                    Ok(o) => o,
                    Err(_) => {
                        do_mapi = false;
                        0
                    }
                }
            } else {
                do_mapi = false;
                0
            }
        }
    };
    let mut offo = if out_caps.contains(StreamCaps::SEEK) {
        match ops_out.seek(out, SeekFrom::Current(0)) {
            Ok(o) => o,
            Err(_) => {
                do_mapo = false;
                0
            }
        }
    } else {
        do_mapo = false;
        0
    };

    let start_in = offi;
    let start_out = offo;

    // A mappable input needs a known size; it also clamps the request.
    let mut effective_count = count;
    if do_mapi {
        if in_caps.contains(StreamCaps::POLL) {
            match ops_in.poll_size(inp) {
                Ok(size) => {
                    let avail = size.saturating_sub(offi);
                    let clamped = match count {
                        Some(c) => min(c, avail),
                        None => avail,
                    };
                    if clamped == 0 {
                        return Ok(0);
                    }
                    effective_count = Some(clamped);
                }
                Err(_) => do_mapi = false,
            }
        } else {
            do_mapi = false;
        }
    }

    // A mappable output must be large enough to map the target range,
    // which is only checkable when the transfer size is known.
    if do_mapo {
        match effective_count {
            Some(c) => {
                let end = offo.saturating_add(c);
                if out_caps.contains(StreamCaps::POLL) {
                    match ops_out.poll_size(out) {
                        Ok(size) if end <= size => {}
                        Ok(_) => {
                            if !out_caps.contains(StreamCaps::TRUNCATE)
                                || ops_out.truncate(out, end).is_err()
                            {
                                do_mapo = false;
                            }
                        }
                        Err(_) => do_mapo = false,
                    }
                } else {
                    do_mapo = false;
                }
            }
            None => do_mapo = false,
        }
    }

    // Sides doing plain I/O must not short-read under O_NONBLOCK.
    let marki = Cell::new(false);
    let marko = Cell::new(false);
    if !do_mapi {
        demote_to_blocking(inp, ops_in.as_ref(), &marki);
    }
    if !do_mapo {
        demote_to_blocking(out, ops_out.as_ref(), &marko);
    }
    defer! {
        if marki.get() {
            let _ = ops_in.set_blocking(inp, false);
            inp.update_flags(OpenFlags::NONBLOCK, OpenFlags::empty());
        }
        if marko.get() {
            let _ = ops_out.set_blocking(out, false);
            out.update_flags(OpenFlags::NONBLOCK, OpenFlags::empty());
        }
    }

    let mut bytes: u64 = 0;
    let mut bufsize: u64 = MAP_SIZE;
    let mut err: Option<VfsError> = None;

    while effective_count.map_or(true, |c| bytes < c) {
        let mut expectsize = bufsize;
        if let Some(c) = effective_count {
            if c - bytes < bufsize {
                bufsize = c - bytes;
                expectsize = bufsize;
            }
        }

        let mapi = if do_mapi {
            match map_window(inp, ops_in.as_ref(), offi, bufsize, false) {
                Ok(m) => Some(m),
                Err(_) => {
                    do_mapi = false;
                    demote_to_blocking(inp, ops_in.as_ref(), &marki);
                    if in_caps.contains(StreamCaps::SEEK) {
                        let _ = ops_in.seek(inp, SeekFrom::Start(offi));
                    }
                    None
                }
            }
        } else {
            None
        };
        let mapo = if do_mapo {
            match map_window(out, ops_out.as_ref(), offo, bufsize, true) {
                Ok(m) => Some(m),
                Err(_) => {
                    do_mapo = false;
                    demote_to_blocking(out, ops_out.as_ref(), &marko);
                    if out_caps.contains(StreamCaps::SEEK) {
                        let _ = ops_out.seek(out, SeekFrom::Start(offo));
                    }
                    None
                }
            }
        } else {
            None
        };

        let copysize = match (mapi, mapo) {
            (Some((region_in, boffi)), Some((mut region_out, boffo))) => {
                let n = effective_count.map_or(bufsize, |c| min(c - bytes, bufsize)) as usize;
                region_out.as_mut_slice()[boffo..boffo + n]
                    .copy_from_slice(&region_in.as_slice()[boffi..boffi + n]);
                drop(region_in);
                if out_caps.contains(StreamCaps::FLUSH) {
                    let _ = ops_out.flush(out);
                }
                drop(region_out);
                n
            }
            (None, Some((mut region_out, boffo))) => {
                let n = bufsize as usize;
                let res = ops_in.read(inp, &mut region_out.as_mut_slice()[boffo..boffo + n]);
                if out_caps.contains(StreamCaps::FLUSH) {
                    let _ = ops_out.flush(out);
                }
                drop(region_out);
                match res {
                    Ok(n) => n,
                    Err(e) => {
                        err = Some(e);
                        break;
                    }
                }
            }
            (Some((region_in, boffi)), None) => {
                let n = bufsize as usize;
                let res = ops_out.write(out, &region_in.as_slice()[boffi..boffi + n]);
                drop(region_in);
                match res {
                    Ok(n) => n,
                    Err(e) => {
                        err = Some(e);
                        break;
                    }
                }
            }
            (None, None) => {
                if bufsize > BUF_SIZE as u64 {
                    bufsize = BUF_SIZE as u64;
                }
                let mut buf = [0u8; BUF_SIZE];
                let n = match ops_in.read(inp, &mut buf[..bufsize as usize]) {
                    Ok(n) => n,
                    Err(e) => {
                        err = Some(e);
                        break;
                    }
                };
                if n == 0 {
                    break;
                }
                expectsize = n as u64;
                match ops_out.write(out, &buf[..n]) {
                    Ok(w) => w,
                    Err(e) => {
                        err = Some(e);
                        break;
                    }
                }
            }
        };

        bytes += copysize as u64;
        offi += copysize as u64;
        offo += copysize as u64;
        if (copysize as u64) < expectsize {
            break;
        }
    }

    let bounded_short = effective_count.map_or(false, |c| bytes < c);
    if err.is_some() || bounded_short {
        // Park both cursors right after the partial transfer, undoing any
        // read that never reached the output.
        if in_caps.contains(StreamCaps::SEEK) {
            let _ = ops_in.seek(inp, SeekFrom::Start(start_in + bytes));
        }
        if out_caps.contains(StreamCaps::SEEK) {
            let _ = ops_out.seek(out, SeekFrom::Start(start_out + bytes));
        }
        return Err(err.unwrap_or(VfsError::WouldBlock));
    }

    // Mapped transfers never moved the cursors; sync them now.
    if do_mapi && in_caps.contains(StreamCaps::SEEK) {
        let _ = ops_in.seek(inp, SeekFrom::Start(offi));
    }
    if do_mapo && out_caps.contains(StreamCaps::SEEK) {
        let _ = ops_out.seek(out, SeekFrom::Start(offo));
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use crate::fs::FsType;
    use nix::errno::Errno;

    struct StreamState {
        data: Mutex<Vec<u8>>,
        pos: Mutex<u64>,
        // None means writes always succeed.
        fail_after_writes: Option<usize>,
        writes_done: AtomicUsize,
        blocking_log: Mutex<Vec<bool>>,
    }

    impl StreamState {
        fn new(data: &[u8]) -> Self {
            StreamState {
                data: Mutex::new(data.to_vec()),
                pos: Mutex::new(0),
                fail_after_writes: None,
                writes_done: AtomicUsize::new(0),
                blocking_log: Mutex::new(Vec::new()),
            }
        }

        fn failing_after(writes: usize) -> Self {
            let mut s = Self::new(b"");
            s.fail_after_writes = Some(writes);
            s
        }
    }

    struct BufferOps {
        caps: StreamCaps,
    }

    impl BufferOps {
        fn state<'a>(&self, h: &'a VfsHandle) -> &'a StreamState {
            h.data_as::<StreamState>().unwrap()
        }
    }

    impl StreamOps for BufferOps {
        fn caps(&self) -> StreamCaps {
            self.caps
        }

        fn read(&self, h: &VfsHandle, buf: &mut [u8]) -> Result<usize> {
            let state = self.state(h);
            let data = state.data.lock().unwrap();
            let mut pos = state.pos.lock().unwrap();
            let start = min(*pos as usize, data.len());
            let n = min(buf.len(), data.len() - start);
            buf[..n].copy_from_slice(&data[start..start + n]);
            *pos += n as u64;
            Ok(n)
        }

        fn write(&self, h: &VfsHandle, buf: &[u8]) -> Result<usize> {
            let state = self.state(h);
            if let Some(limit) = state.fail_after_writes {
                if state.writes_done.fetch_add(1, Ordering::SeqCst) >= limit {
                    return Err(VfsError::Errno(Errno::EIO));
                }
            }
            let mut data = state.data.lock().unwrap();
            let mut pos = state.pos.lock().unwrap();
            let end = *pos as usize + buf.len();
            if data.len() < end {
                data.resize(end, 0);
            }
            data[*pos as usize..end].copy_from_slice(buf);
            *pos = end as u64;
            Ok(buf.len())
        }

        fn seek(&self, h: &VfsHandle, pos: SeekFrom) -> Result<u64> {
            let state = self.state(h);
            let len = state.data.lock().unwrap().len() as i64;
            let mut cur = state.pos.lock().unwrap();
            let next = match pos {
                SeekFrom::Start(o) => o as i64,
                SeekFrom::Current(d) => *cur as i64 + d,
                SeekFrom::End(d) => len + d,
            };
            if next < 0 {
                return Err(VfsError::InvalidArgument("seek before start".to_string()));
            }
            *cur = next as u64;
            Ok(*cur)
        }

        fn poll_size(&self, h: &VfsHandle) -> Result<u64> {
            Ok(self.state(h).data.lock().unwrap().len() as u64)
        }

        fn set_blocking(&self, h: &VfsHandle, blocking: bool) -> Result<()> {
            self.state(h).blocking_log.lock().unwrap().push(blocking);
            Ok(())
        }
    }

    fn buffer_handle(caps: StreamCaps, flags: OpenFlags, state: StreamState) -> VfsHandle {
        let fs = Arc::new(FsType::new(
            "buffer",
            None,
            Some(Arc::new(BufferOps { caps })),
        ));
        VfsHandle::new(fs, None, "/buffer", flags, Box::new(state))
    }

    const RW_SEEK: StreamCaps = StreamCaps::READ
        .union(StreamCaps::WRITE)
        .union(StreamCaps::SEEK);

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_buffered_copy_bounded() {
        let src_data = pattern(5000);
        let src = buffer_handle(RW_SEEK, OpenFlags::empty(), StreamState::new(&src_data));
        let dst = buffer_handle(RW_SEEK, OpenFlags::empty(), StreamState::new(b""));

        let n = handle_copy(&src, None, &dst, Some(5000)).unwrap();
        assert_eq!(n, 5000);
        assert_eq!(*dst.data_as::<StreamState>().unwrap().data.lock().unwrap(), src_data);
        // Plain I/O advanced both cursors.
        assert_eq!(*src.data_as::<StreamState>().unwrap().pos.lock().unwrap(), 5000);
        assert_eq!(*dst.data_as::<StreamState>().unwrap().pos.lock().unwrap(), 5000);
    }

    #[test]
    fn test_buffered_copy_unbounded_stops_at_eof() {
        let src_data = pattern(3000);
        let src = buffer_handle(RW_SEEK, OpenFlags::empty(), StreamState::new(&src_data));
        let dst = buffer_handle(RW_SEEK, OpenFlags::empty(), StreamState::new(b""));

        let n = handle_copy(&src, None, &dst, None).unwrap();
        assert_eq!(n, 3000);
        assert_eq!(*dst.data_as::<StreamState>().unwrap().data.lock().unwrap(), src_data);
    }

    #[test]
    fn test_zero_count_copies_nothing() {
        let src = buffer_handle(RW_SEEK, OpenFlags::empty(), StreamState::new(b"abc"));
        let dst = buffer_handle(RW_SEEK, OpenFlags::empty(), StreamState::new(b""));
        assert_eq!(handle_copy(&src, None, &dst, Some(0)).unwrap(), 0);
        assert!(dst.data_as::<StreamState>().unwrap().data.lock().unwrap().is_empty());
    }

    #[test]
    fn test_bounded_copy_past_eof_reports_would_block() {
        let src_data = pattern(1000);
        let src = buffer_handle(RW_SEEK, OpenFlags::empty(), StreamState::new(&src_data));
        let dst = buffer_handle(RW_SEEK, OpenFlags::empty(), StreamState::new(b""));

        let err = handle_copy(&src, None, &dst, Some(1500)).unwrap_err();
        assert!(matches!(err, VfsError::WouldBlock));
        // The partial transfer is kept and both cursors sit after it.
        assert_eq!(*dst.data_as::<StreamState>().unwrap().data.lock().unwrap(), src_data);
        assert_eq!(*src.data_as::<StreamState>().unwrap().pos.lock().unwrap(), 1000);
        assert_eq!(*dst.data_as::<StreamState>().unwrap().pos.lock().unwrap(), 1000);
    }

    #[test]
    fn test_count_near_max_demotes_output_mapping() {
        let src_data = pattern(100);
        let src = buffer_handle(RW_SEEK, OpenFlags::empty(), StreamState::new(&src_data));
        // Mappable output positioned past the start, so the mapping size
        // check adds the cursor to the requested count.
        let dst_state = StreamState::new(&[0u8; 16]);
        *dst_state.pos.lock().unwrap() = 16;
        let dst = buffer_handle(
            RW_SEEK | StreamCaps::MMAP | StreamCaps::POLL,
            OpenFlags::empty(),
            dst_state,
        );

        let err = handle_copy(&src, None, &dst, Some(u64::MAX)).unwrap_err();
        assert!(matches!(err, VfsError::WouldBlock));
        // The copy fell back to plain writes and moved everything.
        let dst_state = dst.data_as::<StreamState>().unwrap();
        assert_eq!(dst_state.data.lock().unwrap()[16..], src_data[..]);
        assert_eq!(*dst_state.pos.lock().unwrap(), 116);
        assert_eq!(*src.data_as::<StreamState>().unwrap().pos.lock().unwrap(), 100);
    }

    #[test]
    fn test_write_error_keeps_partial_progress() {
        let src_data = pattern(5000);
        let src = buffer_handle(RW_SEEK, OpenFlags::empty(), StreamState::new(&src_data));
        let dst = buffer_handle(
            RW_SEEK,
            OpenFlags::empty(),
            StreamState::failing_after(1),
        );

        let err = handle_copy(&src, None, &dst, Some(5000)).unwrap_err();
        assert!(matches!(err, VfsError::Errno(Errno::EIO)));
        let dst_state = dst.data_as::<StreamState>().unwrap();
        assert_eq!(*dst_state.data.lock().unwrap(), src_data[..2048].to_vec());
        assert_eq!(*dst_state.pos.lock().unwrap(), 2048);
        assert_eq!(*src.data_as::<StreamState>().unwrap().pos.lock().unwrap(), 2048);
    }

    #[test]
    fn test_explicit_input_offset() {
        let src_data = pattern(100);
        let src = buffer_handle(RW_SEEK, OpenFlags::empty(), StreamState::new(&src_data));
        let dst = buffer_handle(RW_SEEK, OpenFlags::empty(), StreamState::new(b""));

        let n = handle_copy(&src, Some(40), &dst, Some(60)).unwrap();
        assert_eq!(n, 60);
        assert_eq!(
            *dst.data_as::<StreamState>().unwrap().data.lock().unwrap(),
            src_data[40..].to_vec()
        );
    }

    #[test]
    fn test_input_offset_requires_seek() {
        let caps = StreamCaps::READ | StreamCaps::WRITE;
        let src = buffer_handle(caps, OpenFlags::empty(), StreamState::new(b"abc"));
        let dst = buffer_handle(caps, OpenFlags::empty(), StreamState::new(b""));
        let err = handle_copy(&src, Some(1), &dst, None).unwrap_err();
        assert!(matches!(err, VfsError::AccessDenied(_)));
    }

    #[test]
    fn test_nonblock_demoted_and_restored_on_success() {
        let caps = RW_SEEK | StreamCaps::SET_BLOCKING;
        let src = buffer_handle(caps, OpenFlags::NONBLOCK, StreamState::new(&pattern(10)));
        let dst = buffer_handle(caps, OpenFlags::empty(), StreamState::new(b""));

        handle_copy(&src, None, &dst, Some(10)).unwrap();

        assert!(src.flags().contains(OpenFlags::NONBLOCK));
        let log = src.data_as::<StreamState>().unwrap().blocking_log.lock().unwrap().clone();
        assert_eq!(log, vec![true, false]);
        // The output never carried the flag, so it was never touched.
        assert!(dst.data_as::<StreamState>().unwrap().blocking_log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_nonblock_restored_on_error() {
        let caps = RW_SEEK | StreamCaps::SET_BLOCKING;
        let src = buffer_handle(caps, OpenFlags::NONBLOCK, StreamState::new(&pattern(100)));
        let dst = buffer_handle(caps, OpenFlags::NONBLOCK, StreamState::failing_after(0));

        let err = handle_copy(&src, None, &dst, Some(100)).unwrap_err();
        assert!(matches!(err, VfsError::Errno(Errno::EIO)));
        assert!(src.flags().contains(OpenFlags::NONBLOCK));
        assert!(dst.flags().contains(OpenFlags::NONBLOCK));
        assert_eq!(
            *src.data_as::<StreamState>().unwrap().blocking_log.lock().unwrap(),
            vec![true, false]
        );
    }

    #[test]
    fn test_missing_stream_ops_rejected() {
        let fs = Arc::new(FsType::new("null", None, None));
        let src = VfsHandle::new(fs.clone(), None, "/x", OpenFlags::empty(), Box::new(()));
        let dst = VfsHandle::new(fs, None, "/y", OpenFlags::empty(), Box::new(()));
        let err = handle_copy(&src, None, &dst, None).unwrap_err();
        assert!(matches!(err, VfsError::AccessDenied(_)));
    }
}
