//! Per-read count profiles.
//!
//! A profile lists, for one read, the count of the canonical k-mer at
//! every position. Counts are stored var-byte encoded: the first count
//! absolute, every following count as a zig-zag delta from its
//! predecessor, so a run of equal counts costs one byte per position.
//!
//! During sorting each bucket appends one fragment per super-mer
//! instance to a thread x bucket fragment file. Fragments are keyed by
//! `(run, first_pos)`; because super-mers are emitted in read order and
//! run indices grow monotonically per thread, every fragment file is
//! already sorted by that key. The merger performs an NPARTS-way merge
//! per thread, stitches each run's fragments back into one count
//! vector, and writes the per-thread output shard.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{FastkError, Result};
use crate::pipeline::TempLayout;
use crate::scheme::Scheme;

#[inline]
fn zigzag(v: i32) -> u32 {
    ((v << 1) ^ (v >> 31)) as u32
}

#[inline]
fn unzigzag(v: u32) -> i32 {
    ((v >> 1) as i32) ^ -((v & 1) as i32)
}

fn push_varbyte(out: &mut Vec<u8>, mut v: u32) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            out.push(byte | 0x80);
        } else {
            out.push(byte);
            break;
        }
    }
}

fn read_varbyte(bytes: &[u8], pos: &mut usize) -> Result<u32> {
    let mut v = 0u32;
    let mut shift = 0;
    loop {
        let &b = bytes
            .get(*pos)
            .ok_or_else(|| FastkError::invariant("truncated var-byte stream"))?;
        *pos += 1;
        v |= ((b & 0x7f) as u32) << shift;
        if b & 0x80 == 0 {
            return Ok(v);
        }
        shift += 7;
        if shift > 28 {
            return Err(FastkError::invariant("var-byte value overflows u32"));
        }
    }
}

/// Encode a count vector (first absolute, then zig-zag deltas).
pub fn encode_counts(counts: &[u16], out: &mut Vec<u8>) {
    out.clear();
    let Some((&first, rest)) = counts.split_first() else {
        return;
    };
    push_varbyte(out, first as u32);
    let mut prev = first as i32;
    for &c in rest {
        push_varbyte(out, zigzag(c as i32 - prev));
        prev = c as i32;
    }
}

/// Decode a count vector produced by [`encode_counts`].
pub fn decode_counts(bytes: &[u8], out: &mut Vec<u16>) -> Result<()> {
    out.clear();
    if bytes.is_empty() {
        return Ok(());
    }
    let mut pos = 0;
    let first = read_varbyte(bytes, &mut pos)?;
    if first > u16::MAX as u32 {
        return Err(FastkError::invariant("profile count out of range"));
    }
    out.push(first as u16);
    let mut prev = first as i32;
    while pos < bytes.len() {
        let delta = unzigzag(read_varbyte(bytes, &mut pos)?);
        prev += delta;
        if !(0..=u16::MAX as i32).contains(&prev) {
            return Err(FastkError::invariant("profile count out of range"));
        }
        out.push(prev as u16);
    }
    Ok(())
}

struct Frag {
    run: u64,
    first_pos: u32,
    payload: Vec<u8>,
}

struct FragCursor {
    reader: BufReader<File>,
    path: PathBuf,
    run_bytes: usize,
    plen_bytes: usize,
    next: Option<Frag>,
}

impl FragCursor {
    fn open(path: PathBuf, scheme: &Scheme) -> Result<Self> {
        let file = File::open(&path).map_err(|e| FastkError::io(&path, "open", e))?;
        let mut cursor = Self {
            reader: BufReader::with_capacity(1 << 16, file),
            path,
            run_bytes: scheme.run_bytes,
            plen_bytes: scheme.plen_bytes,
            next: None,
        };
        cursor.advance()?;
        Ok(cursor)
    }

    fn advance(&mut self) -> Result<()> {
        let mut head = [0u8; 24];
        let head_len = self.run_bytes + 4 + self.plen_bytes;
        match read_full(&mut self.reader, &mut head[..head_len]) {
            Ok(false) => {
                self.next = None;
                return Ok(());
            }
            Ok(true) => {}
            Err(e) => return Err(FastkError::io(&self.path, "read", e)),
        }
        let mut run = 0u64;
        for (i, &b) in head[..self.run_bytes].iter().enumerate() {
            run |= (b as u64) << (8 * i);
        }
        let first_pos = u32::from_le_bytes(
            head[self.run_bytes..self.run_bytes + 4]
                .try_into()
                .map_err(|_| FastkError::invariant("bad fragment header"))?,
        );
        let mut plen = 0usize;
        for (i, &b) in head[self.run_bytes + 4..head_len].iter().enumerate() {
            plen |= (b as usize) << (8 * i);
        }
        let mut payload = vec![0u8; plen];
        self.reader
            .read_exact(&mut payload)
            .map_err(|e| FastkError::io(&self.path, "read", e))?;
        self.next = Some(Frag {
            run,
            first_pos,
            payload,
        });
        Ok(())
    }
}

/// Read exactly `buf.len()` bytes; `Ok(false)` on clean EOF at a record
/// boundary.
pub(crate) fn read_full(r: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    let mut n = 0;
    while n < buf.len() {
        let m = r.read(&mut buf[n..])?;
        if m == 0 {
            if n == 0 {
                return Ok(false);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated record",
            ));
        }
        n += m;
    }
    Ok(true)
}

/// Merge every thread's fragment files into the final profile output.
///
/// Returns the number of reads (runs) written across all shards.
pub fn merge_profiles(
    scheme: &Scheme,
    layout: &TempLayout,
    out_dir: &Path,
    root: &str,
    nthreads: usize,
    nruns: &[u64],
) -> Result<u64> {
    let mut total = 0u64;
    for t in 0..nthreads {
        total += merge_thread(scheme, layout, out_dir, root, t, nruns[t])?;
    }

    let stub_path = out_dir.join(format!("{root}.prof"));
    let mut stub = BufWriter::new(
        File::create(&stub_path).map_err(|e| FastkError::io(&stub_path, "create", e))?,
    );
    stub.write_all(&(scheme.kmer as i32).to_le_bytes())
        .and_then(|_| stub.write_all(&(nthreads as i32).to_le_bytes()))
        .and_then(|_| stub.flush())
        .map_err(|e| FastkError::io(&stub_path, "write", e))?;

    info!("wrote {} read profiles to {}", total, stub_path.display());
    Ok(total)
}

fn merge_thread(
    scheme: &Scheme,
    layout: &TempLayout,
    out_dir: &Path,
    root: &str,
    t: usize,
    nruns: u64,
) -> Result<u64> {
    let mut cursors = Vec::with_capacity(scheme.nparts);
    for b in 0..scheme.nparts {
        cursors.push(FragCursor::open(layout.frag(t, b), scheme)?);
    }

    let mut heap = BinaryHeap::new();
    for (b, c) in cursors.iter().enumerate() {
        if let Some(f) = &c.next {
            heap.push(Reverse((f.run, f.first_pos, b)));
        }
    }

    let data_path = layout.prof_data(t);
    let mut data = BufWriter::new(
        File::create(&data_path).map_err(|e| FastkError::io(&data_path, "create", e))?,
    );
    let mut offsets: Vec<i64> = Vec::with_capacity(nruns as usize + 1);
    offsets.push(0);
    let mut off = 0i64;

    let mut cur_run = 0u64;
    let mut counts: Vec<u16> = Vec::new();
    let mut scratch: Vec<u16> = Vec::new();
    let mut enc: Vec<u8> = Vec::new();

    while let Some(Reverse((run, pos, b))) = heap.pop() {
        let frag = cursors[b]
            .next
            .take()
            .ok_or_else(|| FastkError::invariant("fragment cursor out of sync"))?;
        if run != cur_run {
            if cur_run != 0 {
                encode_counts(&counts, &mut enc);
                data.write_all(&enc)
                    .map_err(|e| FastkError::io(&data_path, "write", e))?;
                off += enc.len() as i64;
                offsets.push(off);
                counts.clear();
            }
            if run != cur_run + 1 {
                return Err(FastkError::invariant(format!(
                    "profile run index gap: {cur_run} -> {run}"
                )));
            }
            cur_run = run;
        }
        if pos as usize != counts.len() {
            return Err(FastkError::invariant(format!(
                "profile fragment gap in run {run}: position {pos} after {} counts",
                counts.len()
            )));
        }
        decode_counts(&frag.payload, &mut scratch)?;
        counts.extend_from_slice(&scratch);

        cursors[b].advance()?;
        if let Some(f) = &cursors[b].next {
            heap.push(Reverse((f.run, f.first_pos, b)));
        }
    }
    if cur_run != 0 {
        encode_counts(&counts, &mut enc);
        data.write_all(&enc)
            .map_err(|e| FastkError::io(&data_path, "write", e))?;
        off += enc.len() as i64;
        offsets.push(off);
    }
    if cur_run != nruns {
        return Err(FastkError::invariant(format!(
            "thread {t} produced profiles for {cur_run} of {nruns} runs"
        )));
    }
    data.flush()
        .map_err(|e| FastkError::io(&data_path, "write", e))?;
    drop(data);

    let shard_path = out_dir.join(format!(".{root}.prof.{}", t + 1));
    let mut shard = BufWriter::new(
        File::create(&shard_path).map_err(|e| FastkError::io(&shard_path, "create", e))?,
    );
    shard
        .write_all(&(nruns as i64).to_le_bytes())
        .map_err(|e| FastkError::io(&shard_path, "write", e))?;
    for o in &offsets {
        shard
            .write_all(&o.to_le_bytes())
            .map_err(|e| FastkError::io(&shard_path, "write", e))?;
    }
    let mut data_in =
        File::open(&data_path).map_err(|e| FastkError::io(&data_path, "open", e))?;
    io::copy(&mut data_in, &mut shard).map_err(|e| FastkError::io(&shard_path, "write", e))?;
    shard
        .flush()
        .map_err(|e| FastkError::io(&shard_path, "write", e))?;
    fs::remove_file(&data_path).map_err(|e| FastkError::io(&data_path, "unlink", e))?;

    Ok(nruns)
}

/// Load every read profile from a stub file, shards concatenated in
/// thread order. Intended for tests and small outputs.
pub fn read_profiles(stub_path: &Path) -> Result<Vec<Vec<u16>>> {
    let mut stub = File::open(stub_path).map_err(|e| FastkError::io(stub_path, "open", e))?;
    let mut head = [0u8; 8];
    stub.read_exact(&mut head)
        .map_err(|e| FastkError::io(stub_path, "read", e))?;
    let nthreads = i32::from_le_bytes(head[4..8].try_into().unwrap_or_default());

    let dir = stub_path.parent().unwrap_or(Path::new("."));
    let name = stub_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| FastkError::config("profile stub has no file name"))?;

    let mut profiles = Vec::new();
    for t in 1..=nthreads {
        let shard_path = dir.join(format!(".{name}.{t}"));
        let mut bytes = Vec::new();
        File::open(&shard_path)
            .map_err(|e| FastkError::io(&shard_path, "open", e))?
            .read_to_end(&mut bytes)
            .map_err(|e| FastkError::io(&shard_path, "read", e))?;
        let nreads = i64::from_le_bytes(
            bytes
                .get(..8)
                .ok_or_else(|| FastkError::invariant("short profile shard"))?
                .try_into()
                .unwrap_or_default(),
        ) as usize;
        let table_end = 8 + (nreads + 1) * 8;
        let mut offsets = Vec::with_capacity(nreads + 1);
        for i in 0..=nreads {
            let at = 8 + i * 8;
            offsets.push(i64::from_le_bytes(
                bytes
                    .get(at..at + 8)
                    .ok_or_else(|| FastkError::invariant("short profile shard"))?
                    .try_into()
                    .unwrap_or_default(),
            ) as usize);
        }
        for i in 0..nreads {
            let seg = bytes
                .get(table_end + offsets[i]..table_end + offsets[i + 1])
                .ok_or_else(|| FastkError::invariant("short profile shard"))?;
            let mut counts = Vec::new();
            decode_counts(seg, &mut counts)?;
            profiles.push(counts);
        }
    }
    Ok(profiles)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_roundtrip() {
        let cases: Vec<Vec<u16>> = vec![
            vec![1],
            vec![5, 5, 5, 5],
            vec![1, 2, 3, 2, 1],
            vec![65535, 0, 65535],
            vec![300; 17],
        ];
        let mut enc = Vec::new();
        let mut dec = Vec::new();
        for counts in cases {
            encode_counts(&counts, &mut enc);
            decode_counts(&enc, &mut dec).unwrap();
            assert_eq!(dec, counts);
        }
    }

    #[test]
    fn test_equal_run_costs_one_byte_each() {
        let counts = vec![7u16; 50];
        let mut enc = Vec::new();
        encode_counts(&counts, &mut enc);
        // First count is one var-byte, every repeat a zero delta byte.
        assert_eq!(enc.len(), 50);
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let counts = vec![1000u16, 2000, 3000];
        let mut enc = Vec::new();
        encode_counts(&counts, &mut enc);
        let mut dec = Vec::new();
        assert!(decode_counts(&enc[..enc.len() - 1], &mut dec).is_err());
    }

    #[test]
    fn test_zigzag() {
        for v in [-70000, -1, 0, 1, 65535] {
            assert_eq!(unzigzag(zigzag(v)), v);
        }
    }

    #[test]
    fn test_read_full_eof() {
        let data = [1u8, 2, 3, 4];
        let mut r = &data[..];
        let mut buf = [0u8; 4];
        assert!(read_full(&mut r, &mut buf).unwrap());
        assert!(!read_full(&mut r, &mut buf).unwrap());
        let mut r = &data[..2];
        assert!(read_full(&mut r, &mut buf).is_err());
    }
}
